//! An in memory provisioner used for dry runs and tests

use gridscale::models::{InstanceDescriptor, Run, RunStatus, TaskStatus};
use gridscale::Error;
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{Level, event};

use super::{Provisioner, hostname};

/// A pretend run
#[derive(Debug, Clone)]
pub struct DryRunRun {
    /// The instance type this run was launched on
    pub instance: String,
    /// The user this run was launched for
    pub owner: Option<String>,
    /// The status of this run
    pub status: RunStatus,
    /// How many more status polls until this run has a network identity
    pub network_polls: u64,
    /// How many more status polls until this run is initialized
    pub init_polls: u64,
    /// The tags set on this run
    pub tags: HashMap<String, String>,
}

/// The pretend state of a dry run cloud
#[derive(Debug)]
pub struct DryRunCloud {
    /// The id to give the next run
    pub next_id: u64,
    /// The instance types that can be launched
    pub instances: Vec<InstanceDescriptor>,
    /// The runs that were launched
    pub runs: HashMap<u64, DryRunRun>,
    /// The instance types that fail to launch
    pub fail_launches: HashSet<String>,
    /// The status new runs end up in
    pub launch_status: RunStatus,
    /// How many polls new runs take to get a network identity
    pub network_polls: u64,
    /// How many polls new runs take to initialize
    pub init_polls: u64,
    /// The runs that have been stopped
    pub stopped: Vec<u64>,
}

/// A provisioner that only lives in memory
#[derive(Debug)]
pub struct DryRunProvisioner {
    /// The state of our pretend cloud
    cloud: Mutex<DryRunCloud>,
}

impl DryRunProvisioner {
    /// Create a new dry run provisioner
    ///
    /// # Arguments
    ///
    /// * `instances` - The instance types that can be launched
    #[must_use]
    pub fn new(instances: Vec<InstanceDescriptor>) -> Self {
        let cloud = DryRunCloud {
            next_id: 1000,
            instances,
            runs: HashMap::default(),
            fail_launches: HashSet::default(),
            launch_status: RunStatus::Running,
            network_polls: 0,
            init_polls: 0,
            stopped: Vec::default(),
        };
        DryRunProvisioner {
            cloud: Mutex::new(cloud),
        }
    }

    /// Get mutable access to the state of our pretend cloud
    pub async fn cloud(&self) -> MutexGuard<'_, DryRunCloud> {
        self.cloud.lock().await
    }

    /// Make an instance type fail to launch
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance type to fail
    pub async fn fail_launches(&self, instance: &str) {
        self.cloud
            .lock()
            .await
            .fail_launches
            .insert(instance.to_owned());
    }

    /// Get the tags set on a run
    ///
    /// # Arguments
    ///
    /// * `run` - The run to get tags for
    pub async fn tags(&self, run: u64) -> HashMap<String, String> {
        self.cloud
            .lock()
            .await
            .runs
            .get(&run)
            .map(|run| run.tags.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Provisioner for DryRunProvisioner {
    async fn launch(
        &self,
        instance: &InstanceDescriptor,
        owner: Option<&str>,
        _params: &HashMap<String, String>,
    ) -> Result<u64, Error> {
        let mut cloud = self.cloud.lock().await;
        if cloud.fail_launches.contains(&instance.name) {
            return Err(Error::Api {
                code: 409,
                msg: Some(format!("Insufficient capacity for {}", instance.name)),
            });
        }
        let id = cloud.next_id;
        cloud.next_id += 1;
        let run = DryRunRun {
            instance: instance.name.clone(),
            owner: owner.map(str::to_owned),
            status: cloud.launch_status,
            network_polls: cloud.network_polls,
            init_polls: cloud.init_polls,
            tags: HashMap::default(),
        };
        cloud.runs.insert(id, run);
        event!(Level::INFO, dry_run = true, run = id, instance = &instance.name);
        Ok(id)
    }

    async fn status(&self, id: u64) -> Result<Run, Error> {
        let mut cloud = self.cloud.lock().await;
        let Some(run) = cloud.runs.get_mut(&id) else {
            return Err(Error::Api {
                code: 404,
                msg: Some(format!("Run {id} not found")),
            });
        };
        // count down until this run has a network identity
        let networked = if run.network_polls > 0 {
            run.network_polls -= 1;
            false
        } else {
            true
        };
        // only count down initialization once we are networked
        let initialized = if !networked {
            false
        } else if run.init_polls > 0 {
            run.init_polls -= 1;
            false
        } else {
            true
        };
        Ok(Run {
            id,
            status: run.status,
            hostname: networked.then(|| hostname(id)),
            pod_ip: networked.then(|| format!("10.0.{}.{}", id / 256 % 256, id % 256)),
            initialized,
        })
    }

    async fn task_status(&self, id: u64, _task: &str) -> Result<Option<TaskStatus>, Error> {
        let cloud = self.cloud.lock().await;
        // the bootstrap task succeeds once the run is initialized
        Ok(cloud.runs.get(&id).and_then(|run| {
            (run.network_polls == 0 && run.init_polls == 0).then_some(TaskStatus::Success)
        }))
    }

    async fn stop(&self, id: u64) -> Result<(), Error> {
        let mut cloud = self.cloud.lock().await;
        if let Some(run) = cloud.runs.get_mut(&id) {
            run.status = RunStatus::Stopped;
        }
        cloud.stopped.push(id);
        Ok(())
    }

    async fn instance_types(&self) -> Result<Vec<InstanceDescriptor>, Error> {
        Ok(self.cloud.lock().await.instances.clone())
    }

    async fn tag(&self, id: u64, key: &str, value: &str) -> Result<(), Error> {
        let mut cloud = self.cloud.lock().await;
        if let Some(run) = cloud.runs.get_mut(&id) {
            run.tags.insert(key.to_owned(), value.to_owned());
        }
        Ok(())
    }
}
