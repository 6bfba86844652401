//! The utilities for tests involving the scaler

use chrono::prelude::*;
use gridscale::conf::EngineKind;
use gridscale::models::{InstanceDescriptor, Job, JobState};
use gridscale::{Conf, Error};
use std::sync::Arc;

use crate::libs::hosts::HostStore;
use crate::{Autoscaler, Daemon, DryRunEngine, DryRunExecutor, DryRunProvisioner, Handles};

/// Get the m5 family of instance types
#[must_use]
pub fn instances() -> Vec<InstanceDescriptor> {
    vec![
        InstanceDescriptor::new("m5.large", 2, 0, 8),
        InstanceDescriptor::new("m5.xlarge", 4, 0, 16),
        InstanceDescriptor::new("m5.2xlarge", 8, 0, 32),
        InstanceDescriptor::new("m5.4xlarge", 16, 0, 64),
        InstanceDescriptor::new("m5.16xlarge", 64, 0, 256),
    ]
}

/// Build a config that can launch any m5 instance
#[must_use]
pub fn conf() -> Conf {
    let mut conf = Conf::default();
    conf.autoscaler.instances.instance_type = "m5.large".to_owned();
    conf.autoscaler.instances.family = true;
    conf.autoscaler.scale_up_polling_delay = 1;
    conf.autoscaler.scale_up_polling_timeout = 5;
    conf.autoscaler.enable_timeout = 2;
    conf
}

/// Build a job that was submitted some seconds ago
///
/// # Arguments
///
/// * `id` - The id of this job
/// * `state` - The state this job is in
/// * `cpu` - The cpus this job requested
/// * `seconds_ago` - How long ago this job was submitted or started
#[must_use]
pub fn job(id: &str, state: JobState, cpu: u64, seconds_ago: i64) -> Job {
    Job::new(id, "alice", Utc::now() - chrono::Duration::seconds(seconds_ago))
        .state(state)
        .resources(cpu, 0, 1)
}

/// The in memory pieces a dry run autoscaler drives
pub struct Harness {
    /// The pretend batch engine
    pub engine: Arc<DryRunEngine>,
    /// The pretend cloud
    pub provisioner: Arc<DryRunProvisioner>,
    /// Records host resolution edits
    pub executor: Arc<DryRunExecutor>,
    /// The elastic hosts
    pub elastic: Arc<HostStore>,
    /// The static hosts
    pub statics: Arc<HostStore>,
}

impl Harness {
    /// Build a new harness with in memory host stores
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of engine to pretend to be
    #[must_use]
    pub fn new(kind: EngineKind) -> Self {
        Self::with_elastic(kind, HostStore::in_memory())
    }

    /// Build a new harness around an existing elastic store
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of engine to pretend to be
    /// * `elastic` - The elastic host store to use
    #[must_use]
    pub fn with_elastic(kind: EngineKind, elastic: HostStore) -> Self {
        Harness {
            engine: Arc::new(DryRunEngine::new(kind)),
            provisioner: Arc::new(DryRunProvisioner::new(instances())),
            executor: Arc::new(DryRunExecutor::default()),
            elastic: Arc::new(elastic),
            statics: Arc::new(HostStore::in_memory()),
        }
    }

    /// Get the handles for this harness
    #[must_use]
    pub fn handles(&self) -> Handles {
        Handles {
            engine: self.engine.clone(),
            provisioner: self.provisioner.clone(),
            executor: self.executor.clone(),
            elastic: self.elastic.clone(),
            statics: self.statics.clone(),
        }
    }

    /// Build an autoscaler over this harness
    ///
    /// # Arguments
    ///
    /// * `conf` - The config to use
    pub async fn autoscaler(&self, conf: &Conf) -> Result<Autoscaler, Error> {
        Autoscaler::new(conf, self.handles()).await
    }

    /// Build a daemon over this harness
    ///
    /// # Arguments
    ///
    /// * `conf` - The config to use
    pub async fn daemon(&self, conf: Conf) -> Result<Daemon, Error> {
        Daemon::build(conf, self.handles()).await
    }
}
