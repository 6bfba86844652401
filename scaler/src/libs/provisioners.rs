//! Abstracts the cloud that launches and stops elastic workers

use gridscale::models::{InstanceDescriptor, Run, TaskStatus};
use gridscale::{Conf, Error};
use std::collections::HashMap;
use std::sync::Arc;

mod cloud;
pub mod dry_run;

pub use cloud::CloudProvisioner;
pub use dry_run::DryRunProvisioner;

/// The prefix every elastic worker hostname starts with
pub const HOST_PREFIX: &str = "pipeline-";

/// Get the hostname a run will have
///
/// # Arguments
///
/// * `run` - The id of the run
#[must_use]
pub fn hostname(run: u64) -> String {
    format!("{HOST_PREFIX}{run}")
}

/// The methods required to launch and manage elastic workers
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    /// Launch a new worker and get the id of its run
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance type to launch
    /// * `owner` - The user this worker is being launched for
    /// * `params` - Any extra parameters to launch this worker with
    async fn launch(
        &self,
        instance: &InstanceDescriptor,
        owner: Option<&str>,
        params: &HashMap<String, String>,
    ) -> Result<u64, Error>;

    /// Get the current state of a run
    ///
    /// # Arguments
    ///
    /// * `run` - The id of the run to check
    async fn status(&self, run: u64) -> Result<Run, Error>;

    /// Get the status of a task in a run if it has started
    ///
    /// # Arguments
    ///
    /// * `run` - The id of the run to check
    /// * `task` - The name of the task to check
    async fn task_status(&self, run: u64, task: &str) -> Result<Option<TaskStatus>, Error>;

    /// Stop a run
    ///
    /// # Arguments
    ///
    /// * `run` - The id of the run to stop
    async fn stop(&self, run: u64) -> Result<(), Error>;

    /// List the instance types that can be launched
    async fn instance_types(&self) -> Result<Vec<InstanceDescriptor>, Error>;

    /// Set a tag on a run
    ///
    /// # Arguments
    ///
    /// * `run` - The id of the run to tag
    /// * `key` - The tag to set
    /// * `value` - The value to set
    async fn tag(&self, run: u64, key: &str, value: &str) -> Result<(), Error>;

    /// Get the run that backs a hostname
    ///
    /// # Arguments
    ///
    /// * `hostname` - The hostname to get the run of
    fn run_of(&self, hostname: &str) -> Option<u64> {
        hostname.strip_prefix(HOST_PREFIX)?.parse::<u64>().ok()
    }
}

/// Create the provisioner to launch workers with
///
/// # Arguments
///
/// * `conf` - The gridscale config
/// * `dry_run` - Whether to use an in memory provisioner instead
pub fn new(conf: &Conf, dry_run: bool) -> Result<Arc<dyn Provisioner>, Error> {
    if dry_run {
        // pretend we can launch the configured instance type
        let instance = InstanceDescriptor::new(&conf.autoscaler.instances.instance_type, 4, 0, 16);
        Ok(Arc::new(DryRunProvisioner::new(vec![instance])))
    } else {
        Ok(Arc::new(CloudProvisioner::new(conf)?))
    }
}
