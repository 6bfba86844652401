//! Abstracts the batch engines we can scale workers for
//!
//! Currently we support SGE and SLURM.

use gridscale::conf::EngineKind;
use gridscale::models::{AllocationRule, Job, Supply};
use gridscale::{Conf, Error};
use std::collections::HashMap;
use std::sync::Arc;

pub mod dry_run;
mod sge;
mod slurm;

pub use dry_run::DryRunEngine;
pub use sge::Sge;
pub use slurm::Slurm;

use super::executor::Executor;

/// The allocation rules for each allocation environment we have looked up
pub type AllocationRules = HashMap<String, AllocationRule>;

/// The methods required to drive a batch engine
#[async_trait::async_trait]
pub trait BatchEngine: Send + Sync {
    /// The kind of engine this is
    fn kind(&self) -> EngineKind;

    /// List all jobs in this engine
    async fn try_list_jobs(&self) -> Result<Vec<Job>, Error>;

    /// List all jobs in this engine
    ///
    /// Failing to list jobs at all is logged and treated as no jobs. Only use
    /// this where an empty listing can never lead to removing a host.
    async fn list_jobs(&self) -> Vec<Job> {
        match self.try_list_jobs().await {
            Ok(jobs) => jobs,
            Err(error) => {
                // a failed listing is retried next tick
                tracing::event!(
                    tracing::Level::ERROR,
                    msg = "Failed to list jobs",
                    error = error.to_string()
                );
                Vec::default()
            }
        }
    }

    /// Allow new jobs to be scheduled on a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to enable
    async fn enable_host(&self, host: &str) -> Result<(), Error>;

    /// Stop new jobs from being scheduled on a host
    ///
    /// Jobs already running on this host are not affected.
    ///
    /// # Arguments
    ///
    /// * `host` - The host to disable
    async fn disable_host(&self, host: &str) -> Result<(), Error>;

    /// Remove a host from this engine entirely
    ///
    /// # Arguments
    ///
    /// * `host` - The host to remove
    /// * `skip_on_failure` - Whether to keep going when a single teardown step fails
    async fn delete_host(&self, host: &str, skip_on_failure: bool) -> Result<(), Error>;

    /// Get the capacity a host supplies
    ///
    /// # Arguments
    ///
    /// * `host` - The host to get the supply of
    async fn host_supply(&self, host: &str) -> Result<Supply, Error>;

    /// Get the allocation rule for an allocation environment
    ///
    /// # Arguments
    ///
    /// * `pe` - The allocation environment to look up
    async fn allocation_rule(&self, pe: &str) -> Result<AllocationRule, Error>;

    /// Check whether a host is in a healthy state
    ///
    /// # Arguments
    ///
    /// * `host` - The host to check
    async fn is_host_valid(&self, host: &str) -> Result<bool, Error>;

    /// Kill some jobs
    ///
    /// # Arguments
    ///
    /// * `jobs` - The jobs to kill
    /// * `force` - Whether to kill these jobs forcefully
    async fn kill_jobs(&self, jobs: &[Job], force: bool) -> Result<(), Error>;

    /// Get the allocation rules for a set of jobs
    ///
    /// Rules that can't be looked up fall back to the default rule.
    ///
    /// # Arguments
    ///
    /// * `jobs` - The jobs to get allocation rules for
    async fn allocation_rules(&self, jobs: &[Job]) -> AllocationRules {
        let mut rules = AllocationRules::default();
        for job in jobs {
            // only look up each allocation environment once
            if rules.contains_key(&job.pe) {
                continue;
            }
            let rule = match self.allocation_rule(&job.pe).await {
                Ok(rule) => rule,
                Err(error) => {
                    tracing::event!(
                        tracing::Level::WARN,
                        pe = &job.pe,
                        error = error.to_string()
                    );
                    AllocationRule::default()
                }
            };
            rules.insert(job.pe.clone(), rule);
        }
        rules
    }
}

/// Create the batch engine to drive
///
/// # Arguments
///
/// * `conf` - The gridscale config
/// * `executor` - The executor to run engine commands with
/// * `dry_run` - Whether to use an in memory engine instead
pub fn new(conf: &Conf, executor: Arc<dyn Executor>, dry_run: bool) -> Arc<dyn BatchEngine> {
    match (dry_run, conf.autoscaler.engine) {
        // if dry run is true then use the dry run engine
        (true, kind) => Arc::new(DryRunEngine::new(kind)),
        (false, EngineKind::Sge) => Arc::new(Sge::new(&conf.autoscaler, executor)),
        (false, EngineKind::Slurm) => Arc::new(Slurm::new(executor)),
    }
}
