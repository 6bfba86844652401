//! Finds and kills pending jobs that no worker could ever run

use gridscale::models::{InstanceDescriptor, Job, Supply};
use itertools::Itertools;
use std::sync::Arc;
use tracing::{Level, event, instrument};

use super::engines::{AllocationRules, BatchEngine};

/// The largest capacity the cluster could ever offer a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ceilings {
    /// The supply of every instance type that can be launched
    instances: Vec<Supply>,
    /// The supply of every static host plus a full pool of the biggest workers
    cluster: Supply,
}

impl Ceilings {
    /// Build the ceilings for a cluster
    ///
    /// # Arguments
    ///
    /// * `instances` - The instance types that can be launched
    /// * `static_supply` - The total supply of the static hosts
    /// * `max_hosts` - The most elastic hosts that can be launched
    #[must_use]
    pub fn new(instances: &[InstanceDescriptor], static_supply: Supply, max_hosts: u64) -> Self {
        let instances = instances
            .iter()
            .map(InstanceDescriptor::supply)
            .collect::<Vec<Supply>>();
        // take the biggest instance in each dimension
        let biggest = instances.iter().fold(Supply::default(), |biggest, supply| Supply {
            cpu: biggest.cpu.max(supply.cpu),
            gpu: biggest.gpu.max(supply.gpu),
            mem: biggest.mem.max(supply.mem),
        });
        Ceilings {
            instances,
            cluster: static_supply + biggest.times(max_hosts),
        }
    }

    /// Check whether a job could ever run in this cluster
    ///
    /// # Arguments
    ///
    /// * `job` - The job to check
    /// * `rules` - The allocation rules for our jobs
    #[must_use]
    pub fn admits(&self, job: &Job, rules: &AllocationRules) -> bool {
        let rule = rules.get(&job.pe).copied().unwrap_or_default();
        let demand = job.demand(rule.demand_kind());
        if rule.is_integral() {
            // integral jobs must fit on a single instance
            self.instances
                .iter()
                .any(|supply| !demand.exceeds(supply))
        } else {
            !demand.exceeds(&self.cluster)
        }
    }
}

/// Validates pending jobs against what the cluster can offer
pub struct JobValidator {
    /// The batch engine to kill invalid jobs in
    engine: Arc<dyn BatchEngine>,
}

impl JobValidator {
    /// Create a new job validator
    ///
    /// # Arguments
    ///
    /// * `engine` - The batch engine to kill invalid jobs in
    pub fn new(engine: Arc<dyn BatchEngine>) -> Self {
        JobValidator { engine }
    }

    /// Split jobs into the ones that could run and the ones that never will
    ///
    /// Without any instance types to judge against every job is valid.
    ///
    /// # Arguments
    ///
    /// * `jobs` - The jobs to split
    /// * `rules` - The allocation rules for our jobs
    /// * `ceilings` - The largest capacity the cluster could offer
    #[must_use]
    pub fn partition(
        jobs: Vec<Job>,
        rules: &AllocationRules,
        ceilings: &Ceilings,
    ) -> (Vec<Job>, Vec<Job>) {
        if ceilings.instances.is_empty() {
            event!(Level::WARN, msg = "No instance types to validate jobs against");
            return (jobs, Vec::default());
        }
        jobs.into_iter()
            .partition(|job| ceilings.admits(job, rules))
    }

    /// Validate jobs and kill the ones that can never run
    ///
    /// Killing is best effort and a failed kill is only logged.
    ///
    /// # Arguments
    ///
    /// * `jobs` - The jobs to validate
    /// * `rules` - The allocation rules for our jobs
    /// * `ceilings` - The largest capacity the cluster could offer
    #[instrument(name = "JobValidator::validate", skip_all)]
    pub async fn validate(
        &self,
        jobs: Vec<Job>,
        rules: &AllocationRules,
        ceilings: &Ceilings,
    ) -> (Vec<Job>, Vec<Job>) {
        let (valid, invalid) = Self::partition(jobs, rules, ceilings);
        if !invalid.is_empty() {
            let ids = invalid.iter().map(|job| job.id.as_str()).join(",");
            event!(Level::WARN, msg = "Killing jobs that can never run", jobs = &ids);
            if let Err(error) = self.engine.kill_jobs(&invalid, true).await {
                event!(Level::ERROR, msg = "Failed to kill invalid jobs", jobs = &ids, error = error.to_string());
            }
        }
        (valid, invalid)
    }
}
