//! An in memory batch engine used for dry runs and tests

use gridscale::conf::EngineKind;
use gridscale::models::{AllocationRule, Job, JobState, Supply};
use gridscale::Error;
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{Level, event};

use super::BatchEngine;

/// The pretend state of a dry run cluster
#[derive(Debug, Default)]
pub struct DryRunState {
    /// The jobs in this cluster
    pub jobs: Vec<Job>,
    /// The supply of each host
    pub supplies: HashMap<String, Supply>,
    /// The supply of hosts we have no explicit supply for
    pub default_supply: Supply,
    /// The allocation rule of each allocation environment
    pub rules: HashMap<String, AllocationRule>,
    /// The hosts that are in a broken state
    pub invalid: HashSet<String>,
    /// The hosts that currently can't take new jobs
    pub disabled: HashSet<String>,
    /// The hosts that have been enabled
    pub enabled: Vec<String>,
    /// The hosts that have been deleted
    pub deleted: Vec<String>,
    /// The jobs that have been killed
    pub killed: Vec<String>,
    /// Jobs that start running on a host the moment it is disabled
    pub on_disable: HashMap<String, Job>,
    /// The hosts that fail to enable
    pub fail_enable: HashSet<String>,
    /// Whether listing jobs fails
    pub fail_list: bool,
}

/// A batch engine that only lives in memory
#[derive(Debug)]
pub struct DryRunEngine {
    /// The kind of engine we are pretending to be
    kind: EngineKind,
    /// The state of our pretend cluster
    state: Mutex<DryRunState>,
}

impl DryRunEngine {
    /// Create a new empty dry run engine
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of engine to pretend to be
    #[must_use]
    pub fn new(kind: EngineKind) -> Self {
        DryRunEngine {
            kind,
            state: Mutex::new(DryRunState::default()),
        }
    }

    /// Get mutable access to the state of our pretend cluster
    pub async fn state(&self) -> MutexGuard<'_, DryRunState> {
        self.state.lock().await
    }

    /// Replace the jobs in our pretend cluster
    ///
    /// # Arguments
    ///
    /// * `jobs` - The jobs to set
    pub async fn set_jobs(&self, jobs: Vec<Job>) {
        self.state.lock().await.jobs = jobs;
    }

    /// Set the supply of a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to set the supply for
    /// * `supply` - The supply to set
    pub async fn set_supply(&self, host: &str, supply: Supply) {
        self.state
            .lock()
            .await
            .supplies
            .insert(host.to_owned(), supply);
    }

    /// Set the allocation rule for an allocation environment
    ///
    /// # Arguments
    ///
    /// * `pe` - The allocation environment to set a rule for
    /// * `rule` - The rule to set
    pub async fn set_rule(&self, pe: &str, rule: AllocationRule) {
        self.state.lock().await.rules.insert(pe.to_owned(), rule);
    }

    /// Start a job on a host the moment that host is disabled
    ///
    /// # Arguments
    ///
    /// * `host` - The host to watch
    /// * `job` - The job to start running on it
    pub async fn race_on_disable(&self, host: &str, job: Job) {
        self.state
            .lock()
            .await
            .on_disable
            .insert(host.to_owned(), job);
    }
}

#[async_trait::async_trait]
impl BatchEngine for DryRunEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn try_list_jobs(&self) -> Result<Vec<Job>, Error> {
        let state = self.state.lock().await;
        if state.fail_list {
            return Err(Error::execution("list jobs", Some(1), "engine is unreachable"));
        }
        Ok(state.jobs.clone())
    }

    async fn enable_host(&self, host: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.fail_enable.contains(host) {
            return Err(Error::execution(
                format!("enable {host}"),
                Some(1),
                "host is unreachable",
            ));
        }
        state.disabled.remove(host);
        state.enabled.push(host.to_owned());
        event!(Level::INFO, dry_run = true, enabled = host);
        Ok(())
    }

    async fn disable_host(&self, host: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.disabled.insert(host.to_owned());
        // simulate a job being scheduled just before the host was disabled
        if let Some(job) = state.on_disable.remove(host) {
            let job = job.state(JobState::Running).host(host);
            state.jobs.push(job);
        }
        event!(Level::INFO, dry_run = true, disabled = host);
        Ok(())
    }

    async fn delete_host(&self, host: &str, _skip_on_failure: bool) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.disabled.remove(host);
        state.deleted.push(host.to_owned());
        event!(Level::INFO, dry_run = true, deleted = host);
        Ok(())
    }

    async fn host_supply(&self, host: &str) -> Result<Supply, Error> {
        let state = self.state.lock().await;
        Ok(state
            .supplies
            .get(host)
            .copied()
            .unwrap_or(state.default_supply))
    }

    async fn allocation_rule(&self, pe: &str) -> Result<AllocationRule, Error> {
        Ok(self
            .state
            .lock()
            .await
            .rules
            .get(pe)
            .copied()
            .unwrap_or_default())
    }

    async fn is_host_valid(&self, host: &str) -> Result<bool, Error> {
        Ok(!self.state.lock().await.invalid.contains(host))
    }

    async fn kill_jobs(&self, jobs: &[Job], _force: bool) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        for job in jobs {
            state.killed.push(job.id.clone());
        }
        // killed jobs leave the cluster
        state
            .jobs
            .retain(|existing| !jobs.iter().any(|job| job.id == existing.id));
        Ok(())
    }
}
