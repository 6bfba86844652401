//! Retires elastic workers that are no longer needed

use gridscale::Error;
use gridscale::models::{Job, Supply, conversions};
use std::sync::Arc;
use tracing::{Level, event, instrument};

use super::engines::BatchEngine;
use super::hosts::HostStore;
use super::provisioners::Provisioner;
use super::resolver::HostsFile;

/// What happened when we tried to retire a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retirement {
    /// This host is gone
    Retired,
    /// A job landed on this host so it was put back into service
    NotRetired,
}

/// Retires a single elastic host
pub struct ScaleDownHandler {
    /// The batch engine to remove hosts from
    engine: Arc<dyn BatchEngine>,
    /// The cloud to stop runs in
    provisioner: Arc<dyn Provisioner>,
    /// The hosts file to unregister hosts from
    hosts_file: Arc<HostsFile>,
    /// The elastic hosts we manage
    elastic: Arc<HostStore>,
}

impl ScaleDownHandler {
    /// Create a new scale down handler
    ///
    /// # Arguments
    ///
    /// * `engine` - The batch engine to remove hosts from
    /// * `provisioner` - The cloud to stop runs in
    /// * `hosts_file` - The hosts file to unregister hosts from
    /// * `elastic` - The elastic hosts we manage
    pub fn new(
        engine: Arc<dyn BatchEngine>,
        provisioner: Arc<dyn Provisioner>,
        hosts_file: Arc<HostsFile>,
        elastic: Arc<HostStore>,
    ) -> Self {
        ScaleDownHandler {
            engine,
            provisioner,
            hosts_file,
            elastic,
        }
    }

    /// Retire a host unless a job lands on it while we disable it
    ///
    /// # Arguments
    ///
    /// * `host` - The host to retire
    #[instrument(name = "ScaleDownHandler::scale_down", skip(self), err(Debug))]
    pub async fn scale_down(&self, host: &str) -> Result<Retirement, Error> {
        // stop new jobs from landing here
        self.engine.disable_host(host).await?;
        // a job may have been scheduled just before we disabled this host
        let jobs = match self.engine.try_list_jobs().await {
            Ok(jobs) => jobs,
            Err(error) => {
                // we can't prove this host is empty so put it back into service
                event!(
                    Level::WARN,
                    msg = "Failed to recheck jobs on host",
                    host,
                    error = error.to_string()
                );
                self.engine.enable_host(host).await?;
                return Ok(Retirement::NotRetired);
            }
        };
        let raced = jobs
            .iter()
            .filter(|job| job.is_running())
            .find(|job| job.hosts.iter().any(|name| name == host));
        if let Some(job) = raced {
            event!(
                Level::INFO,
                msg = "Job landed on host while disabling it",
                host,
                job = &job.id
            );
            self.engine.enable_host(host).await?;
            return Ok(Retirement::NotRetired);
        }
        self.teardown(host).await?;
        Ok(Retirement::Retired)
    }

    /// Retire a host regardless of what is running on it
    ///
    /// # Arguments
    ///
    /// * `host` - The host to retire
    #[instrument(name = "ScaleDownHandler::force_scale_down", skip(self), err(Debug))]
    pub async fn force_scale_down(&self, host: &str) -> Result<(), Error> {
        self.engine.disable_host(host).await?;
        self.teardown(host).await
    }

    /// Remove a disabled host from everything that knows about it
    ///
    /// # Arguments
    ///
    /// * `host` - The host to tear down
    async fn teardown(&self, host: &str) -> Result<(), Error> {
        self.engine.delete_host(host, true).await?;
        // stop the run backing this host
        match self.provisioner.run_of(host) {
            Some(run) => {
                if let Err(error) = self.provisioner.stop(run).await {
                    event!(Level::ERROR, msg = "Failed to stop run", host, run, error = error.to_string());
                }
            }
            None => event!(Level::WARN, msg = "Host is not backed by a run", host),
        }
        self.hosts_file.remove(host).await?;
        self.elastic.remove(host).await?;
        event!(Level::INFO, msg = "Retired host", host);
        Ok(())
    }
}

/// Get the capacity on a host that running jobs are not using
///
/// Jobs spread across several hosts use an even share of each one.
///
/// # Arguments
///
/// * `host` - The host to check
/// * `supply` - The total supply of this host
/// * `jobs` - The jobs in the cluster
#[must_use]
pub fn idle_on_host(host: &str, supply: Supply, jobs: &[Job]) -> Supply {
    let used = jobs
        .iter()
        .filter(|job| job.is_running() && job.hosts.iter().any(|name| name == host))
        .map(|job| {
            let parts = job.hosts.len() as u64;
            Supply::new(
                conversions::split(job.cpu, parts),
                conversions::split(job.gpu, parts),
                conversions::split(job.mem, parts),
            )
        })
        .sum::<Supply>();
    supply.saturating_sub(&used)
}

/// Retires batches of hosts
pub struct ScaleDownOrchestrator {
    /// The handler for each host
    handler: Arc<ScaleDownHandler>,
    /// The batch engine to get host supplies from
    engine: Arc<dyn BatchEngine>,
    /// The most hosts to retire at once
    batch_size: usize,
}

impl ScaleDownOrchestrator {
    /// Create a new scale down orchestrator
    ///
    /// # Arguments
    ///
    /// * `handler` - The handler for each host
    /// * `engine` - The batch engine to get host supplies from
    /// * `batch_size` - The most hosts to retire at once
    pub fn new(handler: Arc<ScaleDownHandler>, engine: Arc<dyn BatchEngine>, batch_size: usize) -> Self {
        ScaleDownOrchestrator {
            handler,
            engine,
            batch_size,
        }
    }

    /// Rank hosts so the ones with the most idle capacity come first
    ///
    /// # Arguments
    ///
    /// * `hosts` - The hosts to rank
    /// * `jobs` - The jobs in the cluster
    pub async fn rank(&self, hosts: Vec<String>, jobs: &[Job]) -> Vec<String> {
        let mut ranked = Vec::with_capacity(hosts.len());
        for host in hosts {
            let supply = match self.engine.host_supply(&host).await {
                Ok(supply) => supply,
                Err(error) => {
                    event!(Level::WARN, msg = "Failed to get host supply", host, error = error.to_string());
                    Supply::default()
                }
            };
            let idle = idle_on_host(&host, supply, jobs);
            ranked.push((host, idle));
        }
        ranked.sort_by(|(left, left_idle), (right, right_idle)| {
            (right_idle.cpu, right_idle.gpu, right_idle.mem)
                .cmp(&(left_idle.cpu, left_idle.gpu, left_idle.mem))
                .then(left.cmp(right))
        });
        ranked.into_iter().map(|(host, _)| host).collect()
    }

    /// Retire up to a batch of hosts
    ///
    /// # Arguments
    ///
    /// * `hosts` - The hosts that may be retired
    /// * `jobs` - The jobs in the cluster
    #[instrument(name = "ScaleDownOrchestrator::scale_down", skip_all, fields(candidates = hosts.len()))]
    pub async fn scale_down(&self, hosts: Vec<String>, jobs: &[Job]) -> Vec<String> {
        let mut retired = Vec::default();
        for host in self.rank(hosts, jobs).await.into_iter().take(self.batch_size) {
            match self.handler.scale_down(&host).await {
                Ok(Retirement::Retired) => retired.push(host),
                Ok(Retirement::NotRetired) => (),
                Err(error) => {
                    event!(Level::ERROR, msg = "Failed to retire host", host, error = error.to_string());
                }
            }
        }
        event!(Level::INFO, retired = retired.len());
        retired
    }
}
