//! The polling loop that keeps the worker pool in shape

use gridscale::models::Job;
use gridscale::{Conf, Error};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event, instrument};

use super::autoscaler::{Autoscaler, Handles, TickOutcome};
use super::executor::{DryRunExecutor, Executor, LocalExecutor};
use super::hosts::HostStore;
use super::tags::Tagger;
use super::{engines, provisioners};

/// Runs the autoscaler on a fixed delay
pub struct Daemon {
    /// The autoscaler to tick
    autoscaler: Autoscaler,
    /// The shared handles we drive
    handles: Handles,
    /// Tags workers after each tick
    tagger: Tagger,
    /// How long to wait between ticks
    dwell: Duration,
}

impl Daemon {
    /// Build a daemon that talks to real engines and clouds
    ///
    /// # Arguments
    ///
    /// * `conf` - The gridscale config
    /// * `dry_run` - Whether to only pretend to scale
    #[instrument(name = "Daemon::new", skip(conf), err(Debug))]
    pub async fn new(conf: Conf, dry_run: bool) -> Result<Self, Error> {
        conf.validate()?;
        // dry runs record commands instead of running them
        let executor: Arc<dyn Executor> = if dry_run {
            Arc::new(DryRunExecutor::default())
        } else {
            Arc::new(LocalExecutor)
        };
        let engine = engines::new(&conf, executor.clone(), dry_run);
        let provisioner = provisioners::new(&conf, dry_run)?;
        let elastic = if dry_run {
            HostStore::in_memory()
        } else {
            HostStore::load(&conf.autoscaler.host_storage).await?
        };
        let handles = Handles {
            engine,
            provisioner,
            executor,
            elastic: Arc::new(elastic),
            statics: Arc::new(HostStore::in_memory()),
        };
        Self::build(conf, handles).await
    }

    /// Build a daemon around some handles
    ///
    /// # Arguments
    ///
    /// * `conf` - The gridscale config
    /// * `handles` - The shared handles to drive
    pub async fn build(conf: Conf, handles: Handles) -> Result<Self, Error> {
        conf.validate()?;
        let autoscaler = Autoscaler::new(&conf, handles.clone()).await?;
        // make sure the instance type we were told to use exists
        let instance_type = &conf.autoscaler.instances.instance_type;
        if autoscaler.catalog().get(instance_type).await.is_none() {
            return Err(Error::validation(format!(
                "Instance type {instance_type} is not available"
            )));
        }
        // seed our static hosts
        for host in &conf.autoscaler.static_hosts {
            if !handles.statics.contains(host).await {
                handles.statics.add(host).await?;
            }
        }
        let tagger = Tagger::new(
            handles.engine.clone(),
            handles.provisioner.clone(),
            handles.elastic.clone(),
            conf.autoscaler.worker.in_use_tag.clone(),
        );
        event!(
            Level::INFO,
            engine = handles.engine.kind().as_str(),
            statics = conf.autoscaler.static_hosts.len(),
            elastic = handles.elastic.len().await,
            max_hosts = conf.autoscaler.max_hosts
        );
        Ok(Daemon {
            autoscaler,
            handles,
            tagger,
            dwell: Duration::from_secs(conf.autoscaler.dwell),
        })
    }

    /// The autoscaler this daemon ticks
    #[must_use]
    pub fn autoscaler(&self) -> &Autoscaler {
        &self.autoscaler
    }

    /// The tagger that marks workers as in use
    #[must_use]
    pub fn tagger(&self) -> &Tagger {
        &self.tagger
    }

    /// Check whether an elastic host is healthy in both the engine and the cloud
    ///
    /// # Arguments
    ///
    /// * `host` - The host to check
    async fn is_worker_valid(&self, host: &str) -> Result<bool, Error> {
        if !self.handles.engine.is_host_valid(host).await? {
            return Ok(false);
        }
        match self.handles.provisioner.run_of(host) {
            Some(run) => Ok(self.handles.provisioner.status(run).await?.status.is_running()),
            None => Ok(true),
        }
    }

    /// Retire any elastic hosts that are broken
    ///
    /// Jobs on a broken host are killed before it is retired.
    #[instrument(name = "Daemon::validate_workers", skip_all)]
    pub async fn validate_workers(&self) -> Vec<String> {
        let mut retired = Vec::default();
        let mut jobs: Option<Vec<Job>> = None;
        for host in self.handles.elastic.hosts().await {
            match self.is_worker_valid(&host).await {
                Ok(true) => continue,
                Ok(false) => event!(Level::WARN, msg = "Found invalid worker", host),
                Err(error) => {
                    event!(Level::WARN, msg = "Failed to check worker", host, error = error.to_string());
                    continue;
                }
            }
            // only list jobs once we find a broken host
            if jobs.is_none() {
                jobs = Some(self.handles.engine.list_jobs().await);
            }
            let stranded = jobs
                .iter()
                .flatten()
                .filter(|job| job.is_running() && job.hosts.contains(&host))
                .cloned()
                .collect::<Vec<Job>>();
            if !stranded.is_empty() {
                if let Err(error) = self.handles.engine.kill_jobs(&stranded, true).await {
                    event!(Level::ERROR, msg = "Failed to kill jobs on invalid worker", host, error = error.to_string());
                }
            }
            match self.autoscaler.retire().force_scale_down(&host).await {
                Ok(()) => retired.push(host),
                Err(error) => {
                    event!(Level::ERROR, msg = "Failed to retire invalid worker", host, error = error.to_string());
                }
            }
        }
        retired
    }

    /// Run a single iteration of the daemon loop
    pub async fn iterate(&self) -> Result<TickOutcome, Error> {
        self.validate_workers().await;
        let outcome = self.autoscaler.tick().await?;
        self.tagger.spawn();
        Ok(outcome)
    }

    /// Run until we are interrupted
    pub async fn start(&self) -> Result<(), Error> {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    event!(Level::INFO, msg = "Interrupted");
                    return Ok(());
                }
                () = tokio::time::sleep(self.dwell) => (),
            }
            // errors inside an iteration never stop the loop
            if let Err(error) = self.iterate().await {
                event!(Level::ERROR, msg = "Autoscaling iteration failed", error = error.to_string());
            }
        }
    }
}
