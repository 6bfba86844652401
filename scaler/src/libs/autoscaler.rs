//! Decides each tick whether the worker pool should grow or shrink

use chrono::prelude::*;
use gridscale::models::{Demand, Job, Supply};
use gridscale::{Conf, Error, conf};
use std::sync::Arc;
use tracing::{Level, event, instrument};

use super::demand::{DemandSelector, idle_supply};
use super::engines::BatchEngine;
use super::executor::Executor;
use super::helpers::seconds;
use super::hosts::{HostStore, running_hosts};
use super::instances::{AvailabilityTracker, InstanceCatalog, InstanceSelector};
use super::provisioners::Provisioner;
use super::resolver::HostsFile;
use super::scale_down::{ScaleDownHandler, ScaleDownOrchestrator};
use super::scale_up::{ScaleUpHandler, ScaleUpOrchestrator, Worker};
use super::validator::{Ceilings, JobValidator};

/// What a single tick decided to do
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing needed to change
    Steady,
    /// New workers were brought up
    ScaledUp(Vec<Worker>),
    /// Hosts were retired
    ScaledDown(Vec<String>),
}

/// The shared handles an autoscaler drives
#[derive(Clone)]
pub struct Handles {
    /// The batch engine to scale workers for
    pub engine: Arc<dyn BatchEngine>,
    /// The cloud to launch workers in
    pub provisioner: Arc<dyn Provisioner>,
    /// The executor for host resolution edits
    pub executor: Arc<dyn Executor>,
    /// The elastic hosts we manage
    pub elastic: Arc<HostStore>,
    /// The static hosts that are always on
    pub statics: Arc<HostStore>,
}

/// Scales elastic workers to match the jobs in a batch engine
pub struct Autoscaler {
    /// The autoscaler settings
    conf: conf::Autoscaler,
    /// The batch engine to scale workers for
    engine: Arc<dyn BatchEngine>,
    /// The elastic hosts we manage
    elastic: Arc<HostStore>,
    /// The static hosts that are always on
    statics: Arc<HostStore>,
    /// Every instance type the cloud offers
    catalog: Arc<InstanceCatalog>,
    /// Picks instance types for demands
    selector: InstanceSelector,
    /// Kills jobs that can never run
    validator: JobValidator,
    /// Brings up new workers
    scale_up: ScaleUpOrchestrator,
    /// Retires hosts we no longer need
    scale_down: ScaleDownOrchestrator,
    /// Retires single hosts
    retire: Arc<ScaleDownHandler>,
}

impl Autoscaler {
    /// Build a new autoscaler
    ///
    /// # Arguments
    ///
    /// * `conf` - The gridscale config
    /// * `handles` - The shared handles to drive
    #[instrument(name = "Autoscaler::new", skip_all, err(Debug))]
    pub async fn new(conf: &Conf, handles: Handles) -> Result<Self, Error> {
        let settings = conf.autoscaler.clone();
        // load the instance types we can launch once
        let catalog = Arc::new(InstanceCatalog::load(handles.provisioner.clone()).await?);
        let tracker = Arc::new(AvailabilityTracker::new(
            settings.instances.unavailability_window,
        ));
        let selector = InstanceSelector::new(&settings.instances, &catalog, &tracker);
        let hosts_file = Arc::new(HostsFile::new(
            settings.hosts_file.clone(),
            handles.executor.clone(),
        ));
        // build our scale up and down handlers
        let launch = Arc::new(ScaleUpHandler::new(
            &settings,
            handles.engine.clone(),
            handles.provisioner.clone(),
            hosts_file.clone(),
            handles.elastic.clone(),
            tracker,
        ));
        let scale_up = ScaleUpOrchestrator::new(
            &settings,
            launch,
            handles.engine.clone(),
            vec![handles.elastic.clone(), handles.statics.clone()],
        );
        let retire = Arc::new(ScaleDownHandler::new(
            handles.engine.clone(),
            handles.provisioner.clone(),
            hosts_file,
            handles.elastic.clone(),
        ));
        let scale_down = ScaleDownOrchestrator::new(
            retire.clone(),
            handles.engine.clone(),
            settings.scale_down_batch_size,
        );
        Ok(Autoscaler {
            validator: JobValidator::new(handles.engine.clone()),
            conf: settings,
            engine: handles.engine,
            elastic: handles.elastic,
            statics: handles.statics,
            catalog,
            selector,
            scale_up,
            scale_down,
            retire,
        })
    }

    /// The instance types the cloud offers
    #[must_use]
    pub fn catalog(&self) -> &Arc<InstanceCatalog> {
        &self.catalog
    }

    /// The handler that retires single hosts
    #[must_use]
    pub fn retire(&self) -> &Arc<ScaleDownHandler> {
        &self.retire
    }

    /// Get the instance types we can launch right now
    ///
    /// The catalog is reloaded once if nothing can be launched.
    async fn instances(&self) -> Vec<gridscale::models::InstanceDescriptor> {
        let instances = self.selector.instances().await;
        if !instances.is_empty() {
            return instances;
        }
        if let Err(error) = self.catalog.refresh().await {
            event!(Level::WARN, msg = "Failed to reload instance types", error = error.to_string());
        }
        self.selector.instances().await
    }

    /// Get the total supply of some hosts
    ///
    /// Hosts whose supply can't be read count as empty.
    ///
    /// # Arguments
    ///
    /// * `hosts` - The hosts to sum
    async fn supply_of(&self, hosts: Vec<String>) -> Supply {
        let mut total = Supply::default();
        for host in hosts {
            match self.engine.host_supply(&host).await {
                Ok(supply) => total += supply,
                Err(error) => {
                    event!(Level::WARN, msg = "Failed to get host supply", host, error = error.to_string());
                }
            }
        }
        total
    }

    /// Get the elastic hosts that no running job is on
    ///
    /// # Arguments
    ///
    /// * `jobs` - The jobs in the cluster
    async fn inactive(&self, jobs: &[Job]) -> Vec<(String, DateTime<Utc>)> {
        let active = running_hosts(jobs);
        self.elastic
            .activity()
            .await
            .into_iter()
            .filter(|(host, _)| !active.contains(host))
            .collect()
    }

    /// Run a single scaling decision
    #[instrument(name = "Autoscaler::tick", skip_all, err(Debug))]
    pub async fn tick(&self) -> Result<TickOutcome, Error> {
        let start = Utc::now();
        // without a job listing every host would look idle
        let jobs = match self.engine.try_list_jobs().await {
            Ok(jobs) => jobs,
            Err(error) => {
                event!(
                    Level::ERROR,
                    msg = "Failed to list jobs, leaving the pool alone",
                    error = error.to_string()
                );
                return Ok(TickOutcome::Steady);
            }
        };
        // everything a running job is on was active just now
        let active = running_hosts(&jobs);
        self.elastic.touch_at(active.iter().copied(), start).await?;
        self.statics.touch_at(active.iter().copied(), start).await?;
        let latest = jobs
            .iter()
            .filter(|job| job.is_running())
            .max_by_key(|job| job.datetime);
        // find the pending jobs that have waited long enough
        let pending = jobs
            .iter()
            .filter(|job| job.is_pending())
            .cloned()
            .collect::<Vec<Job>>();
        let waiting = if self.conf.max_hosts == 0 {
            if !pending.is_empty() {
                event!(Level::INFO, msg = "Scaling up is disabled", pending = pending.len());
            }
            Vec::default()
        } else if pending.is_empty() {
            Vec::default()
        } else {
            self.waiting(pending, start).await
        };
        if !waiting.is_empty() {
            return self.grow(&waiting, &jobs).await;
        }
        // leave hosts alone if work started recently
        if let Some(latest) = latest {
            let since = start - latest.datetime;
            if since < seconds(self.conf.scale_down_timeout) {
                event!(Level::DEBUG, msg = "Jobs started recently", job = &latest.id);
                return Ok(TickOutcome::Steady);
            }
        }
        // retire elastic hosts that have been idle too long
        let idle_timeout = seconds(self.conf.idle_timeout);
        let idle = self
            .inactive(&jobs)
            .await
            .into_iter()
            .filter(|(_, last)| start - *last > idle_timeout)
            .map(|(host, _)| host)
            .collect::<Vec<String>>();
        if idle.is_empty() {
            return Ok(TickOutcome::Steady);
        }
        Ok(TickOutcome::ScaledDown(
            self.scale_down.scale_down(idle, &jobs).await,
        ))
    }

    /// Validate pending jobs and keep the ones that have waited long enough
    ///
    /// # Arguments
    ///
    /// * `pending` - The pending jobs
    /// * `start` - When this tick started
    async fn waiting(&self, pending: Vec<Job>, start: DateTime<Utc>) -> Vec<Job> {
        let rules = self.engine.allocation_rules(&pending).await;
        let instances = self.instances().await;
        let static_supply = self.supply_of(self.statics.hosts().await).await;
        let ceilings = Ceilings::new(&instances, static_supply, self.conf.max_hosts as u64);
        let (valid, _) = self.validator.validate(pending, &rules, &ceilings).await;
        let timeout = seconds(self.conf.scale_up_timeout);
        valid
            .into_iter()
            .filter(|job| start - job.datetime >= timeout)
            .collect()
    }

    /// Add workers for waiting jobs or break a deadlock if we are at our cap
    ///
    /// # Arguments
    ///
    /// * `waiting` - The jobs that have waited long enough
    /// * `jobs` - Every job in the cluster
    async fn grow(&self, waiting: &[Job], jobs: &[Job]) -> Result<TickOutcome, Error> {
        let current = self.elastic.len().await;
        if current >= self.conf.max_hosts {
            // the pool is full and jobs are stuck so free up some hosts
            event!(Level::INFO, msg = "At the host cap with waiting jobs", hosts = current);
            let inactive = self
                .inactive(jobs)
                .await
                .into_iter()
                .map(|(host, _)| host)
                .collect::<Vec<String>>();
            if inactive.is_empty() {
                return Ok(TickOutcome::Steady);
            }
            return Ok(TickOutcome::ScaledDown(
                self.scale_down.scale_down(inactive, jobs).await,
            ));
        }
        let rules = self.engine.allocation_rules(waiting).await;
        // fractional jobs can use capacity that is already idle
        let idle = if rules.values().any(|rule| rule.is_fractional()) {
            let mut hosts = self.statics.hosts().await;
            hosts.extend(self.elastic.hosts().await);
            idle_supply(self.supply_of(hosts).await, jobs.iter().filter(|job| job.is_running()))
        } else {
            Supply::default()
        };
        let demands = DemandSelector::new(waiting, &rules, idle)
            .filter_map(|(job, demand)| {
                if demand.is_satisfied() {
                    event!(Level::DEBUG, msg = "Job fits in idle capacity", job = &job.id);
                    None
                } else {
                    Some(demand)
                }
            })
            .collect::<Vec<Demand>>();
        let slots = (self.conf.max_hosts - current).min(self.conf.scale_up_batch_size);
        let instances = self.instances().await;
        let selected = self.selector.select(&instances, demands, slots);
        if selected.is_empty() {
            event!(Level::INFO, msg = "No instances selected", waiting = waiting.len());
            return Ok(TickOutcome::Steady);
        }
        Ok(TickOutcome::ScaledUp(self.scale_up.scale_up(selected).await))
    }
}
