//! Launches new elastic workers and links them into the batch engine

use futures::future::join_all;
use gridscale::Error;
use gridscale::conf::Autoscaler;
use gridscale::models::{InstanceDemand, TaskStatus};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event, instrument};

use super::engines::BatchEngine;
use super::helpers::retry;
use super::hosts::{HostStore, running_hosts};
use super::instances::AvailabilityTracker;
use super::provisioners::Provisioner;
use super::resolver::HostsFile;

/// spawn an async tokio task
macro_rules! spawn {
    ($vec:expr, $future:expr) => {
        $vec.push(tokio::spawn(async move { $future.await }))
    };
}

/// The steps a new worker goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// We want this worker but have not asked for it yet
    Requested,
    /// The cloud accepted our launch
    Launched,
    /// We are waiting for this workers network identity
    PodPending,
    /// This worker has a hostname and ip
    PodRunning,
    /// This worker can be resolved and is tracked as an elastic host
    HostLinked,
    /// This worker finished bootstrapping
    WorkerInitialized,
    /// The batch engine can schedule jobs on this worker
    EngineEnabled,
    /// This worker failed to come up
    Failed,
}

impl WorkerState {
    /// Cast this state to a str
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Requested => "Requested",
            WorkerState::Launched => "Launched",
            WorkerState::PodPending => "PodPending",
            WorkerState::PodRunning => "PodRunning",
            WorkerState::HostLinked => "HostLinked",
            WorkerState::WorkerInitialized => "WorkerInitialized",
            WorkerState::EngineEnabled => "EngineEnabled",
            WorkerState::Failed => "Failed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A worker that is being brought up
#[derive(Debug, Clone)]
pub struct Worker {
    /// The instance this worker was launched for
    pub demand: InstanceDemand,
    /// The current state of this worker
    pub state: WorkerState,
    /// Every state this worker has been in
    pub history: Vec<WorkerState>,
    /// The run backing this worker
    pub run: Option<u64>,
    /// The hostname of this worker
    pub host: Option<String>,
    /// Whether this worker was added to the hosts file
    resolved: bool,
    /// Whether this worker was added to the elastic store
    stored: bool,
}

impl Worker {
    /// Create a new requested worker
    ///
    /// # Arguments
    ///
    /// * `demand` - The instance to launch
    fn new(demand: InstanceDemand) -> Self {
        Worker {
            demand,
            state: WorkerState::Requested,
            history: vec![WorkerState::Requested],
            run: None,
            host: None,
            resolved: false,
            stored: false,
        }
    }

    /// Move this worker to a new state
    ///
    /// # Arguments
    ///
    /// * `state` - The state to move to
    fn transition(&mut self, state: WorkerState) {
        event!(
            Level::INFO,
            run = self.run,
            host = self.host,
            from = self.state.as_str(),
            to = state.as_str()
        );
        self.state = state;
        self.history.push(state);
    }

    /// Whether this worker is ready for jobs
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state == WorkerState::EngineEnabled
    }
}

/// Brings a single worker from launch to enabled
pub struct ScaleUpHandler {
    /// The batch engine to enable workers in
    engine: Arc<dyn BatchEngine>,
    /// The cloud to launch workers in
    provisioner: Arc<dyn Provisioner>,
    /// The hosts file to register workers in
    hosts_file: Arc<HostsFile>,
    /// The elastic hosts we manage
    elastic: Arc<HostStore>,
    /// The recent launch failures for each instance type
    tracker: Arc<AvailabilityTracker>,
    /// The extra params to launch workers with
    params: HashMap<String, String>,
    /// The task that bootstraps new workers
    bootstrap_task: String,
    /// How long to wait between polls
    delay: Duration,
    /// The most polls launching and initializing a worker may take
    attempts: u64,
    /// The most polls enabling a worker may take
    enable_attempts: u64,
}

impl ScaleUpHandler {
    /// Create a new scale up handler
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings
    /// * `engine` - The batch engine to enable workers in
    /// * `provisioner` - The cloud to launch workers in
    /// * `hosts_file` - The hosts file to register workers in
    /// * `elastic` - The elastic hosts we manage
    /// * `tracker` - The recent launch failures for each instance type
    pub fn new(
        conf: &Autoscaler,
        engine: Arc<dyn BatchEngine>,
        provisioner: Arc<dyn Provisioner>,
        hosts_file: Arc<HostsFile>,
        elastic: Arc<HostStore>,
        tracker: Arc<AvailabilityTracker>,
    ) -> Self {
        // tell each worker which queue and host group it serves
        let mut params = HashMap::with_capacity(2);
        params.insert("queue".to_owned(), conf.queue.clone());
        params.insert("hostgroup".to_owned(), conf.hostgroup.clone());
        ScaleUpHandler {
            engine,
            provisioner,
            hosts_file,
            elastic,
            tracker,
            params,
            bootstrap_task: conf.worker.bootstrap_task.clone(),
            delay: Duration::from_secs(conf.scale_up_polling_delay),
            attempts: conf.scale_up_attempts(),
            enable_attempts: conf.enable_attempts(),
        }
    }

    /// Bring up a single worker
    ///
    /// Failures are logged and leave the worker in the failed state.
    ///
    /// # Arguments
    ///
    /// * `demand` - The instance to launch
    #[instrument(name = "ScaleUpHandler::scale_up", skip_all, fields(instance = &demand.instance.name, owner = demand.owner.as_deref()))]
    pub async fn scale_up(self: Arc<Self>, demand: InstanceDemand) -> Worker {
        let mut worker = Worker::new(demand);
        if let Err(error) = self.advance(&mut worker).await {
            event!(
                Level::ERROR,
                msg = "Failed to scale up worker",
                run = worker.run,
                host = worker.host,
                state = worker.state.as_str(),
                error = error.to_string()
            );
            self.unlink(&worker).await;
            worker.transition(WorkerState::Failed);
        }
        worker
    }

    /// Walk a worker through every state until it is enabled
    ///
    /// # Arguments
    ///
    /// * `worker` - The worker to advance
    async fn advance(&self, worker: &mut Worker) -> Result<(), Error> {
        let instance = &worker.demand.instance;
        // ask the cloud for a new run
        let launched = self
            .provisioner
            .launch(instance, worker.demand.owner.as_deref(), &self.params)
            .await;
        let run = match launched {
            Ok(run) => {
                self.tracker.succeeded(&instance.name).await;
                run
            }
            Err(error) => {
                self.tracker.failed(&instance.name).await;
                return Err(error);
            }
        };
        worker.run = Some(run);
        worker.transition(WorkerState::Launched);
        worker.transition(WorkerState::PodPending);
        // wait for this run to get a hostname and ip
        let provisioner = &self.provisioner;
        let network = retry(self.attempts, self.delay, || async move {
            let status = provisioner.status(run).await?;
            if !status.status.is_running() {
                return Err(Error::scaling(format!(
                    "Run {run} stopped before it was networked: {:?}",
                    status.status
                )));
            }
            Ok(status
                .network()
                .map(|(host, ip)| (host.to_owned(), ip.to_owned())))
        })
        .await?;
        let (host, ip) = network.or_scaling(format!("Run {run} never got a network identity"))?;
        worker.host = Some(host.clone());
        worker.transition(WorkerState::PodRunning);
        // make this worker resolvable and track it
        self.hosts_file.add(&host, &ip).await?;
        worker.resolved = true;
        self.elastic.add(&host).await?;
        worker.stored = true;
        worker.transition(WorkerState::HostLinked);
        // wait for this worker to finish bootstrapping
        let task = self.bootstrap_task.as_str();
        let initialized = retry(self.attempts, self.delay, || async move {
            let status = provisioner.status(run).await?;
            if !status.status.is_running() {
                return Err(Error::scaling(format!(
                    "Run {run} stopped while initializing: {:?}",
                    status.status
                )));
            }
            if !status.initialized {
                return Ok(None);
            }
            match provisioner.task_status(run, task).await? {
                Some(TaskStatus::Success) => Ok(Some(())),
                Some(TaskStatus::Failure | TaskStatus::Stopped) => Err(Error::scaling(format!(
                    "Task {task} did not succeed on run {run}"
                ))),
                _ => Ok(None),
            }
        })
        .await?;
        initialized.or_scaling(format!("Run {run} never finished initializing"))?;
        worker.transition(WorkerState::WorkerInitialized);
        // let the batch engine schedule jobs here
        let engine = &self.engine;
        let host_ref = host.as_str();
        let enabled = retry(self.enable_attempts, self.delay, || async move {
            match engine.enable_host(host_ref).await {
                Ok(()) => Ok(Some(())),
                Err(error) => {
                    event!(Level::WARN, msg = "Failed to enable host", host = host_ref, error = error.to_string());
                    Ok(None)
                }
            }
        })
        .await?;
        enabled.or_scaling(format!("Host {host} was never enabled"))?;
        self.elastic.touch([&host]).await?;
        worker.transition(WorkerState::EngineEnabled);
        Ok(())
    }

    /// Undo the links made for a worker that failed
    ///
    /// # Arguments
    ///
    /// * `worker` - The worker that failed
    async fn unlink(&self, worker: &Worker) {
        let Some(host) = &worker.host else {
            return;
        };
        if worker.stored {
            if let Err(error) = self.elastic.remove(host).await {
                event!(Level::ERROR, msg = "Failed to forget host", host, error = error.to_string());
            }
        }
        if worker.resolved {
            if let Err(error) = self.hosts_file.remove(host).await {
                event!(Level::ERROR, msg = "Failed to unresolve host", host, error = error.to_string());
            }
        }
    }
}

/// Brings up batches of workers at once
pub struct ScaleUpOrchestrator {
    /// The handler for each worker
    handler: Arc<ScaleUpHandler>,
    /// The batch engine to watch jobs in while waiting
    engine: Arc<dyn BatchEngine>,
    /// The host stores to refresh while waiting
    stores: Vec<Arc<HostStore>>,
    /// The most workers to bring up at once
    batch_size: usize,
    /// How long to wait between liveness checks
    delay: Duration,
}

impl ScaleUpOrchestrator {
    /// Create a new scale up orchestrator
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings
    /// * `handler` - The handler for each worker
    /// * `engine` - The batch engine to watch jobs in while waiting
    /// * `stores` - The host stores to refresh while waiting
    pub fn new(
        conf: &Autoscaler,
        handler: Arc<ScaleUpHandler>,
        engine: Arc<dyn BatchEngine>,
        stores: Vec<Arc<HostStore>>,
    ) -> Self {
        ScaleUpOrchestrator {
            handler,
            engine,
            stores,
            batch_size: conf.scale_up_batch_size,
            delay: Duration::from_secs(conf.scale_up_polling_delay.max(1)),
        }
    }

    /// Bring up workers for some instances
    ///
    /// Only the first batch of instances is launched.
    ///
    /// # Arguments
    ///
    /// * `demands` - The instances to launch
    #[instrument(name = "ScaleUpOrchestrator::scale_up", skip_all, fields(demands = demands.len()))]
    pub async fn scale_up(&self, demands: Vec<InstanceDemand>) -> Vec<Worker> {
        let mut handles = Vec::with_capacity(self.batch_size);
        for demand in demands.into_iter().take(self.batch_size) {
            let handler = self.handler.clone();
            spawn!(handles, handler.scale_up(demand));
        }
        // wait for every worker while keeping running hosts marked as active
        let mut joined = Box::pin(join_all(handles));
        let results = loop {
            match tokio::time::timeout(self.delay, &mut joined).await {
                Ok(results) => break results,
                Err(_) => self.refresh_activity().await,
            }
        };
        let workers = results
            .into_iter()
            .filter_map(|result| match result {
                Ok(worker) => Some(worker),
                Err(join) => {
                    let error = Error::from(join);
                    event!(Level::ERROR, msg = "Scale up task failed", kind = error.kind(), error = error.to_string());
                    None
                }
            })
            .collect::<Vec<Worker>>();
        self.record(&workers).await;
        workers
    }

    /// Stamp the activity of every host a running job is on
    async fn refresh_activity(&self) {
        let jobs = self.engine.list_jobs().await;
        let active = running_hosts(&jobs);
        for store in &self.stores {
            if let Err(error) = store.touch(active.iter().copied()).await {
                event!(Level::ERROR, msg = "Failed to refresh host activity", error = error.to_string());
            }
        }
    }

    /// Record the workers that came up
    ///
    /// # Arguments
    ///
    /// * `workers` - The workers from this batch
    async fn record(&self, workers: &[Worker]) {
        let enabled = workers
            .iter()
            .filter(|worker| worker.is_enabled())
            .filter_map(|worker| worker.host.as_ref())
            .collect::<Vec<&String>>();
        let failed = workers.len() - enabled.len();
        // new workers start their idle clock now
        if let Err(error) = self.handler.elastic.touch(enabled.iter().copied()).await {
            event!(Level::ERROR, msg = "Failed to record new workers", error = error.to_string());
        }
        event!(Level::INFO, enabled = enabled.len(), failed);
    }
}
