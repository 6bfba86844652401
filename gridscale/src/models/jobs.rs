//! The jobs that are pending or running in a batch engine

use chrono::prelude::*;
use std::fmt;

use super::{Demand, DemandKind, Supply};

/// The canonical state of a job regardless of which engine reported it
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// This job is waiting to be scheduled
    Pending,
    /// This job is running on one or more hosts
    Running,
    /// This job was suspended
    Suspended,
    /// This job is stuck in an error state
    Error,
    /// This job is being deleted
    Deleted,
    /// This job has completed
    Completed,
    /// The engine reported a state we do not understand
    Unknown,
}

impl JobState {
    /// Cast this state to a str
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Running => "Running",
            JobState::Suspended => "Suspended",
            JobState::Error => "Error",
            JobState::Deleted => "Deleted",
            JobState::Completed => "Completed",
            JobState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single job or a single per node split of a multi node job
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// The id of this job
    pub id: String,
    /// The id of the submission this job was split from
    pub root_id: String,
    /// The name of this job
    pub name: String,
    /// The user that submitted this job
    pub user: String,
    /// The current state of this job
    pub state: JobState,
    /// When this job was submitted or started
    pub datetime: DateTime<Utc>,
    /// The hosts this job has been scheduled on
    pub hosts: Vec<String>,
    /// The number of cpus this job requested
    pub cpu: u64,
    /// The number of gpus this job requested
    pub gpu: u64,
    /// The amount of memory in GiB this job requested
    pub mem: u64,
    /// The allocation environment used to look up this jobs allocation rule
    pub pe: String,
}

impl Job {
    /// Create a new pending job with a single cpu
    ///
    /// # Arguments
    ///
    /// * `id` - The id of this job
    /// * `user` - The user that submitted this job
    /// * `datetime` - When this job was submitted
    #[must_use]
    pub fn new<I: Into<String>, U: Into<String>>(id: I, user: U, datetime: DateTime<Utc>) -> Self {
        let id = id.into();
        Job {
            root_id: id.clone(),
            name: id.clone(),
            id,
            user: user.into(),
            state: JobState::Pending,
            datetime,
            hosts: Vec::default(),
            cpu: 1,
            gpu: 0,
            mem: 0,
            pe: "local".to_owned(),
        }
    }

    /// Set the state of this job
    ///
    /// # Arguments
    ///
    /// * `state` - The state to set
    #[must_use]
    pub fn state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    /// Set the resources this job requested
    ///
    /// # Arguments
    ///
    /// * `cpu` - The number of cpus to request
    /// * `gpu` - The number of gpus to request
    /// * `mem` - The amount of memory in GiB to request
    #[must_use]
    pub fn resources(mut self, cpu: u64, gpu: u64, mem: u64) -> Self {
        self.cpu = cpu;
        self.gpu = gpu;
        self.mem = mem;
        self
    }

    /// Add a host this job is running on
    ///
    /// # Arguments
    ///
    /// * `host` - The host to add
    #[must_use]
    pub fn host<T: Into<String>>(mut self, host: T) -> Self {
        self.hosts.push(host.into());
        self
    }

    /// Set the allocation environment for this job
    ///
    /// # Arguments
    ///
    /// * `pe` - The allocation environment to set
    #[must_use]
    pub fn pe<T: Into<String>>(mut self, pe: T) -> Self {
        self.pe = pe.into();
        self
    }

    /// Whether this job is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    /// Whether this job is pending
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    /// Get the capacity this job occupies
    #[must_use]
    pub fn supply(&self) -> Supply {
        Supply::new(self.cpu, self.gpu, self.mem)
    }

    /// Build the demand for this job
    ///
    /// # Arguments
    ///
    /// * `kind` - How this demand can be satisfied
    #[must_use]
    pub fn demand(&self, kind: DemandKind) -> Demand {
        Demand {
            cpu: self.cpu,
            gpu: self.gpu,
            mem: self.mem,
            owner: Some(self.user.clone()),
            kind,
        }
    }

    /// A sort key that orders numeric root ids numerically
    #[must_use]
    pub fn order_key(&self) -> (u64, &str, &str) {
        let root = self.root_id.parse::<u64>().unwrap_or(u64::MAX);
        (root, &self.root_id, &self.id)
    }
}
