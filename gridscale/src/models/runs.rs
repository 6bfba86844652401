//! The runs that back elastic workers in the cloud

use std::collections::HashMap;

use super::InstanceDescriptor;

/// The status of a cloud run
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// This run is active
    Running,
    /// This run is being paused
    Pausing,
    /// This run is paused
    Paused,
    /// This run is being resumed
    Resuming,
    /// This run was stopped
    Stopped,
    /// This run failed
    Failure,
    /// This run completed successfully
    Success,
    /// A status we do not know about
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Whether this run is still active
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, RunStatus::Running)
    }
}

/// The status of a task within a run
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// This task is still running
    Running,
    /// This task completed successfully
    Success,
    /// This task failed
    Failure,
    /// This task was stopped
    Stopped,
    /// A status we do not know about
    #[serde(other)]
    Unknown,
}

/// The current state of a cloud run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// The id of this run
    pub id: u64,
    /// The status of this run
    pub status: RunStatus,
    /// The hostname of this runs pod once it has one
    #[serde(default, alias = "podId")]
    pub hostname: Option<String>,
    /// The ip of this runs pod once it has one
    #[serde(default, alias = "podIP")]
    pub pod_ip: Option<String>,
    /// Whether this run has finished initializing
    #[serde(default)]
    pub initialized: bool,
}

impl Run {
    /// Get the network identity of this run if it has one yet
    #[must_use]
    pub fn network(&self) -> Option<(&str, &str)> {
        match (&self.hostname, &self.pod_ip) {
            (Some(hostname), Some(ip)) if !hostname.is_empty() && !ip.is_empty() => {
                Some((hostname.as_str(), ip.as_str()))
            }
            _ => None,
        }
    }
}

/// A request to launch a new run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// The instance type to launch
    pub instance_type: String,
    /// The user this run is launched for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// The run this worker belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<u64>,
    /// The docker image to launch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    /// The command to run in this worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_template: Option<String>,
    /// The disk size in GiB to attach
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdd_size: Option<u64>,
    /// Whether to request a spot instance
    pub is_spot: bool,
    /// Any extra parameters to pass to this run
    pub params: HashMap<String, String>,
}

impl RunRequest {
    /// Create a new run request for an instance type
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance type to launch
    /// * `owner` - The user this run is launched for
    #[must_use]
    pub fn new(instance: &InstanceDescriptor, owner: Option<String>) -> Self {
        RunRequest {
            instance_type: instance.name.clone(),
            owner,
            ..Default::default()
        }
    }

    /// Add a parameter to this request
    ///
    /// # Arguments
    ///
    /// * `key` - The parameter name
    /// * `value` - The parameter value
    #[must_use]
    pub fn param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}
