//! The shared config for the gridscale autoscaler
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::Error;
use crate::models::Supply;

/// Helps serde default a value to false
fn default_false() -> bool {
    false
}

/// Helps serde default a value to true
fn default_true() -> bool {
    true
}

/// The batch engine dialect to drive
#[derive(
    Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Copy, clap::ValueEnum, Default, Hash,
)]
pub enum EngineKind {
    /// A Sun/Univa/Son of Grid Engine cluster
    #[default]
    #[serde(alias = "sge", alias = "SGE")]
    Sge,
    /// A SLURM cluster
    #[serde(alias = "slurm", alias = "SLURM")]
    Slurm,
}

impl EngineKind {
    /// Cast an [`EngineKind`] to a str
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Sge => "Sge",
            EngineKind::Slurm => "Slurm",
        }
    }
}

impl std::fmt::Display for EngineKind {
    /// write our engine kind to this formatter
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How instances are picked for a set of demands
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    PartialEq,
    Eq,
    Copy,
    Default,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Pack demands into the instances covering the most cpu net of reserved capacity
    #[default]
    CpuCapacity,
    /// Pack demands into the instances covering the most cpu ignoring reserved capacity
    NaiveCpuCapacity,
    /// Launch the first available instance type once per demand
    Default,
}

/// Helps serde default the instance type
fn default_instance_type() -> String {
    "m5.large".to_owned()
}

/// Helps serde default the unavailability window to 30 minutes
fn default_unavailability_window() -> u64 {
    1800
}

/// The capacity reserved on every worker for the system itself
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Reserved {
    /// The number of cpus to reserve
    #[serde(default)]
    pub cpu: u64,
    /// The amount of memory in GiB to reserve
    #[serde(default)]
    pub mem: u64,
}

/// The settings for picking which instance types to launch
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstanceSelection {
    /// The instance type to launch or to take the family from
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Allow any instance type in the same family as `instance_type`
    #[serde(default = "default_false")]
    pub family: bool,
    /// The largest number of cpus an instance may have
    #[serde(default)]
    pub max_cpu: Option<u64>,
    /// Try the biggest instance types first
    #[serde(default = "default_true")]
    pub descending: bool,
    /// Skip instance types that recently failed to launch
    #[serde(default = "default_true")]
    pub availability: bool,
    /// How long in seconds an instance type stays unavailable after a failed launch
    #[serde(default = "default_unavailability_window")]
    pub unavailability_window: u64,
    /// How instances are matched to demands
    #[serde(default)]
    pub strategy: SelectionStrategy,
    /// The capacity reserved on every worker
    #[serde(default)]
    pub reserved: Reserved,
}

impl Default for InstanceSelection {
    fn default() -> Self {
        InstanceSelection {
            instance_type: default_instance_type(),
            family: false,
            max_cpu: None,
            descending: true,
            availability: true,
            unavailability_window: default_unavailability_window(),
            strategy: SelectionStrategy::default(),
            reserved: Reserved::default(),
        }
    }
}

impl InstanceSelection {
    /// Get the capacity reserved on every worker
    #[must_use]
    pub fn reserved_supply(&self) -> Supply {
        Supply::new(self.reserved.cpu, 0, self.reserved.mem)
    }
}

/// Helps serde default the bootstrap task name
fn default_bootstrap_task() -> String {
    "WorkerSetup".to_owned()
}

/// Helps serde default the in use tag
fn default_in_use_tag() -> String {
    "IN_USE".to_owned()
}

/// The settings for launching new workers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Worker {
    /// The task that must succeed before a worker counts as initialized
    #[serde(default = "default_bootstrap_task")]
    pub bootstrap_task: String,
    /// The docker image to launch workers with
    #[serde(default)]
    pub docker_image: Option<String>,
    /// The command to launch workers with
    #[serde(default)]
    pub cmd_template: Option<String>,
    /// The disk size in GiB to give workers
    #[serde(default)]
    pub disk: Option<u64>,
    /// Whether to launch workers on spot instances
    #[serde(default = "default_false")]
    pub spot: bool,
    /// Any extra parameters to pass to workers
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// The tag to set on workers that have running jobs
    #[serde(default = "default_in_use_tag")]
    pub in_use_tag: String,
}

impl Default for Worker {
    fn default() -> Self {
        Worker {
            bootstrap_task: default_bootstrap_task(),
            docker_image: None,
            cmd_template: None,
            disk: None,
            spot: false,
            params: HashMap::default(),
            in_use_tag: default_in_use_tag(),
        }
    }
}

/// Helps serde default the queue name
fn default_queue() -> String {
    "main.q".to_owned()
}

/// Helps serde default the hostgroup name
fn default_hostgroup() -> String {
    "@allhosts".to_owned()
}

/// Helps serde default the elastic host list path
fn default_host_storage() -> PathBuf {
    PathBuf::from("/var/lib/gridscale/elastic.hosts")
}

/// Helps serde default the hosts file path
fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

/// Helps serde default the max number of elastic hosts
fn default_max_hosts() -> usize {
    3
}

/// Helps serde default the scale up and scale down timeouts to 30 seconds
fn default_scale_timeout() -> u64 {
    30
}

/// Helps serde default the idle timeout to 30 seconds
fn default_idle_timeout() -> u64 {
    30
}

/// Helps serde default the dwell between ticks to 10 seconds
fn default_dwell() -> u64 {
    10
}

/// Helps serde default batch sizes to 1
fn default_batch_size() -> usize {
    1
}

/// Helps serde default the scale up polling delay to 10 seconds
fn default_polling_delay() -> u64 {
    10
}

/// Helps serde default the scale up polling timeout to 15 minutes
fn default_polling_timeout() -> u64 {
    900
}

/// Helps serde default the enable host timeout to 60 seconds
fn default_enable_timeout() -> u64 {
    60
}

/// The settings for the autoscaler
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Autoscaler {
    /// The batch engine to drive
    #[serde(default)]
    pub engine: EngineKind,
    /// The queue workers are added to
    #[serde(default = "default_queue")]
    pub queue: String,
    /// The hostgroup workers are added to
    #[serde(default = "default_hostgroup")]
    pub hostgroup: String,
    /// Where the elastic host list is persisted
    #[serde(default = "default_host_storage")]
    pub host_storage: PathBuf,
    /// The hosts file used to resolve workers
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
    /// The hosts that are always on and never scaled
    #[serde(default)]
    pub static_hosts: Vec<String>,
    /// The most elastic hosts that may exist at once
    #[serde(default = "default_max_hosts")]
    pub max_hosts: usize,
    /// How long in seconds a job must wait before we scale up for it
    #[serde(default = "default_scale_timeout")]
    pub scale_up_timeout: u64,
    /// How long in seconds after the latest job started before we scale down
    #[serde(default = "default_scale_timeout")]
    pub scale_down_timeout: u64,
    /// How long in seconds a host must be idle before it is scaled down
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// How long in seconds to wait between ticks
    #[serde(default = "default_dwell")]
    pub dwell: u64,
    /// The most workers to launch in a single tick
    #[serde(default = "default_batch_size")]
    pub scale_up_batch_size: usize,
    /// The most workers to retire in a single tick
    #[serde(default = "default_batch_size")]
    pub scale_down_batch_size: usize,
    /// How long in seconds to wait between polls while launching workers
    #[serde(default = "default_polling_delay")]
    pub scale_up_polling_delay: u64,
    /// How long in seconds a worker may take to launch
    #[serde(default = "default_polling_timeout")]
    pub scale_up_polling_timeout: u64,
    /// How long in seconds enabling a worker in the engine may take
    #[serde(default = "default_enable_timeout")]
    pub enable_timeout: u64,
    /// The settings for picking instance types
    #[serde(default)]
    pub instances: InstanceSelection,
    /// The settings for launching workers
    #[serde(default)]
    pub worker: Worker,
}

impl Default for Autoscaler {
    fn default() -> Self {
        Autoscaler {
            engine: EngineKind::default(),
            queue: default_queue(),
            hostgroup: default_hostgroup(),
            host_storage: default_host_storage(),
            hosts_file: default_hosts_file(),
            static_hosts: Vec::default(),
            max_hosts: default_max_hosts(),
            scale_up_timeout: default_scale_timeout(),
            scale_down_timeout: default_scale_timeout(),
            idle_timeout: default_idle_timeout(),
            dwell: default_dwell(),
            scale_up_batch_size: default_batch_size(),
            scale_down_batch_size: default_batch_size(),
            scale_up_polling_delay: default_polling_delay(),
            scale_up_polling_timeout: default_polling_timeout(),
            enable_timeout: default_enable_timeout(),
            instances: InstanceSelection::default(),
            worker: Worker::default(),
        }
    }
}

impl Autoscaler {
    /// Get the number of polls a worker launch step may take
    #[must_use]
    pub fn scale_up_attempts(&self) -> u64 {
        (self.scale_up_polling_timeout / self.scale_up_polling_delay.max(1)).max(1)
    }

    /// Get the number of polls enabling a worker may take
    #[must_use]
    pub fn enable_attempts(&self) -> u64 {
        (self.enable_timeout / self.scale_up_polling_delay.max(1)).max(1)
    }

    /// Make sure these settings can drive an autoscaler
    pub fn validate(&self) -> Result<(), Error> {
        if self.scale_up_batch_size == 0 {
            return Err(Error::validation("scale_up_batch_size must be at least 1"));
        }
        if self.scale_down_batch_size == 0 {
            return Err(Error::validation("scale_down_batch_size must be at least 1"));
        }
        if self.scale_up_polling_delay == 0 {
            return Err(Error::validation("scale_up_polling_delay must be at least 1"));
        }
        if self.scale_up_polling_timeout < self.scale_up_polling_delay {
            return Err(Error::validation(
                "scale_up_polling_timeout must not be shorter than scale_up_polling_delay",
            ));
        }
        if self.instances.instance_type.is_empty() {
            return Err(Error::validation("instances.instance_type must be set"));
        }
        Ok(())
    }
}

/// Helps serde default the cloud api url
fn default_api() -> String {
    "http://127.0.0.1:8080/pipeline/restapi".to_owned()
}

/// The settings for talking to the cloud provisioning api
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Cloud {
    /// The url of the cloud api
    #[serde(default = "default_api")]
    pub api: String,
    /// The token to authenticate with
    #[serde(default)]
    pub token: String,
    /// The run this cluster belongs to
    #[serde(default)]
    pub parent_run_id: Option<u64>,
    /// The region to load instance types for
    #[serde(default)]
    pub region_id: Option<u64>,
}

impl Default for Cloud {
    fn default() -> Self {
        Cloud {
            api: default_api(),
            token: String::default(),
            parent_run_id: None,
            region_id: None,
        }
    }
}

/// The settings for sending traces to stdout/stderr
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tracing {
    /// The log level to use for stdout/stderr
    #[serde(default)]
    pub level: LogLevel,
    /// Whether to write logs as json lines
    #[serde(default = "default_false")]
    pub json: bool,
}

impl Default for Tracing {
    /// Create a default Tracing config
    fn default() -> Self {
        Tracing {
            level: LogLevel::Info,
            json: false,
        }
    }
}

/// The log level to set
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Copy, Default)]
pub enum LogLevel {
    /// Do not log any info
    Off,
    /// Log at the error level
    Error,
    /// Log at the warning level
    Warn,
    /// Only Setup and up info
    Setup,
    /// Log at the info level
    #[default]
    Info,
    /// Log at the debug level
    Debug,
    /// Log at the tracing level
    Trace,
}

impl LogLevel {
    /// Cast this log level to a tracing filter
    #[cfg(feature = "trace")]
    #[must_use]
    pub fn to_filter(&self) -> tracing_subscriber::filter::LevelFilter {
        match self {
            LogLevel::Off => tracing_subscriber::filter::LevelFilter::OFF,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
            LogLevel::Warn | LogLevel::Setup => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
        }
    }
}

impl std::fmt::Display for LogLevel {
    /// Allow the log level to be displayed
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LogLevel::Off => write!(f, "Off"),
            LogLevel::Error => write!(f, "Error"),
            LogLevel::Warn => write!(f, "Warn"),
            LogLevel::Setup => write!(f, "Setup"),
            LogLevel::Info => write!(f, "Info"),
            LogLevel::Debug => write!(f, "Debug"),
            LogLevel::Trace => write!(f, "Trace"),
        }
    }
}

/// configs for gridscale
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Conf {
    /// The autoscaler settings
    #[serde(default)]
    pub autoscaler: Autoscaler,
    /// The cloud api settings
    #[serde(default)]
    pub cloud: Cloud,
    /// The tracing settings
    #[serde(default)]
    pub tracing: Tracing,
}

impl Conf {
    /// Creates a new [Conf] object
    ///
    /// # Arguments
    ///
    /// * `path` - The path to use when reading the config file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conf: Conf = config::Config::builder()
            // load from a file first
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            // then overlay any environment args ontop
            .add_source(
                config::Environment::with_prefix("gridscale")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(conf)
    }

    /// Make sure this config can drive an autoscaler
    pub fn validate(&self) -> Result<(), Error> {
        self.autoscaler.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let conf = Conf::default();
        assert!(conf.validate().is_ok());
        assert_eq!(conf.autoscaler.scale_up_attempts(), 90);
        assert_eq!(conf.autoscaler.enable_attempts(), 6);
    }

    #[test]
    fn strategy_names() {
        assert_eq!(SelectionStrategy::NaiveCpuCapacity.to_string(), "naive-cpu-capacity");
        assert_eq!("cpu-capacity".parse(), Ok(SelectionStrategy::CpuCapacity));
        assert!("fastest".parse::<SelectionStrategy>().is_err());
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let mut conf = Conf::default();
        conf.autoscaler.scale_up_batch_size = 0;
        assert!(matches!(conf.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn loads_yaml() {
        let path = std::env::temp_dir().join("gridscale-conf-loads-yaml.yml");
        std::fs::write(
            &path,
            "autoscaler:\n  engine: Slurm\n  max_hosts: 7\n  instances:\n    instance_type: c5.xlarge\n    strategy: naive-cpu-capacity\n",
        )
        .unwrap();
        let conf = Conf::new(&path).unwrap();
        assert_eq!(conf.autoscaler.engine, EngineKind::Slurm);
        assert_eq!(conf.autoscaler.max_hosts, 7);
        assert_eq!(conf.autoscaler.instances.instance_type, "c5.xlarge");
        assert_eq!(
            conf.autoscaler.instances.strategy,
            SelectionStrategy::NaiveCpuCapacity
        );
        assert_eq!(conf.autoscaler.queue, "main.q");
        std::fs::remove_file(&path).unwrap();
    }
}
