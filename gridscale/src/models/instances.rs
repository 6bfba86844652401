//! The instance types that can be launched as workers

use std::fmt;

use super::Supply;

/// A type of instance that can be launched
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceDescriptor {
    /// The name of this instance type
    pub name: String,
    /// The number of cpus on this instance type
    pub cpu: u64,
    /// The number of gpus on this instance type
    #[serde(default)]
    pub gpu: u64,
    /// The amount of memory in GiB on this instance type
    pub mem: u64,
}

impl InstanceDescriptor {
    /// Create a new instance descriptor
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this instance type
    /// * `cpu` - The number of cpus on this instance type
    /// * `gpu` - The number of gpus on this instance type
    /// * `mem` - The amount of memory in GiB on this instance type
    #[must_use]
    pub fn new<T: Into<String>>(name: T, cpu: u64, gpu: u64, mem: u64) -> Self {
        InstanceDescriptor {
            name: name.into(),
            cpu,
            gpu,
            mem,
        }
    }

    /// Get the capacity this instance type supplies
    #[must_use]
    pub fn supply(&self) -> Supply {
        Supply::new(self.cpu, self.gpu, self.mem)
    }

    /// Get the family this instance type belongs to
    #[must_use]
    pub fn family(&self) -> String {
        family(&self.name)
    }
}

impl fmt::Display for InstanceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.supply())
    }
}

/// Get the family of an instance type from its name
///
/// * `m5.2xlarge` -> `m5`
/// * `n1-standard-8` -> `n1-standard`
/// * `Standard_D4s_v3` -> `Standard_Ds_v3`
///
/// # Arguments
///
/// * `name` - The name of the instance type
#[must_use]
pub fn family(name: &str) -> String {
    // aws style names put the family before the size
    if let Some((family, _)) = name.split_once('.') {
        return family.to_owned();
    }
    // gcp style names end with a numeric size
    if let Some((family, size)) = name.rsplit_once('-') {
        if !size.is_empty() && size.chars().all(|c| c.is_ascii_digit()) {
            return family.to_owned();
        }
    }
    // azure style names embed the size in the series segment
    name.split('_')
        .enumerate()
        .map(|(index, segment)| {
            if index == 1 {
                segment.chars().filter(|c| !c.is_ascii_digit()).collect()
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<String>>()
        .join("_")
}

/// An instance that should be launched for some owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDemand {
    /// The instance type to launch
    pub instance: InstanceDescriptor,
    /// The user this instance is being launched for
    pub owner: Option<String>,
}

impl InstanceDemand {
    /// Create a new instance demand
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance type to launch
    /// * `owner` - The user this instance is being launched for
    #[must_use]
    pub fn new(instance: InstanceDescriptor, owner: Option<String>) -> Self {
        InstanceDemand { instance, owner }
    }
}
