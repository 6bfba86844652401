//! The capacity a host can supply and the capacity a job demands
//!
//! Memory is always tracked in whole GiB.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// How the slots of a job may be spread across hosts
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationRule {
    /// All slots must land on a single host
    #[default]
    PeSlots,
    /// Fill up each host before moving on to the next one
    FillUp,
    /// Spread slots across hosts one at a time
    RoundRobin,
}

impl AllocationRule {
    /// Whether jobs with this rule must be placed as one exclusive chunk
    #[must_use]
    pub fn is_integral(&self) -> bool {
        matches!(self, AllocationRule::PeSlots)
    }

    /// Whether jobs with this rule can be assembled from idle capacity on many hosts
    #[must_use]
    pub fn is_fractional(&self) -> bool {
        !self.is_integral()
    }

    /// Get the kind of demand a job with this rule produces
    #[must_use]
    pub fn demand_kind(&self) -> DemandKind {
        if self.is_integral() {
            DemandKind::Integral
        } else {
            DemandKind::Fractional
        }
    }

    /// Cast this rule to a str
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationRule::PeSlots => "$pe_slots",
            AllocationRule::FillUp => "$fill_up",
            AllocationRule::RoundRobin => "$round_robin",
        }
    }
}

impl fmt::Display for AllocationRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AllocationRule {
    type Err = String;

    /// Cast an allocation rule token to an `AllocationRule`
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().trim_start_matches('$') {
            "pe_slots" => Ok(AllocationRule::PeSlots),
            "fill_up" => Ok(AllocationRule::FillUp),
            "round_robin" => Ok(AllocationRule::RoundRobin),
            unknown => Err(format!("Unknown allocation rule {unknown}")),
        }
    }
}

/// The capacity that is available on a host or instance
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Supply {
    /// The number of cpu cores
    pub cpu: u64,
    /// The number of gpus
    #[serde(default)]
    pub gpu: u64,
    /// The amount of memory in GiB
    #[serde(default)]
    pub mem: u64,
}

impl Supply {
    /// Create a new supply
    ///
    /// # Arguments
    ///
    /// * `cpu` - The number of cpu cores
    /// * `gpu` - The number of gpus
    /// * `mem` - The amount of memory in GiB
    #[must_use]
    pub fn new(cpu: u64, gpu: u64, mem: u64) -> Self {
        Supply { cpu, gpu, mem }
    }

    /// Subtract another supply flooring each dimension at zero
    ///
    /// # Arguments
    ///
    /// * `other` - The supply to subtract
    #[must_use]
    pub fn saturating_sub(&self, other: &Supply) -> Supply {
        Supply {
            cpu: self.cpu.saturating_sub(other.cpu),
            gpu: self.gpu.saturating_sub(other.gpu),
            mem: self.mem.saturating_sub(other.mem),
        }
    }

    /// Check if any dimension of this supply exceeds the other supply
    ///
    /// # Arguments
    ///
    /// * `other` - The supply to compare against
    #[must_use]
    pub fn exceeds(&self, other: &Supply) -> bool {
        self.cpu > other.cpu || self.gpu > other.gpu || self.mem > other.mem
    }

    /// Whether this supply has nothing left in any dimension
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpu == 0 && self.gpu == 0 && self.mem == 0
    }

    /// Scale this supply by some count
    ///
    /// # Arguments
    ///
    /// * `count` - The number of times to repeat this supply
    #[must_use]
    pub fn times(&self, count: u64) -> Supply {
        Supply {
            cpu: self.cpu * count,
            gpu: self.gpu * count,
            mem: self.mem * count,
        }
    }
}

impl Add for Supply {
    type Output = Self;

    /// Add a `Supply` to another `Supply`
    fn add(self, other: Self) -> Self {
        Supply {
            cpu: self.cpu + other.cpu,
            gpu: self.gpu + other.gpu,
            mem: self.mem + other.mem,
        }
    }
}

impl AddAssign for Supply {
    fn add_assign(&mut self, other: Self) {
        self.cpu += other.cpu;
        self.gpu += other.gpu;
        self.mem += other.mem;
    }
}

impl Sum for Supply {
    fn sum<I: Iterator<Item = Supply>>(iter: I) -> Self {
        iter.fold(Supply::default(), |acc, supply| acc + supply)
    }
}

impl fmt::Display for Supply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cpu: {}, gpu: {}, mem: {}G", self.cpu, self.gpu, self.mem)
    }
}

/// Whether a demand must be satisfied whole or can be satisfied piecemeal
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DemandKind {
    /// The demand must be satisfied by a single host at once
    #[default]
    Integral,
    /// The demand can be satisfied by leftovers across many hosts
    Fractional,
}

/// The capacity some job requires
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Demand {
    /// The number of cpu cores
    pub cpu: u64,
    /// The number of gpus
    pub gpu: u64,
    /// The amount of memory in GiB
    pub mem: u64,
    /// The user that owns this demand
    pub owner: Option<String>,
    /// How this demand can be satisfied
    pub kind: DemandKind,
}

impl Demand {
    /// Create a new integral demand
    ///
    /// # Arguments
    ///
    /// * `cpu` - The number of cpu cores
    /// * `gpu` - The number of gpus
    /// * `mem` - The amount of memory in GiB
    #[must_use]
    pub fn integral(cpu: u64, gpu: u64, mem: u64) -> Self {
        Demand {
            cpu,
            gpu,
            mem,
            owner: None,
            kind: DemandKind::Integral,
        }
    }

    /// Create a new fractional demand
    ///
    /// # Arguments
    ///
    /// * `cpu` - The number of cpu cores
    /// * `gpu` - The number of gpus
    /// * `mem` - The amount of memory in GiB
    #[must_use]
    pub fn fractional(cpu: u64, gpu: u64, mem: u64) -> Self {
        Demand {
            cpu,
            gpu,
            mem,
            owner: None,
            kind: DemandKind::Fractional,
        }
    }

    /// Set the owner of this demand
    ///
    /// # Arguments
    ///
    /// * `owner` - The user that owns this demand
    #[must_use]
    pub fn owner<T: Into<String>>(mut self, owner: T) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Whether nothing is left to satisfy in this demand
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.cpu == 0 && self.gpu == 0 && self.mem == 0
    }

    /// Get this demand as the supply that would satisfy it
    #[must_use]
    pub fn as_supply(&self) -> Supply {
        Supply::new(self.cpu, self.gpu, self.mem)
    }

    /// Check if any dimension of this demand exceeds a supply
    ///
    /// # Arguments
    ///
    /// * `supply` - The supply to compare against
    #[must_use]
    pub fn exceeds(&self, supply: &Supply) -> bool {
        self.as_supply().exceeds(supply)
    }

    /// Satisfy as much of this demand as possible from a supply
    ///
    /// Integral demands are either fully satisfied or untouched. Fractional
    /// demands consume whatever each dimension of the supply has left.
    ///
    /// # Arguments
    ///
    /// * `supply` - The supply to draw from
    #[must_use]
    pub fn subtract(&self, supply: &Supply) -> (Demand, Supply) {
        match self.kind {
            DemandKind::Integral => {
                // an integral demand is only consumed if it fits completely
                if self.exceeds(supply) {
                    (self.clone(), *supply)
                } else {
                    let remaining = Demand {
                        cpu: 0,
                        gpu: 0,
                        mem: 0,
                        owner: self.owner.clone(),
                        kind: self.kind,
                    };
                    (remaining, supply.saturating_sub(&self.as_supply()))
                }
            }
            DemandKind::Fractional => {
                let remaining = Demand {
                    cpu: self.cpu.saturating_sub(supply.cpu),
                    gpu: self.gpu.saturating_sub(supply.gpu),
                    mem: self.mem.saturating_sub(supply.mem),
                    owner: self.owner.clone(),
                    kind: self.kind,
                };
                (remaining, supply.saturating_sub(&self.as_supply()))
            }
        }
    }
}

impl fmt::Display for Demand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} cpu: {}, gpu: {}, mem: {}G",
            self.kind, self.cpu, self.gpu, self.mem
        )
    }
}
