//! Picks which instances to launch for a set of demands

use gridscale::conf::{InstanceSelection, SelectionStrategy};
use gridscale::models::{Demand, InstanceDemand, InstanceDescriptor, Supply};
use std::sync::Arc;
use tracing::{Level, event};

mod availability;
mod providers;

pub use availability::AvailabilityTracker;
pub use providers::{InstanceCatalog, InstanceProvider, chain};

/// Get how much of some demands an instance supply would satisfy
///
/// Demands are drawn from the supply in order.
///
/// # Arguments
///
/// * `demands` - The demands to satisfy
/// * `supply` - The supply to draw from
fn fulfilled(demands: &[Demand], mut supply: Supply) -> Supply {
    let mut fulfilled = Supply::default();
    for demand in demands {
        let (remaining, left) = demand.subtract(&supply);
        fulfilled += demand.as_supply().saturating_sub(&remaining.as_supply());
        supply = left;
    }
    fulfilled
}

/// Picks instance types for demands
pub struct InstanceSelector {
    /// The chain of providers that offers instance types
    provider: Box<dyn InstanceProvider>,
    /// How demands are matched to instance types
    strategy: SelectionStrategy,
    /// The capacity reserved on every worker
    reserved: Supply,
}

impl InstanceSelector {
    /// Create a new instance selector
    ///
    /// # Arguments
    ///
    /// * `conf` - The instance selection settings
    /// * `catalog` - The instance types the cloud offers
    /// * `tracker` - The recent launch failures
    pub fn new(
        conf: &InstanceSelection,
        catalog: &Arc<InstanceCatalog>,
        tracker: &Arc<AvailabilityTracker>,
    ) -> Self {
        // the naive strategy ignores any reserved capacity
        let reserved = match conf.strategy {
            SelectionStrategy::NaiveCpuCapacity => Supply::default(),
            _ => conf.reserved_supply(),
        };
        event!(Level::INFO, strategy = conf.strategy.to_string(), reserved = reserved.to_string());
        InstanceSelector {
            provider: chain(conf, catalog, tracker),
            strategy: conf.strategy,
            reserved,
        }
    }

    /// Get the instance types that can be launched right now
    pub async fn instances(&self) -> Vec<InstanceDescriptor> {
        self.provider.provide().await
    }

    /// Pick the instances to launch for some demands
    ///
    /// # Arguments
    ///
    /// * `instances` - The instance types that can be launched
    /// * `demands` - The demands to launch instances for
    /// * `max` - The most instances to pick
    #[must_use]
    pub fn select(
        &self,
        instances: &[InstanceDescriptor],
        demands: Vec<Demand>,
        max: usize,
    ) -> Vec<InstanceDemand> {
        // skip any demands that are already satisfied
        let demands: Vec<Demand> = demands
            .into_iter()
            .filter(|demand| !demand.is_satisfied())
            .collect();
        if instances.is_empty() {
            event!(Level::WARN, msg = "No instance types are available", demands = demands.len());
            return Vec::default();
        }
        match self.strategy {
            SelectionStrategy::CpuCapacity | SelectionStrategy::NaiveCpuCapacity => {
                self.pack(instances, demands, max)
            }
            SelectionStrategy::Default => Self::one_per_demand(instances, demands, max),
        }
    }

    /// Pack demands into the instances that satisfy the most of them
    ///
    /// Each step picks the instance that satisfies the most cpu of the
    /// remaining demands preferring smaller instances on ties.
    ///
    /// # Arguments
    ///
    /// * `instances` - The instance types that can be launched
    /// * `demands` - The demands to launch instances for
    /// * `max` - The most instances to pick
    fn pack(
        &self,
        instances: &[InstanceDescriptor],
        mut remaining: Vec<Demand>,
        max: usize,
    ) -> Vec<InstanceDemand> {
        let mut selected = Vec::default();
        while !remaining.is_empty() && selected.len() < max {
            // find the instance that satisfies the most of what is left
            let best = instances
                .iter()
                .map(|instance| {
                    let supply = instance.supply().saturating_sub(&self.reserved);
                    (instance, fulfilled(&remaining, supply))
                })
                .max_by(|(left, left_fill), (right, right_fill)| {
                    (left_fill.cpu, left_fill.gpu, left_fill.mem)
                        .cmp(&(right_fill.cpu, right_fill.gpu, right_fill.mem))
                        .then(right.cpu.cmp(&left.cpu))
                        .then(right.mem.cmp(&left.mem))
                });
            let Some((instance, fill)) = best else {
                break;
            };
            // nothing fits in any instance so stop
            if fill.is_empty() {
                event!(
                    Level::WARN,
                    msg = "Demands do not fit any instance type",
                    demands = remaining.len()
                );
                break;
            }
            // draw our demands from this instance
            let mut supply = instance.supply().saturating_sub(&self.reserved);
            let mut owner = None;
            let mut unmet = Vec::with_capacity(remaining.len());
            for demand in remaining {
                let (rest, left) = demand.subtract(&supply);
                // this instance is launched for whoever it serves first
                if owner.is_none() && rest != demand {
                    owner = demand.owner.clone();
                }
                supply = left;
                if !rest.is_satisfied() {
                    unmet.push(rest);
                }
            }
            remaining = unmet;
            selected.push(InstanceDemand::new(instance.clone(), owner));
        }
        selected
    }

    /// Pick a single instance for each demand
    ///
    /// # Arguments
    ///
    /// * `instances` - The instance types that can be launched
    /// * `demands` - The demands to launch instances for
    /// * `max` - The most instances to pick
    fn one_per_demand(
        instances: &[InstanceDescriptor],
        demands: Vec<Demand>,
        max: usize,
    ) -> Vec<InstanceDemand> {
        demands
            .into_iter()
            .take(max)
            .filter_map(|demand| {
                // use the first instance that covers this demand
                let instance = instances
                    .iter()
                    .find(|instance| !demand.exceeds(&instance.supply()))
                    .or_else(|| instances.first())?;
                Some(InstanceDemand::new(instance.clone(), demand.owner))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::provisioners::DryRunProvisioner;

    /// Build a selector over the m5 family
    async fn selector(strategy: SelectionStrategy, reserved_cpu: u64) -> InstanceSelector {
        let instances = vec![
            InstanceDescriptor::new("m5.large", 2, 0, 8),
            InstanceDescriptor::new("m5.xlarge", 4, 0, 16),
            InstanceDescriptor::new("m5.2xlarge", 8, 0, 32),
            InstanceDescriptor::new("m5.4xlarge", 16, 0, 64),
        ];
        let provisioner = Arc::new(DryRunProvisioner::new(instances));
        let catalog = Arc::new(InstanceCatalog::load(provisioner).await.unwrap());
        let tracker = Arc::new(AvailabilityTracker::new(600));
        let mut conf = InstanceSelection {
            instance_type: "m5.large".to_owned(),
            family: true,
            strategy,
            ..InstanceSelection::default()
        };
        conf.reserved.cpu = reserved_cpu;
        InstanceSelector::new(&conf, &catalog, &tracker)
    }

    #[tokio::test]
    async fn packs_integral_demands() {
        let selector = selector(SelectionStrategy::CpuCapacity, 0).await;
        let instances = selector.instances().await;
        let demands = vec![
            Demand::integral(4, 0, 0).owner("alice"),
            Demand::integral(4, 0, 0).owner("bob"),
            Demand::integral(4, 0, 0).owner("carol"),
        ];
        let selected = selector.select(&instances, demands, 5);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].instance.name, "m5.4xlarge");
        assert_eq!(selected[0].owner.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn prefers_smaller_instances_on_ties() {
        let selector = selector(SelectionStrategy::CpuCapacity, 0).await;
        let instances = selector.instances().await;
        let selected = selector.select(&instances, vec![Demand::integral(3, 0, 4)], 5);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].instance.name, "m5.xlarge");
    }

    #[tokio::test]
    async fn reserved_capacity() {
        let demands = || vec![Demand::integral(4, 0, 0)];
        // a 4 cpu demand no longer fits a 4 cpu instance with 1 cpu reserved
        let reserving = selector(SelectionStrategy::CpuCapacity, 1).await;
        let instances = reserving.instances().await;
        let selected = reserving.select(&instances, demands(), 5);
        assert_eq!(selected[0].instance.name, "m5.2xlarge");
        // the naive strategy ignores the reservation
        let naive = selector(SelectionStrategy::NaiveCpuCapacity, 1).await;
        let selected = naive.select(&instances, demands(), 5);
        assert_eq!(selected[0].instance.name, "m5.xlarge");
    }

    #[tokio::test]
    async fn caps_and_fractions() {
        let selector = selector(SelectionStrategy::CpuCapacity, 0).await;
        let instances = selector.instances().await;
        // a fractional demand can span several instances
        let selected = selector.select(&instances, vec![Demand::fractional(40, 0, 0)], 2);
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|pick| pick.instance.cpu == 16));
        // nothing fits an integral demand bigger than every instance
        assert!(selector.select(&instances, vec![Demand::integral(64, 0, 0)], 2).is_empty());
        // satisfied demands are skipped
        assert!(selector.select(&instances, vec![Demand::fractional(0, 0, 0)], 2).is_empty());
    }

    #[tokio::test]
    async fn one_per_demand() {
        let selector = selector(SelectionStrategy::Default, 0).await;
        let instances = selector.instances().await;
        let demands = vec![
            Demand::integral(1, 0, 0).owner("alice"),
            Demand::integral(6, 0, 0).owner("bob"),
            Demand::integral(1, 0, 0).owner("carol"),
        ];
        let selected = selector.select(&instances, demands, 2);
        assert_eq!(selected.len(), 2);
        // instances are offered biggest first
        assert_eq!(selected[0].instance.name, "m5.4xlarge");
        assert_eq!(selected[1].owner.as_deref(), Some("bob"));
        assert!(selector.select(&[], vec![Demand::integral(1, 0, 0)], 2).is_empty());
    }
}
