//! Turns pending jobs into the demands that workers must satisfy

use gridscale::models::{Demand, Job, Supply};
use std::vec::IntoIter;

use super::engines::AllocationRules;

/// Get the capacity left over once running jobs are placed
///
/// # Arguments
///
/// * `supply` - The total supply of every host
/// * `running` - The jobs that are running
#[must_use]
pub fn idle_supply<'a, I>(supply: Supply, running: I) -> Supply
where
    I: IntoIterator<Item = &'a Job>,
{
    let used = running.into_iter().map(Job::supply).sum::<Supply>();
    supply.saturating_sub(&used)
}

/// Lazily yields the demand of each job in root id order
///
/// Fractional jobs are first satisfied from the idle capacity in the cluster
/// and only yield what is left unmet. Integral jobs always yield their full
/// demand and never touch the idle capacity.
pub struct DemandSelector<'a> {
    /// The jobs left to yield demands for
    jobs: IntoIter<&'a Job>,
    /// The allocation rules for our jobs
    rules: &'a AllocationRules,
    /// The idle capacity fractional jobs have not drawn from yet
    idle: Supply,
}

impl<'a> DemandSelector<'a> {
    /// Create a new demand selector
    ///
    /// # Arguments
    ///
    /// * `jobs` - The jobs to yield demands for
    /// * `rules` - The allocation rules for our jobs
    /// * `idle` - The idle capacity in the cluster
    #[must_use]
    pub fn new(jobs: &'a [Job], rules: &'a AllocationRules, idle: Supply) -> Self {
        let mut ordered = jobs.iter().collect::<Vec<&Job>>();
        ordered.sort_by(|left, right| left.order_key().cmp(&right.order_key()));
        DemandSelector {
            jobs: ordered.into_iter(),
            rules,
            idle,
        }
    }

    /// The idle capacity that has not been drawn from yet
    #[must_use]
    pub fn idle(&self) -> Supply {
        self.idle
    }
}

impl<'a> Iterator for DemandSelector<'a> {
    type Item = (&'a Job, Demand);

    fn next(&mut self) -> Option<Self::Item> {
        let job = self.jobs.next()?;
        let rule = self.rules.get(&job.pe).copied().unwrap_or_default();
        let demand = job.demand(rule.demand_kind());
        if rule.is_integral() {
            return Some((job, demand));
        }
        // draw what we can from the idle capacity
        let (remaining, idle) = demand.subtract(&self.idle);
        self.idle = idle;
        Some((job, remaining))
    }
}
