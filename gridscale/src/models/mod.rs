//! The structures shared across the gridscale autoscaler

pub mod conversions;
mod instances;
mod jobs;
mod resources;
mod runs;

pub use instances::{InstanceDemand, InstanceDescriptor, family};
pub use jobs::{Job, JobState};
pub use resources::{AllocationRule, Demand, DemandKind, Supply};
pub use runs::{Run, RunRequest, RunStatus, TaskStatus};
