mod autoscaler;
mod daemon;
pub mod demand;
pub mod engines;
pub mod executor;
pub mod helpers;
pub mod hosts;
pub mod instances;
pub mod provisioners;
pub mod resolver;
pub mod scale_down;
pub mod scale_up;
mod tags;
pub mod validator;

pub use autoscaler::{Autoscaler, Handles, TickOutcome};
pub use daemon::Daemon;
pub use tags::Tagger;
