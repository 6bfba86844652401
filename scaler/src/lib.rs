//! The autoscaler that grows and shrinks elastic workers for SGE and SLURM clusters

mod args;
pub mod libs;

pub use args::Args;
pub use libs::{Autoscaler, Daemon, Handles, TickOutcome};

// these are only for tests
#[cfg(feature = "test-utilities")]
pub use libs::engines::dry_run::{DryRunEngine, DryRunState};
#[cfg(feature = "test-utilities")]
pub use libs::executor::DryRunExecutor;
#[cfg(feature = "test-utilities")]
pub use libs::provisioners::dry_run::{DryRunCloud, DryRunProvisioner};

// expose test utilities if that feature is enabled
#[cfg(feature = "test-utilities")]
pub mod test_utilities;
