use clap::Parser;
use gridscale::conf::EngineKind;

/// The command line args to pass to the scaler
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "gridscale.yml")]
    pub config: String,
    /// The batch engine to scale workers for (overrides the config)
    #[clap(short, long, ignore_case = true)]
    pub engine: Option<EngineKind>,
    /// Don't actually launch or retire workers
    #[clap(long, default_value_t)]
    pub dry_run: bool,
}
