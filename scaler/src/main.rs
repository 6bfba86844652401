use clap::Parser;
use gridscale_scaler::{Args, Daemon};

/// The gridscale autoscaler
#[tokio::main]
async fn main() {
    // get command line args
    let args = Args::parse();
    // try to load a config file
    let mut conf = match gridscale::Conf::new(&args.config) {
        Ok(conf) => conf,
        Err(error) => {
            eprintln!("Failed to load config {}: {error}", args.config);
            std::process::exit(1);
        }
    };
    // the command line can pick a different engine
    if let Some(engine) = args.engine {
        conf.autoscaler.engine = engine;
    }
    // setup our tracer
    gridscale::utils::trace::setup("GridscaleScaler", &conf.tracing);
    // setup our daemon
    let daemon = match Daemon::new(conf, args.dry_run).await {
        Ok(daemon) => daemon,
        Err(error) => {
            tracing::event!(tracing::Level::ERROR, msg = "Failed to start", error = error.to_string());
            std::process::exit(1);
        }
    };
    // scale until we are interrupted
    if let Err(error) = daemon.start().await {
        tracing::event!(tracing::Level::ERROR, msg = "Daemon crashed", error = error.to_string());
        std::process::exit(1);
    }
}
