//! Sets up tracing for gridscale on stdout/stderr

use tracing_subscriber::prelude::*;

use crate::conf::{LogLevel, Tracing};

/// Log a message at the setup level
///
/// Setup messages are printed before any subscriber exists so they bypass tracing.
#[macro_export]
macro_rules! setup {
    ($level:expr, $($msg:tt)+) => {
        if $level != $crate::conf::LogLevel::Off
        && $level != $crate::conf::LogLevel::Error
        && $level != $crate::conf::LogLevel::Warn {
            println!("{}", serde_json::json!({"timestamp": chrono::Utc::now(), "level": "SETP", "msg": $($msg)+}));
        }
    }
}

/// Setup our local tracer
///
/// # Arguments
///
/// * `name` - The name of the service we are tracing
/// * `conf` - The tracing settings to use
pub fn setup(name: &str, conf: &Tracing) {
    // log that local tracing is enabled
    setup!(conf.level, format!("Sending {} traces for {name} to stdout", conf.level));
    // build our filter
    let filter = conf.level.to_filter();
    // json and plain text layers are different types so init them separately
    let result = if conf.json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_filter(filter))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(filter))
            .try_init()
    };
    // a subscriber may already exist in tests
    if let Err(err) = result {
        if conf.level != LogLevel::Off {
            eprintln!("Failed to register stdout tracer: {err}");
        }
    }
}
