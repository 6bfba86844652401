//! Shared models, config and clients for the gridscale autoscaler

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod error;
pub mod models;
pub mod utils;

// expose the cloud client if that feature is enabled
#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub use client::CloudPipeline;

pub use conf::Conf;
pub use error::Error;
