//! A client for the cloud api that launches and stops elastic workers

mod cloud;
mod helpers;

pub use cloud::CloudPipeline;
pub use helpers::{Envelope, InstanceOffer, TaskInfo};
