//! Utilities shared across gridscale

#[cfg(feature = "trace")]
pub mod trace;
