//! Core of the echo bot worker.
//!
//! This crate is intentionally transport-agnostic. Kafka and the sidecar HTTP
//! API live behind ports (traits) implemented in adapter crates.

pub mod command;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod ports;
pub mod update;
pub mod worker;

pub use errors::{Error, Result};
