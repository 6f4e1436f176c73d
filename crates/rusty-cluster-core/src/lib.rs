//! Core config, launch options, and error taxonomy for Rusty Cluster.

pub mod config;
pub mod error;
pub mod launch;

pub use config::{ClusterOptions, ConcurrencyModel, Config, LoggingConfig};
pub use error::{ClusterError, JobError, Result};
pub use launch::LaunchOptions;
