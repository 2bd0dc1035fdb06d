//! Cutover deployment engine
//!
//! Builds, tests, migrates and rolls out container images to a cluster with
//! blue-green, rolling, canary or recreate strategies, verifies the result
//! and rolls back automatically on failure.

pub mod config;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod health;
pub mod logs;
pub mod metrics;
pub mod models;
pub mod server;
pub mod telemetry;
pub mod utils;
