//! Health checks and canary observation

pub mod canary;
pub mod checker;

pub use canary::{CanaryMonitor, CanaryVerdict};
pub use checker::{HealthCheck, HealthChecker, Probe, ReqwestProbe};
