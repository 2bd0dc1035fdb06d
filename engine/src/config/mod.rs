//! Configuration module

pub mod settings;

pub use settings::DeploymentConfig;
