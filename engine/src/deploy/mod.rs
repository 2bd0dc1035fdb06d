//! Deployment pipeline, strategies and orchestration

pub mod cluster;
pub mod command;
pub mod events;
pub mod fsm;
pub mod manifest;
pub mod orchestrator;
pub mod pipeline;
pub mod strategy;

pub use orchestrator::{HistorySnapshot, Orchestrator};
