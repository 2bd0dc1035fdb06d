//! Server state

use std::sync::Arc;

use crate::deploy::Orchestrator;

/// Server state shared across handlers
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
}

impl ServerState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}
