//! Finite State Machine for a single deployment

use serde::{Deserialize, Serialize};

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Created, running pre-deployment checks
    Pending,

    /// Building the image, running tests and migrations
    Building,

    /// Strategy cutover in progress
    Deploying,

    /// Post-deploy verification and housekeeping
    Verifying,

    /// Successfully deployed
    Completed,

    /// Deployment failed
    Failed,

    /// Failed, then recovered by a successful rollback
    RolledBack,
}

impl DeploymentState {
    /// Whether no further transition except rollback is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Completed | DeploymentState::Failed | DeploymentState::RolledBack
        )
    }

    /// Whether a deployment in this state holds the in-process deploy slot.
    /// `Pending` counts: a run claims the slot before its pre-checks.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentState::Pending => "pending",
            DeploymentState::Building => "building",
            DeploymentState::Deploying => "deploying",
            DeploymentState::Verifying => "verifying",
            DeploymentState::Completed => "completed",
            DeploymentState::Failed => "failed",
            DeploymentState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Pre-deployment checks passed, start building
    Build,

    /// Start the strategy cutover
    Deploy,

    /// Start verification
    Verify,

    /// All required steps passed
    Complete,

    /// A required step failed
    Fail(String),

    /// A rollback recovered from the failure
    RolledBack,
}

/// Deployment FSM.
///
/// Strictly forward: `pending -> building -> deploying -> verifying ->
/// completed`, any non-terminal state may fail, and only a failed deployment
/// may be marked rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentFsm {
    state: DeploymentState,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Pending,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (DeploymentState::Pending, DeploymentEvent::Build) => DeploymentState::Building,
            (DeploymentState::Building, DeploymentEvent::Deploy) => DeploymentState::Deploying,
            (DeploymentState::Deploying, DeploymentEvent::Verify) => DeploymentState::Verifying,
            (DeploymentState::Verifying, DeploymentEvent::Complete) => DeploymentState::Completed,

            (state, DeploymentEvent::Fail(_)) if !state.is_terminal() => DeploymentState::Failed,

            (DeploymentState::Failed, DeploymentEvent::RolledBack) => DeploymentState::RolledBack,

            // Invalid transitions
            (state, event) => {
                return Err(format!("{:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
