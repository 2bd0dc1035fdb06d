//! FSM unit tests

use cutover::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentState::Pending);
    assert!(!fsm.state().is_terminal());
    // A pending run already holds the deploy slot
    assert!(fsm.state().is_active());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Build).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Building);
    assert!(fsm.state().is_active());

    fsm.process(DeploymentEvent::Deploy).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Deploying);

    fsm.process(DeploymentEvent::Verify).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Verifying);

    fsm.process(DeploymentEvent::Complete).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Completed);
    assert!(fsm.state().is_terminal());
    assert!(!fsm.state().is_active());
}

#[test]
fn test_fsm_failure_from_any_active_state() {
    for steps in 0..4 {
        let mut fsm = DeploymentFsm::new();
        let forward = [
            DeploymentEvent::Build,
            DeploymentEvent::Deploy,
            DeploymentEvent::Verify,
        ];
        for event in forward.iter().take(steps) {
            fsm.process(event.clone()).unwrap();
        }

        fsm.process(DeploymentEvent::Fail("boom".to_string())).unwrap();
        assert_eq!(fsm.state(), DeploymentState::Failed);
    }
}

#[test]
fn test_fsm_rolled_back_only_after_failure() {
    let mut fsm = DeploymentFsm::new();
    assert!(fsm.process(DeploymentEvent::RolledBack).is_err());

    fsm.process(DeploymentEvent::Build).unwrap();
    fsm.process(DeploymentEvent::Fail("tests failed".to_string())).unwrap();
    fsm.process(DeploymentEvent::RolledBack).unwrap();
    assert_eq!(fsm.state(), DeploymentState::RolledBack);
}

#[test]
fn test_fsm_never_moves_backward() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Build).unwrap();
    fsm.process(DeploymentEvent::Deploy).unwrap();

    assert!(fsm.process(DeploymentEvent::Build).is_err());
    assert!(fsm.process(DeploymentEvent::Complete).is_err());
    assert_eq!(fsm.state(), DeploymentState::Deploying);
}

#[test]
fn test_fsm_terminal_states_are_final() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Build).unwrap();
    fsm.process(DeploymentEvent::Deploy).unwrap();
    fsm.process(DeploymentEvent::Verify).unwrap();
    fsm.process(DeploymentEvent::Complete).unwrap();

    assert!(fsm.process(DeploymentEvent::Fail("late".to_string())).is_err());
    assert!(fsm.process(DeploymentEvent::RolledBack).is_err());
    assert_eq!(fsm.state(), DeploymentState::Completed);
}

#[test]
fn test_fsm_serializes_as_state() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Build).unwrap();

    let json = serde_json::to_string(&fsm).unwrap();
    assert_eq!(json, "\"building\"");

    let back: DeploymentFsm = serde_json::from_str(&json).unwrap();
    assert_eq!(back, fsm);
}
