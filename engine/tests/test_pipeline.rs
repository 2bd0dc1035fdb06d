//! Pipeline tests against scripted docker/kubectl, probes and metrics

mod common;

use common::{config, Harness};
use cutover::deploy::events::DeployNotification;
use cutover::deploy::fsm::DeploymentState;
use cutover::errors::DeployError;
use cutover::models::deployment::{DeployOptions, StepStatus};

#[tokio::test(start_paused = true)]
async fn test_rolling_deploy_runs_every_step() {
    let h = Harness::new(config());
    let mut events = h.orchestrator.subscribe();

    h.orchestrator
        .deploy("v1", DeployOptions::default())
        .await
        .unwrap();

    let status = h.orchestrator.get_status().await.unwrap();
    assert_eq!(status.state(), DeploymentState::Completed);
    assert_eq!(
        status.step_names(),
        vec![
            "pre-deployment-checks",
            "build-image",
            "run-tests",
            "database-migration",
            "deploy-application",
            "verify-deployment",
            "update-monitoring",
            "cleanup",
        ]
    );
    for step in &status.steps {
        let expected = if step.name == "database-migration" {
            StepStatus::Skipped
        } else {
            StepStatus::Completed
        };
        assert_eq!(step.status, expected, "step {}", step.name);
    }
    assert!(status.finished_at.is_some());
    assert!(status.metrics.duration_ms.is_some());

    let lines = h.runner.lines();
    let build = lines
        .iter()
        .position(|l| l.starts_with("docker build -t registry.local/acme/api:v1"))
        .unwrap();
    let push = lines
        .iter()
        .position(|l| l == "docker push registry.local/acme/api:v1")
        .unwrap();
    let test = lines
        .iter()
        .position(|l| l == "docker run --rm registry.local/acme/api:v1 make test")
        .unwrap();
    let apply = lines.iter().position(|l| l.contains(" apply ")).unwrap();
    assert!(build < push && push < test && test < apply);
    assert_eq!(
        h.runner.applied_image("api").as_deref(),
        Some("registry.local/acme/api:v1")
    );

    assert_eq!(h.orchestrator.version_history().await, vec!["v1"]);
    assert_eq!(h.metrics.annotations.lock().unwrap().len(), 1);
    assert!(h.probe.probed().contains(&"http://api.staging.svc/health".to_string()));

    let first = events.try_recv().unwrap();
    assert!(matches!(
        first.notification,
        DeployNotification::DeploymentStarted { ref version, .. } if version == "v1"
    ));
    let mut last = first;
    while let Ok(record) = events.try_recv() {
        last = record;
    }
    assert!(matches!(
        last.notification,
        DeployNotification::DeploymentCompleted { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_is_repeatable_and_mutates_nothing() {
    let h = Harness::new(config());
    h.orchestrator
        .deploy("v1", DeployOptions::default())
        .await
        .unwrap();
    h.runner.clear();
    let annotations = h.metrics.annotations.lock().unwrap().len();

    let dry_run = DeployOptions {
        dry_run: true,
        ..Default::default()
    };
    h.orchestrator.deploy("v2", dry_run).await.unwrap();
    let first = h.orchestrator.get_status().await.unwrap();
    h.orchestrator.deploy("v2", dry_run).await.unwrap();
    let second = h.orchestrator.get_status().await.unwrap();

    assert!(first.dry_run);
    assert_eq!(first.state(), DeploymentState::Completed);
    assert_eq!(first.step_outline(), second.step_outline());
    assert_ne!(first.id, second.id);

    // Only read-only queries reached the runner
    for line in h.runner.lines() {
        assert!(line.starts_with("command -v "), "unexpected command {}", line);
    }
    assert_eq!(h.orchestrator.version_history().await, vec!["v1"]);
    assert_eq!(h.metrics.annotations.lock().unwrap().len(), annotations);
}

#[tokio::test(start_paused = true)]
async fn test_skip_tests_marks_step_skipped() {
    let h = Harness::new(config());
    h.orchestrator
        .deploy(
            "v1",
            DeployOptions {
                skip_tests: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let status = h.orchestrator.get_status().await.unwrap();
    let step = status.step("run-tests").unwrap();
    assert_eq!(step.status, StepStatus::Skipped);
    assert_eq!(step.output.as_deref(), Some("skip_tests requested"));
    assert_eq!(h.runner.count("make test"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_migration_backs_up_first() {
    let mut config = config();
    config.migrations.enabled = true;
    config.migrations.backup_command = Some("pg_dump -f backup-{version}.sql".to_string());
    config.migrations.command = Some("docker run --rm {image} migrate".to_string());
    let h = Harness::new(config);

    h.orchestrator
        .deploy("v3", DeployOptions::default())
        .await
        .unwrap();

    let lines = h.runner.lines();
    let backup = lines
        .iter()
        .position(|l| l == "pg_dump -f backup-v3.sql")
        .unwrap();
    let migrate = lines
        .iter()
        .position(|l| l == "docker run --rm registry.local/acme/api:v3 migrate")
        .unwrap();
    let apply = lines.iter().position(|l| l.contains(" apply ")).unwrap();
    assert!(backup < migrate && migrate < apply);
}

#[tokio::test(start_paused = true)]
async fn test_failed_tests_stop_before_cluster_changes() {
    let h = Harness::new(config());
    h.runner.fail_on("make test");

    let err = h
        .orchestrator
        .deploy("v1", DeployOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Command { .. }));

    let status = h.orchestrator.get_status().await.unwrap();
    assert_eq!(status.step("run-tests").unwrap().status, StepStatus::Failed);
    assert!(status.step("deploy-application").is_none());
    assert!(h.runner.applied().is_empty());
    assert!(h.orchestrator.version_history().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_annotation_failure_is_only_a_warning() {
    let h = Harness::new(config());
    *h.metrics.fail_annotations.lock().unwrap() = true;

    h.orchestrator
        .deploy("v1", DeployOptions::default())
        .await
        .unwrap();

    let status = h.orchestrator.get_status().await.unwrap();
    assert_eq!(status.state(), DeploymentState::Completed);
    assert_eq!(
        status.step("update-monitoring").unwrap().status,
        StepStatus::Failed
    );
    assert_eq!(status.step("cleanup").unwrap().status, StepStatus::Completed);
    assert!(status
        .warnings
        .iter()
        .any(|w| w.starts_with("update-monitoring:")));
    assert!(status.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_metrics_do_not_fail_verification() {
    let h = Harness::new(config());
    *h.metrics.unreachable.lock().unwrap() = true;

    h.orchestrator
        .deploy("v1", DeployOptions::default())
        .await
        .unwrap();

    let status = h.orchestrator.get_status().await.unwrap();
    assert_eq!(status.state(), DeploymentState::Completed);
    assert!(status
        .warnings
        .iter()
        .any(|w| w.starts_with("error rate unavailable")));
}

#[tokio::test(start_paused = true)]
async fn test_slow_p99_is_a_warning() {
    let mut config = config();
    config.monitoring.max_latency_ms = Some(500.0);
    let h = Harness::new(config);
    *h.metrics.latency_ms.lock().unwrap() = Some(850.0);

    h.orchestrator
        .deploy("v1", DeployOptions::default())
        .await
        .unwrap();

    let status = h.orchestrator.get_status().await.unwrap();
    assert_eq!(status.state(), DeploymentState::Completed);
    assert!(status
        .warnings
        .contains(&"p99 latency 850ms above 500ms".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_health_check_fails_verification() {
    let h = Harness::new(config());
    h.probe.respond("http://api.staging.svc/health", 503);

    let err = h
        .orchestrator
        .deploy("v1", DeployOptions::default())
        .await
        .unwrap_err();
    match err {
        DeployError::HealthCheck { failed } => assert_eq!(failed, vec!["api"]),
        other => panic!("unexpected error {:?}", other),
    }

    let status = h.orchestrator.get_status().await.unwrap();
    assert_eq!(
        status.step("verify-deployment").unwrap().status,
        StepStatus::Failed
    );
    assert!(h.orchestrator.version_history().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_keeps_the_version_window() {
    let mut config = config();
    config.rollback.keep_previous_versions = 3;
    let h = Harness::new(config);

    for version in ["v1", "v2", "v3", "v4", "v5"] {
        h.orchestrator
            .deploy(version, DeployOptions::default())
            .await
            .unwrap();
    }

    assert_eq!(h.orchestrator.version_history().await, vec!["v3", "v4", "v5"]);
    assert_eq!(h.runner.count("docker rmi registry.local/acme/api:v1"), 1);
    assert_eq!(h.runner.count("docker rmi registry.local/acme/api:v2"), 1);
    assert_eq!(h.runner.count("docker rmi registry.local/acme/api:v3"), 0);
    assert_eq!(h.orchestrator.get_history(10).await.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_history_is_newest_first_and_limited() {
    let h = Harness::new(config());
    for version in ["v1", "v2", "v3"] {
        h.orchestrator
            .deploy(version, DeployOptions::default())
            .await
            .unwrap();
    }

    let history = h.orchestrator.get_history(2).await;
    let versions: Vec<&str> = history.iter().map(|s| s.version.as_str()).collect();
    assert_eq!(versions, vec!["v3", "v2"]);
    assert!(h.orchestrator.in_progress().await.is_empty());
}
