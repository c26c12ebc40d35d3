//! Scheduler Integration Tests
//!
//! End-to-end runs through the orchestrator with a scripted executor:
//! ordering, failure policies, parameters, requirements, retries,
//! timeouts and cancellation.

mod common;

use std::time::Duration;

use common::{compile, orchestrator, ScriptedExecutor, BUILD_DEPLOY};
use shipyard::core::{CancellationToken, ParameterResolver};
use shipyard::domain::{EventType, FailureKind, Run, RunState, StageState, TriggerEvent};
use tempfile::TempDir;

fn params(pairs: &[(&str, &str)]) -> ParameterResolver {
    ParameterResolver::new(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
}

async fn run_manual(
    yaml: &str,
    executor: std::sync::Arc<ScriptedExecutor>,
    temp: &TempDir,
    resolver: ParameterResolver,
) -> Run {
    let pipeline = compile(yaml);
    orchestrator(executor, temp)
        .trigger(&pipeline, TriggerEvent::manual(), resolver, CancellationToken::new())
        .await
        .unwrap()
        .expect("manual runs are always admitted")
}

fn failure_kind(run: &Run, stage: &str) -> Option<FailureKind> {
    run.stage(stage)
        .and_then(|r| r.failure.as_ref())
        .map(|f| f.kind)
}

#[tokio::test]
async fn test_build_then_deploy_succeeds() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();

    let run = run_manual(BUILD_DEPLOY, executor.clone(), &temp, params(&[])).await;

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.stage_state("Build"), Some(StageState::Succeeded));
    assert_eq!(run.stage_state("Deploy"), Some(StageState::Succeeded));
    assert_eq!(executor.steps("Build"), ["compile", "test", "package"]);
    // Default parameter value selects the dev branch
    assert_eq!(executor.steps("Deploy"), ["containerize", "deploy-dev"]);
    assert_eq!(
        run.stage("Deploy").unwrap().parameters.get("DEPLOY_ENV").map(String::as_str),
        Some("dev")
    );
}

#[tokio::test]
async fn test_build_failure_skips_deploy() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let yaml = BUILD_DEPLOY.replace("emit app.jar jar-bytes", "fail");

    let run = run_manual(&yaml, executor.clone(), &temp, params(&[])).await;

    assert!(matches!(run.state, RunState::Failed { .. }));
    assert_eq!(run.stage_state("Build"), Some(StageState::Failed));
    assert_eq!(failure_kind(&run, "Build"), Some(FailureKind::StepExecution));
    assert_eq!(run.stage_state("Deploy"), Some(StageState::Skipped));
    assert_eq!(executor.count("Deploy"), 0);

    let report = run.report().to_string();
    assert!(report.contains("Build"));
    assert!(report.contains("Deploy"));
    assert!(report.contains("skipped"));
}

#[tokio::test]
async fn test_staging_parameter_runs_only_staging_branch() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();

    let run = run_manual(
        BUILD_DEPLOY,
        executor.clone(),
        &temp,
        params(&[("DEPLOY_ENV", "staging")]),
    )
    .await;

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(executor.steps("Deploy"), ["containerize", "deploy-staging"]);
    assert!(executor
        .invocations()
        .iter()
        .filter(|i| i.stage_id == "Deploy")
        .all(|i| i.parameters.get("DEPLOY_ENV").map(String::as_str) == Some("staging")));
}

#[tokio::test]
async fn test_invalid_parameter_fails_before_any_step() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();

    let run = run_manual(
        BUILD_DEPLOY,
        executor.clone(),
        &temp,
        params(&[("DEPLOY_ENV", "canary")]),
    )
    .await;

    assert_eq!(run.stage_state("Build"), Some(StageState::Succeeded));
    assert_eq!(run.stage_state("Deploy"), Some(StageState::Failed));
    assert_eq!(failure_kind(&run, "Deploy"), Some(FailureKind::ParameterValidation));
    assert_eq!(executor.count("Deploy"), 0);
    assert!(run.failure_kinds().contains(&FailureKind::ParameterValidation));
}

const DIAMOND: &str = r#"
name: diamond
stages:
  - id: A
    steps: [{ name: a, run: "sleep 150" }]
  - id: B
    steps: [{ name: b, run: "sleep 150" }]
  - id: C
    depends_on: [A, B]
    steps: [{ name: c, run: "ok" }]
"#;

#[tokio::test]
async fn test_independent_stages_run_concurrently() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();

    let run = run_manual(DIAMOND, executor.clone(), &temp, params(&[])).await;

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(executor.peak_concurrency(), 2);

    // C only starts once both of its dependencies are done
    let order: Vec<String> = executor.invocations().into_iter().map(|i| i.stage_id).collect();
    assert_eq!(order.last().map(String::as_str), Some("C"));
}

#[tokio::test]
async fn test_max_parallel_limits_concurrency() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let pipeline = compile(DIAMOND);

    let run = orchestrator(executor.clone(), &temp)
        .with_max_parallel(1)
        .trigger(&pipeline, TriggerEvent::manual(), params(&[]), CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(executor.peak_concurrency(), 1);
}

#[tokio::test]
async fn test_independent_failure_does_not_touch_sibling() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let yaml = r#"
name: siblings
stages:
  - id: A
    steps: [{ name: a, run: "fail" }]
  - id: B
    steps: [{ name: b, run: "ok" }]
"#;

    let run = run_manual(yaml, executor.clone(), &temp, params(&[])).await;

    assert_eq!(run.stage_state("A"), Some(StageState::Failed));
    assert_eq!(run.stage_state("B"), Some(StageState::Succeeded));
    assert_eq!(executor.count("B"), 1);
    match run.state {
        RunState::Failed { ref error } => assert!(error.contains('A')),
        ref other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_cascade_fail_marks_downstream_failed() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let yaml = r#"
name: cascade
stages:
  - id: A
    steps: [{ name: a, run: "fail" }]
  - id: B
    depends_on: [{ stage: A, policy: cascade_fail }]
    steps: [{ name: b, run: "ok" }]
  - id: C
    depends_on: [B]
    steps: [{ name: c, run: "ok" }]
"#;

    let run = run_manual(yaml, executor.clone(), &temp, params(&[])).await;

    assert_eq!(run.stage_state("B"), Some(StageState::Failed));
    assert_eq!(failure_kind(&run, "B"), Some(FailureKind::UpstreamFailed));
    assert_eq!(run.stage_state("C"), Some(StageState::Skipped));
    assert_eq!(executor.count("B"), 0);
    assert_eq!(executor.count("C"), 0);
}

#[tokio::test]
async fn test_ignore_policy_runs_downstream() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let yaml = r#"
name: ignore
stages:
  - id: Lint
    steps: [{ name: lint, run: "fail" }]
  - id: Package
    depends_on: [{ stage: Lint, policy: ignore }]
    steps: [{ name: package, run: "ok" }]
"#;

    let run = run_manual(yaml, executor.clone(), &temp, params(&[])).await;

    assert_eq!(run.stage_state("Lint"), Some(StageState::Failed));
    assert_eq!(run.stage_state("Package"), Some(StageState::Succeeded));
    assert_eq!(executor.count("Package"), 1);
    assert!(matches!(run.state, RunState::Failed { .. }));
}

#[tokio::test]
async fn test_skip_propagates_down_a_chain() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let yaml = r#"
name: chain
stages:
  - id: A
    steps: [{ name: a, run: "fail" }]
  - id: B
    depends_on: [A]
    steps: [{ name: b, run: "ok" }]
  - id: C
    depends_on: [B]
    steps: [{ name: c, run: "ok" }]
  - id: D
    depends_on: [{ stage: C, policy: ignore }]
    steps: [{ name: d, run: "ok" }]
"#;

    let run = run_manual(yaml, executor.clone(), &temp, params(&[])).await;

    assert_eq!(run.stage_state("B"), Some(StageState::Skipped));
    assert_eq!(run.stage_state("C"), Some(StageState::Skipped));
    // An ignore edge proceeds past a skipped upstream
    assert_eq!(run.stage_state("D"), Some(StageState::Succeeded));
    assert!(run.all_terminal());
}

#[tokio::test]
async fn test_unmet_requirement_blocks_then_fails() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::without(&["mvn"]);

    let run = run_manual(BUILD_DEPLOY, executor.clone(), &temp, params(&[])).await;

    assert_eq!(run.stage_state("Build"), Some(StageState::Failed));
    assert_eq!(failure_kind(&run, "Build"), Some(FailureKind::RequirementNotMet));
    assert_eq!(run.stage_state("Deploy"), Some(StageState::Skipped));
    assert_eq!(executor.count("Build"), 0);

    let replayed = orchestrator(executor, &temp)
        .get_run_status(run.id)
        .await
        .unwrap();
    assert_eq!(replayed.stage_state("Build"), Some(StageState::Failed));
}

#[tokio::test]
async fn test_retry_until_success() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let yaml = r#"
name: retry
stages:
  - id: Flaky
    steps: [{ name: flaky, run: "flaky 2" }]
    retry: { max_attempts: 3, initial_delay_ms: 10, max_delay_ms: 20 }
"#;

    let run = run_manual(yaml, executor.clone(), &temp, params(&[])).await;

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.stage("Flaky").unwrap().attempts, 3);
    assert_eq!(executor.count("Flaky"), 3);
}

#[tokio::test]
async fn test_retry_exhausted_fails_stage() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let yaml = r#"
name: retry
stages:
  - id: Broken
    steps: [{ name: broken, run: "fail" }]
    retry: { max_attempts: 2, initial_delay_ms: 10 }
"#;

    let run = run_manual(yaml, executor.clone(), &temp, params(&[])).await;

    assert_eq!(run.stage_state("Broken"), Some(StageState::Failed));
    assert_eq!(failure_kind(&run, "Broken"), Some(FailureKind::StepExecution));
    assert_eq!(run.stage("Broken").unwrap().attempts, 2);
    assert_eq!(executor.count("Broken"), 2);
}

#[tokio::test]
async fn test_stage_timeout_is_step_failure() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let yaml = r#"
name: slow
stages:
  - id: Slow
    steps: [{ name: slow, run: "sleep 5000" }]
    timeout_seconds: 1
"#;

    let run = run_manual(yaml, executor, &temp, params(&[])).await;

    let record = run.stage("Slow").unwrap();
    assert_eq!(record.state, StageState::Failed);
    let failure = record.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::StepExecution);
    assert!(failure.message.contains("timed out"));
}

#[tokio::test]
async fn test_cancellation_skips_pending_and_fails_running() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let pipeline = compile(
        r#"
name: cancel
stages:
  - id: Long
    steps: [{ name: long, run: "sleep 10000" }]
  - id: Other
    steps: [{ name: other, run: "ok" }]
  - id: After
    depends_on: [Long]
    steps: [{ name: after, run: "ok" }]
"#,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
    }

    let run = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator(executor.clone(), &temp)
            .with_max_parallel(1)
            .trigger(&pipeline, TriggerEvent::manual(), params(&[]), cancel),
    )
    .await
    .expect("cancellation must end the run promptly")
    .unwrap()
    .unwrap();

    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(run.stage_state("Long"), Some(StageState::Failed));
    assert_eq!(failure_kind(&run, "Long"), Some(FailureKind::Cancelled));
    assert_eq!(run.stage_state("Other"), Some(StageState::Skipped));
    assert_eq!(run.stage_state("After"), Some(StageState::Skipped));
    assert_eq!(executor.count("Other"), 0);
    assert_eq!(executor.count("After"), 0);
}

#[tokio::test]
async fn test_events_follow_stage_lifecycle() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let yaml = BUILD_DEPLOY.replace("emit app.jar jar-bytes", "fail");

    let run = run_manual(&yaml, executor.clone(), &temp, params(&[])).await;

    let store = shipyard::core::EventStore::open_in(&temp.path().join("runs"), run.id)
        .await
        .unwrap();
    let events = store.replay().await.unwrap();
    let types: Vec<(Option<String>, EventType)> = events
        .iter()
        .map(|e| (e.stage_id.clone(), e.event_type))
        .collect();

    assert_eq!(types.first().map(|t| t.1), Some(EventType::RunStarted));
    assert_eq!(types.last().map(|t| t.1), Some(EventType::RunFailed));
    let deploy: Vec<EventType> = types
        .iter()
        .filter(|(stage, _)| stage.as_deref() == Some("Deploy"))
        .map(|(_, t)| *t)
        .collect();
    assert_eq!(deploy, [EventType::StageBlocked, EventType::StageSkipped]);
}
