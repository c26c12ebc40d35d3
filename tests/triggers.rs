//! Trigger Admission Tests
//!
//! Branch filters decide which change notifications start a run. Each
//! admitted event creates exactly one run; rejected events create none.

mod common;

use common::{compile, orchestrator, ScriptedExecutor, BUILD_DEPLOY};
use shipyard::core::{CancellationToken, ParameterResolver};
use shipyard::domain::{RunState, TriggerEvent};
use tempfile::TempDir;

#[tokio::test]
async fn test_excluded_branch_creates_no_run() {
    let temp = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let orchestrator = orchestrator(executor.clone(), &temp);
    let pipeline = compile(BUILD_DEPLOY);

    let outcome = orchestrator
        .trigger(
            &pipeline,
            TriggerEvent::branch("refs/heads/experimental/x"),
            ParameterResolver::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(outcome.is_none());
    assert!(executor.invocations().is_empty());
    assert!(orchestrator.list_runs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_included_branch_runs() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(ScriptedExecutor::new(), &temp);
    let pipeline = compile(BUILD_DEPLOY);

    let run = orchestrator
        .trigger(
            &pipeline,
            TriggerEvent::branch("refs/heads/main").with_revision(Some("abc123".to_string())),
            ParameterResolver::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .expect("main should be admitted");

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.trigger.short_name(), Some("main"));
    assert_eq!(run.trigger.revision.as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_manual_run_bypasses_filter() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(ScriptedExecutor::new(), &temp);
    let pipeline = compile(&BUILD_DEPLOY.replace("\"+:*\", ", ""));

    // Only an exclude rule is left, which rejects every branch
    let rejected = orchestrator
        .trigger(
            &pipeline,
            TriggerEvent::branch("main"),
            ParameterResolver::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(rejected.is_none());

    let manual = orchestrator
        .trigger(
            &pipeline,
            TriggerEvent::manual(),
            ParameterResolver::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(manual.is_some());
}

#[tokio::test]
async fn test_each_admitted_event_gets_its_own_run() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(ScriptedExecutor::new(), &temp);
    let pipeline = compile(BUILD_DEPLOY);

    let mut ids = Vec::new();
    for branch in ["main", "feature/login", "main"] {
        let run = orchestrator
            .trigger(
                &pipeline,
                TriggerEvent::branch(branch),
                ParameterResolver::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();
        ids.push(run.id);
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert_eq!(orchestrator.list_runs(10).await.unwrap().len(), 3);
}
