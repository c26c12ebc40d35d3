//! Main orchestrator for pipeline execution.
//!
//! Coordinates stage scheduling over the dependency graph, failure
//! propagation, artifact hand-off, retry handling and event logging.
//!
//! Stages whose upstream dependencies are all terminal are dispatched as
//! independent tasks. After every completion the scheduler re-evaluates the
//! pending stages in topological order, so a skip decision propagates down a
//! whole chain in a single pass.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{ProducedArtifact, ShellExecutor, StageExecutor, StepContext, StepError};
use crate::config::ResolvedConfig;
use crate::domain::{
    ArtifactRecord, Event, EventType, FailureKind, Run, RunState, StageFailure, StageState,
    TriggerEvent,
};

use super::artifact_store::ArtifactStore;
use super::cancel::CancellationToken;
use super::event_store::{safe_relative_path, EventStore};
use super::graph::{DependencyEdge, DependencyGraph, FailurePolicy};
use super::params::{BoundParameters, ParameterResolver};
use super::pipeline::{CompiledPipeline, Stage, StepSpec};
use super::trigger::TriggerEvaluator;

/// Main pipeline orchestrator
pub struct Orchestrator {
    /// Executor handed every step
    executor: Arc<dyn StageExecutor>,

    /// Shared, run-scoped artifact store
    artifacts: Arc<ArtifactStore>,

    /// Directory holding one subdirectory per run
    runs_dir: PathBuf,

    /// Upper bound on concurrently running stages (0 = unlimited)
    max_parallel: usize,

    /// Timeout for stages when neither stage nor pipeline sets one
    default_timeout: Duration,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(executor: Arc<dyn StageExecutor>, runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            artifacts: Arc::new(ArtifactStore::new()),
            runs_dir: runs_dir.into(),
            max_parallel: 0,
            default_timeout: Duration::from_secs(crate::config::DEFAULT_STAGE_TIMEOUT_SECONDS),
        }
    }

    /// Create an orchestrator running steps through the configured shell
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(
            Arc::new(ShellExecutor::with_shell(config.shell.clone())),
            config.runs_dir(),
        )
        .with_max_parallel(config.max_parallel)
        .with_default_timeout(Duration::from_secs(config.stage_timeout_seconds))
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn artifact_store(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Evaluate a trigger and, if admitted, execute one run to completion.
    /// Returns `None` when the branch filter rejects the event.
    pub async fn trigger(
        &self,
        pipeline: &CompiledPipeline,
        event: TriggerEvent,
        resolver: ParameterResolver,
        cancel: CancellationToken,
    ) -> Result<Option<Run>> {
        let evaluator = TriggerEvaluator::new(pipeline.filter().clone());
        let Some(run) = evaluator.admit(event, pipeline) else {
            return Ok(None);
        };

        self.execute(pipeline, run, resolver, cancel).await.map(Some)
    }

    /// Drive an admitted run until every stage is terminal
    #[instrument(skip_all, fields(pipeline = %pipeline.name(), run_id = %run.id))]
    pub async fn execute(
        &self,
        pipeline: &CompiledPipeline,
        mut run: Run,
        resolver: ParameterResolver,
        cancel: CancellationToken,
    ) -> Result<Run> {
        let store = Arc::new(EventStore::open_in(&self.runs_dir, run.id).await?);
        let resolver = Arc::new(resolver);
        let graph = pipeline.graph();

        let start_event = Event::new(
            run.id,
            None,
            EventType::RunStarted,
            format!(
                "Pipeline '{}' started ({})",
                pipeline.name(),
                run.trigger.describe()
            ),
        )
        .with_pipeline(pipeline.name(), graph.stages().to_vec(), run.trigger.clone());
        store.append(&start_event).await?;
        info!(stages = graph.len(), "Starting pipeline execution");

        let mut tasks: JoinSet<(String, Result<StageOutcome, JoinError>)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                warn!("Run cancelled");
            }

            if cancelled {
                self.skip_pending(&store, &mut run, graph, "Run cancelled before stage started")
                    .await?;
            } else {
                let dispatch = Dispatcher {
                    pipeline,
                    store: &store,
                    resolver: &resolver,
                    cancel: &cancel,
                };
                self.dispatch_ready(&dispatch, &mut run, &mut tasks).await?;
            }

            if tasks.is_empty() {
                break;
            }

            let joined = if cancelled {
                tasks.join_next().await
            } else {
                tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = cancel.cancelled() => continue,
                }
            };
            let Some(joined) = joined else {
                break;
            };
            let (stage_id, result) = joined.context("Stage supervisor task failed")?;

            let outcome = result.unwrap_or_else(|e| {
                StageOutcome::failed(StageFailure::new(
                    FailureKind::StepExecution,
                    format!("Stage task aborted: {}", e),
                ))
            });
            self.finish_stage(&store, &mut run, &stage_id, outcome).await?;
        }

        self.complete_run(&store, &mut run, cancelled).await?;
        Ok(run)
    }

    /// Start every pending stage whose upstream is terminal, and settle the
    /// ones that will never run
    async fn dispatch_ready(
        &self,
        dispatch: &Dispatcher<'_>,
        run: &mut Run,
        tasks: &mut JoinSet<(String, Result<StageOutcome, JoinError>)>,
    ) -> Result<()> {
        let graph = dispatch.pipeline.graph();

        for stage_id in graph.order() {
            if run.stage_state(stage_id) != Some(StageState::Pending) {
                continue;
            }

            match readiness(run, graph, stage_id) {
                Readiness::Wait => {}
                Readiness::Skip(reason) => {
                    self.skip_stage(dispatch.store, run, stage_id, reason).await?;
                }
                Readiness::Cascade(reason) => {
                    let failure = StageFailure::new(FailureKind::UpstreamFailed, reason);
                    self.fail_stage(dispatch.store, run, stage_id, 0, 0, failure)
                        .await?;
                }
                Readiness::Start => {
                    if self.max_parallel > 0 && tasks.len() >= self.max_parallel {
                        continue;
                    }
                    let Some(stage) = dispatch.pipeline.stage(stage_id) else {
                        continue;
                    };

                    run.transition(stage_id, StageState::Running);
                    dispatch
                        .store
                        .append(&Event::stage(
                            run.id,
                            stage_id,
                            EventType::StageStarted,
                            format!("Stage '{}' started", stage_id),
                        ))
                        .await?;
                    info!(stage = %stage_id, "Stage started");

                    let task = StageTask {
                        run_id: run.id,
                        stage: stage.clone(),
                        upstream: graph.upstream(stage_id).cloned().collect(),
                        timeout: stage.timeout(&dispatch.pipeline.definition().defaults, self.default_timeout),
                        executor: self.executor.clone(),
                        artifacts: self.artifacts.clone(),
                        store: dispatch.store.clone(),
                        resolver: dispatch.resolver.clone(),
                        cancel: dispatch.cancel.clone(),
                    };

                    // A panicking executor must still leave the stage id behind.
                    let handle = tokio::spawn(task.run());
                    let id = stage_id.clone();
                    tasks.spawn(async move { (id, handle.await) });
                }
            }
        }

        Ok(())
    }

    /// Mark every pending stage skipped
    async fn skip_pending(
        &self,
        store: &EventStore,
        run: &mut Run,
        graph: &DependencyGraph,
        reason: &str,
    ) -> Result<()> {
        for stage_id in graph.order() {
            if run.stage_state(stage_id) == Some(StageState::Pending) {
                self.skip_stage(store, run, stage_id, reason.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    async fn skip_stage(
        &self,
        store: &EventStore,
        run: &mut Run,
        stage_id: &str,
        reason: String,
    ) -> Result<()> {
        store
            .append(
                &Event::stage(
                    run.id,
                    stage_id,
                    EventType::StageBlocked,
                    format!("Stage '{}' blocked: {}", stage_id, reason),
                )
                .with_error(reason.clone()),
            )
            .await?;
        store
            .append(
                &Event::stage(
                    run.id,
                    stage_id,
                    EventType::StageSkipped,
                    format!("Stage '{}' skipped", stage_id),
                )
                .with_error(reason.clone()),
            )
            .await?;

        info!(stage = %stage_id, %reason, "Stage skipped");
        run.skip_stage(stage_id, reason);
        self.artifacts
            .seal(run.id, stage_id, StageState::Skipped)
            .await;
        Ok(())
    }

    async fn fail_stage(
        &self,
        store: &EventStore,
        run: &mut Run,
        stage_id: &str,
        attempts: u32,
        duration_ms: u64,
        failure: StageFailure,
    ) -> Result<()> {
        if failure.kind == FailureKind::RequirementNotMet {
            store
                .append(
                    &Event::stage(
                        run.id,
                        stage_id,
                        EventType::StageBlocked,
                        format!("Stage '{}' blocked: {}", stage_id, failure.message),
                    )
                    .with_error(failure.message.clone()),
                )
                .await?;
        }

        store
            .append(
                &Event::stage(
                    run.id,
                    stage_id,
                    EventType::StageFailed,
                    format!("Stage '{}' failed: {}", stage_id, failure),
                )
                .with_attempt(attempts)
                .with_duration(duration_ms)
                .with_failure(failure.kind, failure.message.clone()),
            )
            .await?;

        error!(stage = %stage_id, kind = %failure.kind, error = %failure.message, "Stage failed");
        run.fail_stage(stage_id, failure);
        self.artifacts.seal(run.id, stage_id, StageState::Failed).await;
        Ok(())
    }

    /// Record the outcome of a finished stage task
    async fn finish_stage(
        &self,
        store: &EventStore,
        run: &mut Run,
        stage_id: &str,
        outcome: StageOutcome,
    ) -> Result<()> {
        let duration_ms = outcome.elapsed.as_millis() as u64;
        if let Some(record) = run.stages.get_mut(stage_id) {
            record.attempts = outcome.attempts;
            record.parameters = outcome.parameters;
        }

        match outcome.result {
            Ok(records) => {
                store
                    .append(
                        &Event::stage(
                            run.id,
                            stage_id,
                            EventType::StageSucceeded,
                            format!("Stage '{}' succeeded in {}ms", stage_id, duration_ms),
                        )
                        .with_attempt(outcome.attempts)
                        .with_duration(duration_ms),
                    )
                    .await?;

                info!(stage = %stage_id, attempts = outcome.attempts, duration_ms, "Stage succeeded");
                run.transition(stage_id, StageState::Succeeded);
                run.artifacts.extend(records);
                self.artifacts
                    .seal(run.id, stage_id, StageState::Succeeded)
                    .await;
                Ok(())
            }
            Err(failure) => {
                self.fail_stage(store, run, stage_id, outcome.attempts, duration_ms, failure)
                    .await
            }
        }
    }

    /// Compute the final state and log it
    async fn complete_run(&self, store: &EventStore, run: &mut Run, cancelled: bool) -> Result<()> {
        run.conclude(cancelled);

        let event = match run.state {
            RunState::Succeeded => {
                info!("Run completed successfully");
                Event::new(
                    run.id,
                    None,
                    EventType::RunSucceeded,
                    format!("Pipeline '{}' succeeded", run.pipeline_name),
                )
            }
            RunState::Failed { ref error } => {
                error!(%error, "Run failed");
                Event::new(
                    run.id,
                    None,
                    EventType::RunFailed,
                    format!("Pipeline '{}' failed", run.pipeline_name),
                )
                .with_error(error.clone())
            }
            RunState::Cancelled | RunState::Running => {
                warn!("Run ended cancelled");
                Event::new(
                    run.id,
                    None,
                    EventType::RunCancelled,
                    format!("Pipeline '{}' cancelled", run.pipeline_name),
                )
            }
        };

        // Nothing can consume this run's artifacts any more; the copies on
        // disk stay behind for inspection.
        self.artifacts.evict(run.id).await;
        store.append(&event).await
    }

    /// Get status of a run by ID
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<Run> {
        if !self.runs_dir.join(run_id.to_string()).is_dir() {
            anyhow::bail!("Run {} not found", run_id);
        }

        let store = EventStore::open_in(&self.runs_dir, run_id).await?;
        let events = store.replay().await?;

        if events.is_empty() {
            anyhow::bail!("Run {} has no events", run_id);
        }

        Run::from_events(&events).context("Failed to reconstruct run state")
    }

    /// Read back the persisted bytes of an artifact registered by a run
    pub async fn load_artifact(&self, record: &ArtifactRecord) -> Result<Option<Vec<u8>>> {
        let store = EventStore::open_in(&self.runs_dir, record.run_id).await?;
        store
            .load_artifact(&record.producer_stage_id, &record.name)
            .await
    }

    /// List recent runs, most recent first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let run_ids = EventStore::list_runs(&self.runs_dir).await?;
        let mut runs = Vec::new();

        for run_id in run_ids {
            match self.get_run_status(run_id).await {
                Ok(run) => runs.push(run),
                Err(e) => debug!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }
}

/// Per-run handles shared by every dispatch pass
struct Dispatcher<'a> {
    pipeline: &'a CompiledPipeline,
    store: &'a Arc<EventStore>,
    resolver: &'a Arc<ParameterResolver>,
    cancel: &'a CancellationToken,
}

/// What the scheduler should do with a pending stage
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    /// Some upstream stage is not terminal yet
    Wait,
    Start,
    Skip(String),
    Cascade(String),
}

/// Decide a pending stage from the terminal states of its upstream stages.
/// When several edges disagree, cascade beats skip and skip beats ignore.
fn readiness(run: &Run, graph: &DependencyGraph, stage_id: &str) -> Readiness {
    let mut skip = None;
    let mut cascade = None;

    for edge in graph.upstream(stage_id) {
        let state = run.stage_state(&edge.from).unwrap_or_default();
        if !state.is_terminal() {
            return Readiness::Wait;
        }

        match (state, edge.policy) {
            (StageState::Succeeded, _) | (_, FailurePolicy::Ignore) => {}
            (StageState::Failed, FailurePolicy::CascadeFail) => {
                cascade.get_or_insert_with(|| format!("Upstream stage '{}' failed", edge.from));
            }
            (StageState::Failed, _) => {
                skip.get_or_insert_with(|| format!("Upstream stage '{}' failed", edge.from));
            }
            _ => {
                skip.get_or_insert_with(|| format!("Upstream stage '{}' was skipped", edge.from));
            }
        }
    }

    match (cascade, skip) {
        (Some(reason), _) => Readiness::Cascade(reason),
        (None, Some(reason)) => Readiness::Skip(reason),
        (None, None) => Readiness::Start,
    }
}

/// Result of one stage task
#[derive(Debug)]
struct StageOutcome {
    attempts: u32,
    parameters: BoundParameters,
    elapsed: Duration,
    result: Result<Vec<ArtifactRecord>, StageFailure>,
}

impl StageOutcome {
    fn failed(failure: StageFailure) -> Self {
        Self {
            attempts: 0,
            parameters: BoundParameters::new(),
            elapsed: Duration::ZERO,
            result: Err(failure),
        }
    }
}

/// Everything a stage needs to run on its own task
struct StageTask {
    run_id: Uuid,
    stage: Stage,
    upstream: Vec<DependencyEdge>,
    timeout: Duration,
    executor: Arc<dyn StageExecutor>,
    artifacts: Arc<ArtifactStore>,
    store: Arc<EventStore>,
    resolver: Arc<ParameterResolver>,
    cancel: CancellationToken,
}

fn internal(e: anyhow::Error) -> StageFailure {
    StageFailure::new(FailureKind::StepExecution, format!("{:#}", e))
}

fn cancelled() -> StageFailure {
    StageFailure::new(FailureKind::Cancelled, "Run cancelled while stage was running")
}

impl StageTask {
    #[instrument(skip(self), fields(run_id = %self.run_id, stage = %self.stage.id))]
    async fn run(self) -> StageOutcome {
        let started = Instant::now();
        let mut outcome = StageOutcome::failed(cancelled());
        let result = self.execute(&mut outcome).await;
        outcome.result = result;
        outcome.elapsed = started.elapsed();
        outcome
    }

    async fn execute(&self, outcome: &mut StageOutcome) -> Result<Vec<ArtifactRecord>, StageFailure> {
        let stage = &self.stage;

        // Parameters and requirements are settled before any step runs.
        let parameters = self
            .resolver
            .bind(&stage.parameters)
            .map_err(|e| StageFailure::new(FailureKind::ParameterValidation, e.to_string()))?;
        outcome.parameters = parameters.clone();

        let steps = stage
            .plan_steps(&parameters)
            .map_err(|e| StageFailure::new(FailureKind::ParameterValidation, e.to_string()))?;

        for requirement in &stage.requirements {
            if !self.executor.check_requirement(requirement).await {
                return Err(StageFailure::new(
                    FailureKind::RequirementNotMet,
                    format!("Requirement not met: {}", requirement),
                ));
            }
        }

        let workspace = self.store.workspace_dir(&stage.id).await.map_err(internal)?;
        let consumed = self.pull_artifacts(&workspace).await?;

        let ctx = StepContext {
            run_id: self.run_id,
            stage_id: stage.id.clone(),
            workspace,
            parameters,
            artifacts: consumed,
            produces: stage.produce_rules(),
        };

        let mut attempt = 0u32;
        let produced = loop {
            attempt += 1;
            outcome.attempts = attempt;
            debug!(attempt, steps = steps.len(), "Running stage attempt");

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(cancelled()),
                result = tokio::time::timeout(self.timeout, self.run_steps(&steps, &ctx)) => result,
            };

            let error = match result {
                Ok(Ok(produced)) => break produced,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("Stage timed out after {}s", self.timeout.as_secs()),
            };

            if !stage.retry.should_retry(attempt) {
                return Err(StageFailure::new(FailureKind::StepExecution, error));
            }

            let delay = stage.retry.delay_for_attempt(attempt);
            self.store
                .append(
                    &Event::stage(
                        self.run_id,
                        &stage.id,
                        EventType::StageRetrying,
                        format!("Stage '{}' failed, retrying in {:?}: {}", stage.id, delay, error),
                    )
                    .with_attempt(attempt)
                    .with_error(error.clone()),
                )
                .await
                .map_err(internal)?;

            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Stage attempt failed, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.register_outputs(produced, &ctx).await
    }

    /// Run the steps of one attempt in order; the first failure ends it.
    /// Workspace outputs are collected once, after the last step.
    async fn run_steps(
        &self,
        steps: &[StepSpec],
        ctx: &StepContext,
    ) -> Result<Vec<ProducedArtifact>, StepError> {
        let mut produced = Vec::new();
        for step in steps {
            debug!(step = %step.name, executor = self.executor.name(), "Running step");
            let output = self.executor.execute(step, ctx).await?;
            produced.extend(output.produced);
        }
        produced.extend(self.executor.collect_outputs(ctx).await);
        Ok(produced)
    }

    /// Fetch every consumed artifact of this run into the stage workspace
    async fn pull_artifacts(&self, workspace: &Path) -> Result<Vec<ArtifactRecord>, StageFailure> {
        let mut consumed = Vec::new();

        for edge in &self.upstream {
            for rule in &edge.artifacts {
                let found = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(cancelled()),
                    found = self.artifacts.wait_for(self.run_id, &edge.from, rule) => found,
                };
                let found = found
                    .map_err(|e| StageFailure::new(FailureKind::ArtifactNotFound, e.to_string()))?;

                for artifact in found {
                    let relative = safe_relative_path(&artifact.record.name).map_err(internal)?;
                    let path = workspace.join(relative);
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .with_context(|| format!("Failed to create directory: {}", parent.display()))
                            .map_err(internal)?;
                    }
                    tokio::fs::write(&path, &artifact.content)
                        .await
                        .with_context(|| format!("Failed to place artifact: {}", path.display()))
                        .map_err(internal)?;

                    debug!(from = %edge.from, name = %artifact.record.name, "Consumed artifact");
                    consumed.push(artifact.record);
                }
            }
        }

        Ok(consumed)
    }

    /// Register the outputs covered by the stage's produce rules, under the
    /// name the first matching rule gives them. A name reported twice keeps
    /// its last content and is registered once.
    async fn register_outputs(
        &self,
        produced: Vec<ProducedArtifact>,
        ctx: &StepContext,
    ) -> Result<Vec<ArtifactRecord>, StageFailure> {
        let stage_id = &self.stage.id;

        let mut outputs = BTreeMap::new();
        for output in produced {
            match ctx.produces.iter().find_map(|r| r.registered_name(&output.name)) {
                Some(name) => {
                    outputs.insert(name, output.content);
                }
                None => debug!(name = %output.name, "Ignoring output not covered by produce rules"),
            }
        }

        let mut records = Vec::with_capacity(outputs.len());
        for (name, content) in outputs {
            self.store
                .store_artifact(stage_id, &name, &content)
                .await
                .map_err(internal)?;
            let record = self.artifacts.put(self.run_id, stage_id, &name, content).await;

            self.store
                .append(
                    &Event::stage(
                        self.run_id,
                        stage_id,
                        EventType::ArtifactRegistered,
                        format!("Artifact '{}' registered", record.name),
                    )
                    .with_artifact(record.clone()),
                )
                .await
                .map_err(internal)?;

            records.push(record);
        }

        Ok(records)
    }
}
