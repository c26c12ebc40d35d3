//! Shared helpers for integration tests.
//!
//! `ScriptedExecutor` interprets each step's `run` line as a tiny script
//! instead of spawning processes, and records every invocation so tests can
//! assert on what the scheduler actually dispatched.
//!
//! Commands (separated by `;`):
//! - `ok`                     succeed
//! - `fail`                   fail
//! - `sleep <ms>`             wait, then continue
//! - `emit <name> <content>`  report an artifact
//! - `emit-param <name> <KEY>` report an artifact holding a parameter value
//! - `expect <name>`          fail unless `<name>` exists in the workspace
//! - `flaky <n>`              fail the first `n` invocations of this step

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use shipyard::adapters::{StageExecutor, StepContext, StepError, StepOutput};
use shipyard::core::{CompiledPipeline, Orchestrator, Pipeline, Requirement, StepSpec};

/// One call into the executor
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage_id: String,
    pub step: String,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct ScriptedExecutor {
    invocations: Mutex<Vec<Invocation>>,
    attempts: Mutex<HashMap<(String, String), u32>>,
    missing: HashSet<String>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Executor for which the given tools and env vars are unavailable
    pub fn without(missing: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            missing: missing.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        })
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Number of steps executed for a stage
    pub fn count(&self, stage_id: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.stage_id == stage_id)
            .count()
    }

    /// Step names executed for a stage, in order
    pub fn steps(&self, stage_id: &str) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.stage_id == stage_id)
            .map(|i| i.step.clone())
            .collect()
    }

    /// Highest number of steps observed executing at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn bump_attempt(&self, ctx: &StepContext, step: &StepSpec) -> u32 {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts
            .entry((ctx.stage_id.clone(), step.name.clone()))
            .or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn check_requirement(&self, requirement: &Requirement) -> bool {
        let name = match requirement {
            Requirement::Tool(name) | Requirement::Env(name) => name,
        };
        !self.missing.contains(name)
    }

    async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> Result<StepOutput, StepError> {
        self.invocations.lock().unwrap().push(Invocation {
            stage_id: ctx.stage_id.clone(),
            step: step.name.clone(),
            parameters: ctx.parameters.clone(),
        });
        let attempt = self.bump_attempt(ctx, step);

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.interpret(step, ctx, attempt).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ScriptedExecutor {
    async fn interpret(
        &self,
        step: &StepSpec,
        ctx: &StepContext,
        attempt: u32,
    ) -> Result<StepOutput, StepError> {
        let failed = |message: String| StepError::Failed {
            step: step.name.clone(),
            message,
        };

        let mut output = StepOutput::new(format!("{} ran", step.name));
        for command in step.run.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            let words: Vec<&str> = command.split_whitespace().collect();
            match words.as_slice() {
                ["ok"] => {}
                ["fail"] => return Err(failed("scripted failure".to_string())),
                ["sleep", ms] => {
                    tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
                }
                ["emit", name, content] => {
                    output = output.with_artifact(*name, content.as_bytes().to_vec());
                }
                ["emit-param", name, key] => {
                    let value = ctx.parameters.get(*key).cloned().unwrap_or_default();
                    output = output.with_artifact(*name, value.into_bytes());
                }
                ["expect", name] => {
                    if !ctx.workspace.join(name).is_file() {
                        return Err(failed(format!("missing input {}", name)));
                    }
                }
                ["flaky", n] => {
                    if attempt <= n.parse::<u32>().unwrap() {
                        return Err(failed(format!("flaky attempt {}", attempt)));
                    }
                }
                other => panic!("unknown scripted command: {:?}", other),
            }
        }
        Ok(output)
    }
}

pub fn compile(yaml: &str) -> CompiledPipeline {
    Pipeline::from_yaml(yaml).unwrap().compile().unwrap()
}

pub fn orchestrator(executor: Arc<ScriptedExecutor>, temp: &TempDir) -> Orchestrator {
    Orchestrator::new(executor, temp.path().join("runs"))
}

/// The Build -> Deploy pipeline used by most scenarios
pub const BUILD_DEPLOY: &str = r#"
name: app
trigger:
  branches: ["+:*", "-:experimental/*"]
stages:
  - id: Build
    requirements: [{ tool: mvn }]
    steps:
      - { name: compile, run: "ok" }
      - { name: test, run: "ok" }
      - { name: package, run: "emit app.jar jar-bytes" }
    produces: ["*.jar"]

  - id: Deploy
    depends_on:
      - { stage: Build, policy: fail_to_start, artifacts: "*.jar" }
    parameters:
      - { key: DEPLOY_ENV, allowed: [dev, staging, prod], default: dev }
    steps:
      - { name: containerize, run: "expect app.jar" }
    dispatch:
      on: DEPLOY_ENV
      cases:
        dev: [{ name: deploy-dev, run: "ok" }]
        staging: [{ name: deploy-staging, run: "ok" }]
        prod: [{ name: deploy-prod, run: "ok" }]
"#;
