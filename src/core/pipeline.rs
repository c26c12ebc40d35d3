//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML as a set of stages. Each stage lists its
//! steps, the artifacts it produces, its upstream dependencies (with a
//! failure policy and the artifacts it pulls from each), the parameters it
//! binds, and the requirements it needs from the host.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event_store::safe_relative_path;
use super::graph::{DependencyEdge, DependencyGraph, FailurePolicy};
use super::params::{BoundParameters, Dispatch, ParameterDecl, ParameterValidationError};
use super::trigger::BranchFilter;

/// Structural problems in a pipeline definition. Detected at load time,
/// before any run exists; never retried.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to read pipeline file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pipeline YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Pipeline name cannot be empty")]
    EmptyName,

    #[error("Pipeline must declare at least one stage")]
    NoStages,

    #[error("Stage {index} has an empty id")]
    EmptyStageId { index: usize },

    #[error("Duplicate stage id '{0}'")]
    DuplicateStage(String),

    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownStage { stage: String, dependency: String },

    #[error("Stage '{stage}' has an edge to unknown stage '{downstream}'")]
    UnknownDownstream { stage: String, downstream: String },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("Stage '{stage}' consumes '{rule}' from '{producer}', which declares no matching artifacts")]
    UnknownArtifactRule {
        stage: String,
        producer: String,
        rule: String,
    },

    #[error("Invalid pattern '{pattern}' in stage '{stage}': {message}")]
    InvalidPattern {
        stage: String,
        pattern: String,
        message: String,
    },

    #[error("Stage '{stage}': {message}")]
    InvalidStage { stage: String, message: String },

    #[error("Invalid branch filter rule '{rule}': {message}")]
    InvalidTrigger { rule: String, message: String },
}

impl DefinitionError {
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::CycleDetected { .. })
    }
}

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Branch filter deciding which change notifications start a run
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Defaults applied to stages that do not override them
    #[serde(default)]
    pub defaults: StageDefaults,

    /// Stages, in declaration order
    pub stages: Vec<Stage>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self, DefinitionError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Get a stage by id
    pub fn get_stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Validate the definition and build its dependency graph
    pub fn compile(self) -> Result<CompiledPipeline, DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.stages.is_empty() {
            return Err(DefinitionError::NoStages);
        }

        let mut edges = Vec::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.id.trim().is_empty() {
                return Err(DefinitionError::EmptyStageId { index: i });
            }
            stage.validate()?;

            for dep in &stage.depends_on {
                edges.push(DependencyEdge {
                    from: dep.stage.clone(),
                    to: stage.id.clone(),
                    policy: dep.policy,
                    artifacts: dep.artifacts.clone(),
                });
            }
        }

        let ids = self.stages.iter().map(|s| s.id.clone()).collect();
        let graph = DependencyGraph::new(ids, edges)?;

        // Consumed rules must name something the producer declares.
        for edge in graph.edges() {
            let Some(producer) = self.get_stage(&edge.from) else {
                continue;
            };
            for rule in &edge.artifacts {
                if !producer.declares(rule) {
                    return Err(DefinitionError::UnknownArtifactRule {
                        stage: edge.to.clone(),
                        producer: edge.from.clone(),
                        rule: rule.clone(),
                    });
                }
            }
        }

        let filter = BranchFilter::parse(&self.trigger.branches)?;

        Ok(CompiledPipeline {
            pipeline: self,
            graph,
            filter,
        })
    }
}

/// A validated pipeline together with its dependency graph and trigger
/// filter. Only compiled pipelines can be run.
#[derive(Debug, Clone)]
pub struct CompiledPipeline {
    pipeline: Pipeline,
    graph: DependencyGraph,
    filter: BranchFilter,
}

impl CompiledPipeline {
    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    pub fn definition(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn filter(&self) -> &BranchFilter {
        &self.filter
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.pipeline.get_stage(id)
    }

    /// Every parameter key declared by any stage
    pub fn declared_parameters(&self) -> HashSet<&str> {
        self.pipeline
            .stages
            .iter()
            .flat_map(|s| s.parameters.iter().map(|p| p.key.as_str()))
            .collect()
    }
}

/// Trigger section of a pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Ordered `+:pattern` / `-:pattern` rules; empty admits everything
    #[serde(default)]
    pub branches: Vec<String>,
}

/// Pipeline-wide stage defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageDefaults {
    /// Wall-clock budget for stages without their own
    pub stage_timeout_seconds: Option<u64>,
}

/// Where the matches of a produce rule are registered
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProduceTarget {
    /// The single match is registered under this exact name
    Rename(String),
    /// Matches are registered beneath this directory
    Directory(String),
}

/// A parsed produce rule: `source` or `source => target`.
///
/// The source is a glob over workspace paths. A target ending in `/`, or
/// any target of a wildcard source, is a directory: each match keeps its
/// path below the source's literal leading directories. Otherwise the
/// target renames the one file the source names, e.g.
/// `target/site/jacoco/** => coverage-report/` registers
/// `target/site/jacoco/index.html` as `coverage-report/index.html`.
#[derive(Debug, Clone)]
pub struct ProduceRule {
    source: Pattern,
    target: Option<ProduceTarget>,
    prefix: String,
}

impl ProduceRule {
    pub fn parse(rule: &str) -> Result<Self, String> {
        let (source, target) = match rule.split_once("=>") {
            Some((source, target)) => (source.trim(), Some(target.trim())),
            None => (rule.trim(), None),
        };
        if source.is_empty() {
            return Err("empty source pattern".to_string());
        }
        let pattern = Pattern::new(source).map_err(|e| e.to_string())?;

        let target = match target {
            None => None,
            Some(target) => {
                let name = target.trim_end_matches('/');
                safe_relative_path(name)
                    .map_err(|e| format!("invalid target '{}': {}", target, e))?;
                if target.ends_with('/') || has_wildcard(source) {
                    Some(ProduceTarget::Directory(name.to_string()))
                } else {
                    Some(ProduceTarget::Rename(name.to_string()))
                }
            }
        };

        let mut dirs: Vec<&str> = source.split('/').collect();
        dirs.pop();
        let prefix = dirs
            .into_iter()
            .take_while(|d| !has_wildcard(d))
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            source: pattern,
            target,
            prefix,
        })
    }

    /// Check whether a workspace path is picked up by this rule
    pub fn matches(&self, path: &str) -> bool {
        self.source.matches(path)
    }

    /// Name a matching workspace path is registered under
    pub fn registered_name(&self, path: &str) -> Option<String> {
        if !self.matches(path) {
            return None;
        }
        let name = match self.target {
            None => path.to_string(),
            Some(ProduceTarget::Rename(ref name)) => name.clone(),
            Some(ProduceTarget::Directory(ref dir)) => {
                let rest = match self.prefix.as_str() {
                    "" => path,
                    prefix => path
                        .strip_prefix(prefix)
                        .and_then(|r| r.strip_prefix('/'))
                        .unwrap_or(path),
                };
                format!("{}/{}", dir, rest)
            }
        };
        Some(name)
    }

    /// Check whether this rule can register an artifact under a literal name
    fn may_register(&self, name: &str) -> bool {
        match self.target {
            None => self.source.matches(name),
            Some(ProduceTarget::Rename(ref target)) => target == name,
            Some(ProduceTarget::Directory(ref dir)) => name
                .strip_prefix(dir.as_str())
                .is_some_and(|rest| rest.starts_with('/')),
        }
    }
}

fn has_wildcard(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

/// A named, independently schedulable unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Unique, stable identifier
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Steps run in order for every parameter value
    #[serde(default)]
    pub steps: Vec<StepSpec>,

    /// Rules naming the artifacts this stage contributes on success; see
    /// [`ProduceRule`]
    #[serde(default)]
    pub produces: Vec<String>,

    #[serde(default)]
    pub depends_on: Vec<Dependency>,

    /// Preconditions checked before any step runs
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub requirements: Vec<Requirement>,

    #[serde(default)]
    pub parameters: Vec<ParameterDecl>,

    /// Parameter-selected branch, run after `steps`
    #[serde(default)]
    pub dispatch: Option<Dispatch>,

    /// Wall-clock budget for one attempt of the whole stage
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Stage {
    /// Get the effective timeout for this stage
    pub fn timeout(&self, defaults: &StageDefaults, fallback: Duration) -> Duration {
        self.timeout_seconds
            .or(defaults.stage_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(fallback)
    }

    /// Steps to run for the bound parameters: common steps, then the
    /// dispatched branch
    pub fn plan_steps(&self, params: &BoundParameters) -> Result<Vec<StepSpec>, ParameterValidationError> {
        let mut steps = self.steps.clone();
        if let Some(ref dispatch) = self.dispatch {
            steps.extend_from_slice(dispatch.select(params)?);
        }
        Ok(steps)
    }

    /// Parsed produce rules, in declaration order. Rules that fail to parse
    /// are rejected by validation and skipped here.
    pub fn produce_rules(&self) -> Vec<ProduceRule> {
        self.produces
            .iter()
            .filter_map(|rule| ProduceRule::parse(rule).ok())
            .collect()
    }

    /// Check whether a consumer rule can refer to this stage's outputs.
    /// Wildcard rules are accepted as long as something is produced; a
    /// literal name must be one a produce rule can register.
    fn declares(&self, rule: &str) -> bool {
        let rules = self.produce_rules();
        if rules.is_empty() {
            return false;
        }
        has_wildcard(rule) || rules.iter().any(|p| p.may_register(rule))
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        let invalid = |message: String| DefinitionError::InvalidStage {
            stage: self.id.clone(),
            message,
        };

        if self.steps.is_empty() && self.dispatch.is_none() {
            return Err(invalid("stage has no steps".to_string()));
        }

        let mut step_names = HashSet::new();
        let dispatched = self
            .dispatch
            .iter()
            .flat_map(|d| d.cases.values().flatten());
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(invalid("step with an empty name".to_string()));
            }
            if !step_names.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step '{}'", step.name)));
            }
        }
        for step in dispatched {
            if step.name.trim().is_empty() {
                return Err(invalid("step with an empty name".to_string()));
            }
        }

        let invalid_pattern = |pattern: &String, message: String| DefinitionError::InvalidPattern {
            stage: self.id.clone(),
            pattern: pattern.clone(),
            message,
        };
        for rule in &self.produces {
            ProduceRule::parse(rule).map_err(|message| invalid_pattern(rule, message))?;
        }
        for pattern in self.depends_on.iter().flat_map(|d| d.artifacts.iter()) {
            Pattern::new(pattern).map_err(|e| invalid_pattern(pattern, e.to_string()))?;
        }

        let mut keys = HashSet::new();
        for param in &self.parameters {
            if !keys.insert(param.key.as_str()) {
                return Err(invalid(format!("parameter '{}' declared twice", param.key)));
            }
            if let Some(ref default) = param.default {
                if !param.permits(default) {
                    return Err(invalid(format!(
                        "default '{}' of parameter '{}' is not one of its allowed values",
                        default, param.key
                    )));
                }
            }
        }

        if let Some(ref dispatch) = self.dispatch {
            let Some(param) = self.parameters.iter().find(|p| p.key == dispatch.on) else {
                return Err(invalid(format!(
                    "dispatch on undeclared parameter '{}'",
                    dispatch.on
                )));
            };
            if param.is_constrained() {
                for value in dispatch.cases.keys() {
                    if !param.permits(value) {
                        return Err(invalid(format!(
                            "dispatch case '{}' is not an allowed value of '{}'",
                            value, param.key
                        )));
                    }
                }
                for value in &param.allowed {
                    if !dispatch.cases.contains_key(value) {
                        return Err(invalid(format!(
                            "allowed value '{}' of '{}' has no dispatch case",
                            value, param.key
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// A single executable action inside a stage, opaque to the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,

    /// Command line handed to the stage executor
    pub run: String,

    /// Extra environment for this step
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A precondition checked before a stage executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// An executable available on PATH
    Tool(String),

    /// An environment variable that must be set
    Env(String),
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool(name) => write!(f, "tool '{}'", name),
            Self::Env(name) => write!(f, "environment variable '{}'", name),
        }
    }
}

/// An upstream dependency of a stage
///
/// Supports two YAML forms:
/// - Bare id: `depends_on: [Build]`
/// - Detailed: `depends_on: [{ stage: Build, policy: ignore, artifacts: "*.jar" }]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DependencySpec")]
pub struct Dependency {
    pub stage: String,
    pub policy: FailurePolicy,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DependencySpec {
    Name(String),
    Detailed {
        stage: String,
        #[serde(default)]
        policy: FailurePolicy,
        #[serde(default)]
        artifacts: Option<OneOrMany>,
    },
}

/// Accepts either `artifacts: "*.jar"` or `artifacts: ["*.jar", "*.war"]`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

impl From<DependencySpec> for Dependency {
    fn from(spec: DependencySpec) -> Self {
        match spec {
            DependencySpec::Name(stage) => Self {
                stage,
                policy: FailurePolicy::default(),
                artifacts: Vec::new(),
            },
            DependencySpec::Detailed {
                stage,
                policy,
                artifacts,
            } => Self {
                stage,
                policy,
                artifacts: artifacts.map(Vec::from).unwrap_or_default(),
            },
        }
    }
}

/// Retry policy for failed stage attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
