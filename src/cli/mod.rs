//! Command-line interface for shipyard.
//!
//! Provides commands for running pipelines, validating and planning
//! definitions, checking run status and listing runs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use uuid::Uuid;

use crate::config;
use crate::core::params::parse_assignment;
use crate::core::{
    CancellationToken, CompiledPipeline, DefinitionError, Orchestrator, ParameterResolver,
    Pipeline,
};
use crate::domain::{content_digest, FailureKind, Run, RunState, TriggerEvent};

/// Process exit codes
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const STAGE_FAILED: u8 = 1;
    pub const PARAMETER_VALIDATION: u8 = 3;
    pub const DEFINITION_ERROR: u8 = 4;
    pub const CYCLE: u8 = 5;
    pub const CANCELLED: u8 = 130;
}

/// shipyard - Build pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "shipyard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Path to the pipeline definition (YAML)
        pipeline: PathBuf,

        /// Parameter value for the run (repeatable)
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parse_assignment)]
        params: Vec<(String, String)>,

        /// Branch reference that triggered the run (manual run if omitted)
        #[arg(long, env = "SHIPYARD_TRIGGER_REF")]
        trigger_ref: Option<String>,

        /// Revision identifier recorded with the trigger
        #[arg(long)]
        revision: Option<String>,

        /// Upper bound on concurrently running stages (0 = unlimited)
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Load and validate a pipeline definition
    Validate {
        /// Path to the pipeline definition (YAML)
        pipeline: PathBuf,
    },

    /// Print the execution order of a pipeline
    Plan {
        /// Path to the pipeline definition (YAML)
        pipeline: PathBuf,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        match self.command {
            Commands::Run {
                pipeline,
                params,
                trigger_ref,
                revision,
                max_parallel,
            } => {
                let event = match trigger_ref {
                    Some(reference) => TriggerEvent::branch(reference),
                    None => TriggerEvent::manual(),
                }
                .with_revision(revision);
                run_pipeline(&pipeline, params, event, max_parallel).await
            }
            Commands::Validate { pipeline } => validate_pipeline(&pipeline),
            Commands::Plan { pipeline } => plan_pipeline(&pipeline),
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Exit code for a finished run
pub fn exit_code_for_run(run: &Run) -> u8 {
    match run.state {
        RunState::Succeeded => exit_code::SUCCESS,
        RunState::Cancelled => exit_code::CANCELLED,
        RunState::Failed { .. }
            if run.failure_kinds().contains(&FailureKind::ParameterValidation) =>
        {
            exit_code::PARAMETER_VALIDATION
        }
        RunState::Failed { .. } | RunState::Running => exit_code::STAGE_FAILED,
    }
}

/// Exit code for a definition that failed to load
pub fn exit_code_for_definition(error: &DefinitionError) -> u8 {
    if error.is_cycle() {
        exit_code::CYCLE
    } else {
        exit_code::DEFINITION_ERROR
    }
}

/// Load, validate and compile a pipeline definition
fn load_pipeline(path: &Path) -> Result<CompiledPipeline, DefinitionError> {
    Pipeline::from_file(path)?.compile()
}

/// Print a definition error and map it to its exit code
fn definition_failure(error: DefinitionError) -> ExitCode {
    eprintln!("Invalid pipeline definition: {}", error);
    ExitCode::from(exit_code_for_definition(&error))
}

/// Run a pipeline for one trigger event
async fn run_pipeline(
    path: &Path,
    params: Vec<(String, String)>,
    event: TriggerEvent,
    max_parallel: Option<usize>,
) -> Result<ExitCode> {
    let pipeline = match load_pipeline(path) {
        Ok(pipeline) => pipeline,
        Err(e) => return Ok(definition_failure(e)),
    };

    let resolver = ParameterResolver::new(params);
    let declared = pipeline.declared_parameters();
    for key in resolver.supplied().keys() {
        if !declared.contains(key.as_str()) {
            warn!(%key, "Parameter is not declared by any stage");
        }
    }

    let mut orchestrator = Orchestrator::from_config(config::config()?);
    if let Some(max_parallel) = max_parallel {
        orchestrator = orchestrator.with_max_parallel(max_parallel);
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    let result = orchestrator
        .trigger(&pipeline, event, resolver, cancel)
        .await;
    interrupt.abort();

    let Some(run) = result? else {
        eprintln!("[Trigger rejected by branch filter; no run started]");
        return Ok(ExitCode::SUCCESS);
    };

    println!("{}", run.report());
    match &run.state {
        RunState::Succeeded => eprintln!("[Run {} succeeded]", run.id),
        RunState::Failed { error } => eprintln!("[Run {} failed: {}]", run.id, error),
        RunState::Cancelled => eprintln!("[Run {} cancelled]", run.id),
        RunState::Running => eprintln!("[Run {} in state: {}]", run.id, run.state),
    }

    Ok(ExitCode::from(exit_code_for_run(&run)))
}

/// Validate a pipeline definition without running it
fn validate_pipeline(path: &Path) -> Result<ExitCode> {
    match load_pipeline(path) {
        Ok(pipeline) => {
            println!(
                "Pipeline '{}' is valid: {} stage(s), {} dependency edge(s)",
                pipeline.name(),
                pipeline.graph().len(),
                pipeline.graph().edges().len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => Ok(definition_failure(e)),
    }
}

/// Print the deterministic stage order with incoming edges
fn plan_pipeline(path: &Path) -> Result<ExitCode> {
    let pipeline = match load_pipeline(path) {
        Ok(pipeline) => pipeline,
        Err(e) => return Ok(definition_failure(e)),
    };

    println!("Pipeline: {}", pipeline.name());
    if !pipeline.filter().is_empty() {
        println!("Trigger: {}", pipeline.definition().trigger.branches.join(" "));
    }
    println!();

    let graph = pipeline.graph();
    for (index, stage_id) in graph.order().iter().enumerate() {
        println!("{:>3}. {}", index + 1, stage_id);
        for edge in graph.upstream(stage_id) {
            if edge.artifacts.is_empty() {
                println!("       <- {} ({})", edge.from, edge.policy);
            } else {
                println!(
                    "       <- {} ({}) artifacts: {}",
                    edge.from,
                    edge.policy,
                    edge.artifacts.join(", ")
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<ExitCode> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let orchestrator = Orchestrator::from_config(config::config()?);
    let run = orchestrator.get_run_status(run_id).await?;

    println!("{}", run.report());
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }

    if !run.artifacts.is_empty() {
        println!();
        println!("Persisted artifacts:");
        for record in &run.artifacts {
            let check = match orchestrator.load_artifact(record).await? {
                Some(content) if content_digest(&content) == record.content_ref => "ok",
                Some(_) => "digest mismatch",
                None => "missing",
            };
            println!("  {:<16} {}/{}", check, record.producer_stage_id, record.name);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<ExitCode> {
    let orchestrator = Orchestrator::from_config(config::config()?);
    let runs = orchestrator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<38} {:<20} {:<10} {:<20}", "RUN ID", "PIPELINE", "STATE", "TRIGGER");
    println!("{}", "-".repeat(90));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<10} {:<20}",
            run.id,
            run.pipeline_name,
            run.state.to_string(),
            run.trigger.describe()
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<ExitCode> {
    let cfg = config::config()?;

    println!("shipyard configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Runs:                {}", cfg.runs_dir().display());
    println!();
    println!("Scheduler:");
    if cfg.max_parallel == 0 {
        println!("  Max parallel stages: unlimited");
    } else {
        println!("  Max parallel stages: {}", cfg.max_parallel);
    }
    println!("  Stage timeout:       {}s", cfg.stage_timeout_seconds);
    println!();
    println!("Executor:");
    println!("  Shell: {}", cfg.shell);

    Ok(ExitCode::SUCCESS)
}
