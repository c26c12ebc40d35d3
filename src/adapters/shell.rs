//! Shell executor for stage steps.
//!
//! Each step's `run` line is handed to `sh -c` inside the stage workspace.
//! Bound parameters are exported as environment variables, so a deploy
//! step can simply refer to `$DEPLOY_ENV`.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use glob::Pattern;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::pipeline::{Requirement, StepSpec};

use super::{ProducedArtifact, StageExecutor, StepContext, StepError, StepOutput};

/// Tail of stderr kept in error messages
const STDERR_TAIL_BYTES: usize = 2048;

/// Executor running steps through a POSIX shell
pub struct ShellExecutor {
    /// Shell binary (default: "sh")
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    /// Create an executor with a custom shell binary
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }
}

/// Workspace files whose relative path matches a produce rule. Artifacts
/// pulled from upstream stages are skipped.
async fn scan_workspace(ctx: &StepContext) -> Vec<ProducedArtifact> {
    if ctx.produces.is_empty() {
        return Vec::new();
    }
    let workspace = ctx.workspace.as_path();
    let consumed: HashSet<&str> = ctx.artifacts.iter().map(|a| a.name.as_str()).collect();

    let walk = format!("{}/**/*", Pattern::escape(&workspace.to_string_lossy()));
    let entries = match glob::glob(&walk) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Failed to scan workspace");
            return Vec::new();
        }
    };

    let mut produced = Vec::new();
    for path in entries.flatten() {
        if !path.is_file() {
            continue;
        }
        let Ok(relative) = path.strip_prefix(workspace) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if consumed.contains(name.as_str()) || !ctx.produces.iter().any(|r| r.matches(&name)) {
            continue;
        }

        match tokio::fs::read(&path).await {
            Ok(content) => produced.push(ProducedArtifact { name, content }),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to read output"),
        }
    }
    produced
}

/// Search PATH for an executable
fn tool_on_path(tool: &str) -> bool {
    if tool.contains('/') {
        return is_executable(Path::new(tool));
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(tool))))
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[async_trait]
impl StageExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn check_requirement(&self, requirement: &Requirement) -> bool {
        match requirement {
            Requirement::Tool(tool) => tool_on_path(tool),
            Requirement::Env(var) => std::env::var_os(var).is_some(),
        }
    }

    async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> Result<StepOutput, StepError> {
        debug!(stage = %ctx.stage_id, step = %step.name, command = %step.run, "Spawning step");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&step.run)
            .current_dir(&ctx.workspace)
            .envs(&ctx.parameters)
            .envs(&step.env)
            .env("SHIPYARD_RUN_ID", ctx.run_id.to_string())
            .env("SHIPYARD_STAGE", &ctx.stage_id)
            .env("SHIPYARD_STEP", &step.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StepError::Spawn {
                step: step.name.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StepError::Exit {
                step: step.name.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr: tail(stderr.trim(), STDERR_TAIL_BYTES).to_string(),
            });
        }

        Ok(StepOutput::new(String::from_utf8_lossy(&output.stdout)))
    }

    async fn collect_outputs(&self, ctx: &StepContext) -> Vec<ProducedArtifact> {
        scan_workspace(ctx).await
    }
}
