//! One-shot execution pipeline.
//!
//! Drives a single request through provision → write files → build/run →
//! capture → destroy. The sandbox is torn down on every exit path, and the
//! registry slot is released as the last action, so no outcome can leak
//! capacity or leave a stale listing entry.

use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{CommandOutput, EnvironmentHandle, ExecutionBackend, RunningCommand};
use crate::config::ManagerConfig;
use crate::error::SandboxError;
use crate::language::{self, CommandPlan};
use crate::registry::SandboxRegistry;
use crate::types::{ExecutionRequest, ExecutionResult, SandboxKind};

/// Appended to stderr when a run is killed by its deadline, so callers can
/// tell a timeout from a program crash.
pub const TIMEOUT_MARKER: &str = "[runbox] process timed out";

/// Appended when captured output hit the configured byte cap.
pub const TRUNCATION_MARKER: &str = "[runbox] output truncated";

/// Execute one request to completion. Returns exactly one result (timeouts
/// included) or one structured error.
pub async fn run(
    backend: &Arc<dyn ExecutionBackend>,
    registry: &SandboxRegistry,
    config: &ManagerConfig,
    request: &ExecutionRequest,
) -> Result<ExecutionResult, SandboxError> {
    // Input validation and dispatch are pure; both happen before any backend
    // resource is consumed.
    validate_files(request)?;
    let plan = language::resolve(&request.language, &request.files)?;
    let timeout = config.effective_timeout(request.timeout_ms);

    let token = registry.try_reserve()?;
    let env = backend.provision().await.map_err(SandboxError::Provision)?;
    let sandbox_id = Uuid::new_v4().to_string();
    token.register(&sandbox_id, SandboxKind::Run, env.clone());
    debug!(sandbox = %sandbox_id, language = %request.language, "Run sandbox provisioned");

    let result = execute(backend, config, &env, &plan, timeout, &sandbox_id, request).await;

    // Teardown failure is logged, never surfaced: the result already exists
    // and a dangling environment is the reaper's problem.
    if let Err(e) = backend.destroy(&env).await {
        warn!(sandbox = %sandbox_id, language = %request.language, error = %e,
            "Teardown failed; environment left for out-of-band reaping");
    }
    registry.unregister(&sandbox_id);
    result
}

async fn execute(
    backend: &Arc<dyn ExecutionBackend>,
    config: &ManagerConfig,
    env: &EnvironmentHandle,
    plan: &CommandPlan,
    timeout: Duration,
    sandbox_id: &str,
    request: &ExecutionRequest,
) -> Result<ExecutionResult, SandboxError> {
    for file in &request.files {
        backend
            .write_file(env, &file.path, file.content.as_bytes())
            .await
            .map_err(SandboxError::Backend)?;
    }

    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + timeout;

    // Build and run share one deadline; a hanging compiler is killed the
    // same way a hanging program is.
    if let Some(build) = &plan.build {
        let cmd = backend
            .exec(env, build, &plan.env, &env.workspace)
            .await
            .map_err(SandboxError::Backend)?;
        let (output, timed_out) = run_step(cmd, deadline, config.kill_grace()).await?;
        if timed_out || output.exit_code != Some(0) {
            info!(sandbox = %sandbox_id, exit = ?output.exit_code, "Build failed; skipping run");
            return Ok(capture(config, sandbox_id, started, timeout, output, timed_out));
        }
    }

    let cmd = backend
        .exec(env, &plan.run, &plan.env, &env.workspace)
        .await
        .map_err(SandboxError::Backend)?;
    let (output, timed_out) = run_step(cmd, deadline, config.kill_grace()).await?;
    Ok(capture(config, sandbox_id, started, timeout, output, timed_out))
}

/// Race one command against the shared deadline. Exactly one of natural
/// completion or timeout wins; on timeout the command goes through the
/// two-phase kill and `exit_code` is reported as `None`.
async fn run_step(
    mut cmd: Box<dyn RunningCommand>,
    deadline: tokio::time::Instant,
    grace: Duration,
) -> Result<(CommandOutput, bool), SandboxError> {
    match tokio::time::timeout_at(deadline, cmd.wait()).await {
        Ok(output) => Ok((output.map_err(SandboxError::Backend)?, false)),
        Err(_) => {
            let output = cmd.shutdown(grace).await.unwrap_or_default();
            Ok((
                CommandOutput {
                    exit_code: None,
                    ..output
                },
                true,
            ))
        }
    }
}

fn capture(
    config: &ManagerConfig,
    sandbox_id: &str,
    started: Instant,
    timeout: Duration,
    output: CommandOutput,
    timed_out: bool,
) -> ExecutionResult {
    let stdout = clip(&output.stdout, config.max_output_bytes);
    let mut stderr = clip(&output.stderr, config.max_output_bytes);
    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(TIMEOUT_MARKER);
        stderr.push_str(&format!(" after {} ms", timeout.as_millis()));
    }
    ExecutionResult {
        stdout,
        stderr,
        exit_code: output.exit_code,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        sandbox_id: sandbox_id.to_string(),
    }
}

fn clip(bytes: &[u8], cap: usize) -> String {
    if bytes.len() <= cap {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut text = String::from_utf8_lossy(&bytes[..cap]).into_owned();
    text.push('\n');
    text.push_str(TRUNCATION_MARKER);
    text
}

fn validate_files(request: &ExecutionRequest) -> Result<(), SandboxError> {
    let mut seen = std::collections::HashSet::new();
    for file in &request.files {
        validate_relative_path(&file.path)?;
        if !seen.insert(file.path.as_str()) {
            return Err(SandboxError::InvalidPath(file.path.clone()));
        }
    }
    Ok(())
}

/// Reject any path that could resolve outside the workspace root. This is the
/// one security-relevant check the manager performs itself; the backend is
/// never handed an unvalidated relative path.
pub fn validate_relative_path(path: &str) -> Result<(), SandboxError> {
    let reject = || SandboxError::InvalidPath(path.to_string());
    if path.is_empty() {
        return Err(reject());
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(reject());
    }
    let mut depth: usize = 0;
    for component in p.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth.checked_sub(1).ok_or_else(reject)?;
            }
            Component::RootDir | Component::Prefix(_) => return Err(reject()),
        }
    }
    // A path that normalizes to the root itself names no file
    if depth == 0 {
        return Err(reject());
    }
    Ok(())
}
