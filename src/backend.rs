//! Execution backend trait and implementations.
//!
//! A backend knows how to materialize an isolated environment, run commands
//! inside it, attach an interactive shell, and destroy it. The manager never
//! assumes anything about the isolation mechanism — a plain subprocess, a
//! container engine, or a microVM all fit behind this seam, chosen at
//! construction time.

mod process;

pub use process::ProcessBackend;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Reference to one provisioned environment. `id` is the backend's address
/// for the environment; `workspace` is the writable filesystem root the
/// request files land in.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    pub id: String,
    pub workspace: PathBuf,
}

/// Captured output of a finished (or killed) command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was killed before exiting on its own.
    pub exit_code: Option<i32>,
}

/// A command started inside an environment.
///
/// `wait` is push-based: it resolves when the process actually terminates,
/// never by polling from the caller's side. Implementations must tolerate
/// `wait` being cancelled and re-invoked (the pipeline races it against the
/// run deadline), and must return the same output on repeated calls after
/// completion.
#[async_trait]
pub trait RunningCommand: Send {
    /// Wait for termination and collect output.
    async fn wait(&mut self) -> Result<CommandOutput>;

    /// Ask the process to stop (graceful signal).
    async fn terminate(&mut self) -> Result<()>;

    /// Force-kill the process.
    async fn kill(&mut self) -> Result<()>;

    /// Two-phase stop: graceful signal, then a forced kill if the process is
    /// still running after `grace`. The uniform destruction discipline for
    /// every backend-managed process.
    async fn shutdown(&mut self, grace: Duration) -> Result<CommandOutput> {
        self.terminate().await?;
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(output) => output,
            Err(_) => {
                self.kill().await?;
                self.wait().await
            }
        }
    }
}

/// One chunk of interactive shell traffic, pushed as it is produced.
/// Ordering is preserved within each stream; no ordering is promised between
/// stdout and stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// The shell process terminated. Always the final message.
    Exited(Option<i32>),
}

/// Signals a client may deliver to an interactive shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellSignal {
    Interrupt,
    Terminate,
    Kill,
    Hangup,
}

impl ShellSignal {
    /// Parse a wire-level signal name (`"SIGINT"`, `"int"`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim_start_matches("SIG").to_ascii_lowercase().as_str() {
            "int" | "interrupt" => Some(Self::Interrupt),
            "term" | "terminate" => Some(Self::Terminate),
            "kill" => Some(Self::Kill),
            "hup" | "hangup" => Some(Self::Hangup),
            _ => None,
        }
    }
}

/// Out-of-band operations on an attached shell.
#[async_trait]
pub trait ShellControl: Send + Sync {
    /// Deliver a process signal to the shell.
    async fn signal(&self, signal: ShellSignal) -> Result<()>;

    /// Apply terminal geometry. Returns `false` when the backend has no
    /// geometry support; the call itself must not fail in that case.
    async fn resize(&self, cols: u16, rows: u16) -> Result<bool>;

    /// Two-phase stop of the shell process.
    async fn shutdown(&self, grace: Duration) -> Result<()>;
}

/// Bidirectional channel to a shell running inside an environment.
///
/// Bytes sent on `input` reach the shell's stdin verbatim; everything the
/// shell produces arrives on `output` as it happens.
pub struct ShellChannel {
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<ShellOutput>,
    pub control: Box<dyn ShellControl>,
}

/// The pluggable isolation capability.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Materialize a fresh, empty environment.
    async fn provision(&self) -> Result<EnvironmentHandle>;

    /// Write one file into the environment's workspace, creating parent
    /// directories as needed. `path` has already been validated as staying
    /// inside the workspace.
    async fn write_file(&self, env: &EnvironmentHandle, path: &str, bytes: &[u8]) -> Result<()>;

    /// Start a command inside the environment with `cwd` as working
    /// directory.
    async fn exec(
        &self,
        env: &EnvironmentHandle,
        argv: &[String],
        env_vars: &[(String, String)],
        cwd: &Path,
    ) -> Result<Box<dyn RunningCommand>>;

    /// Attach an interactive shell to the environment.
    async fn attach_shell(&self, env: &EnvironmentHandle) -> Result<ShellChannel>;

    /// Tear the environment down. Idempotent: destroying an already-destroyed
    /// environment is a no-op, because the shutdown sweep may race normal
    /// cleanup.
    async fn destroy(&self, env: &EnvironmentHandle) -> Result<()>;

    /// Whether a second shell can be attached to an environment that already
    /// has one.
    fn supports_multi_attach(&self) -> bool {
        true
    }
}
