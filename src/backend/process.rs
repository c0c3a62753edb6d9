//! Plain-subprocess backend.
//!
//! Each environment is a temporary workspace directory on the host; commands
//! and shells run as ordinary child processes with the workspace as their
//! working directory. This is the weakest isolation level — suitable for
//! trusted local use and as the reference implementation of the backend
//! contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    CommandOutput, EnvironmentHandle, ExecutionBackend, RunningCommand, ShellChannel,
    ShellControl, ShellOutput, ShellSignal,
};

const READ_CHUNK: usize = 1024;

struct Workspace {
    dir: TempDir,
    /// Pids of shells attached to this environment, force-killed on destroy.
    shell_pids: Vec<u32>,
}

/// Backend that runs commands as host subprocesses in temp-dir workspaces.
pub struct ProcessBackend {
    shell_argv: Vec<String>,
    workspaces: Mutex<HashMap<String, Workspace>>,
}

impl ProcessBackend {
    pub fn new(shell_argv: Vec<String>) -> Self {
        Self {
            shell_argv,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    fn command(argv: &[String], env_vars: &[(String, String)], cwd: &Path) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .context("empty argv")?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so kills reach the whole tree: a spawned
        // grandchild would otherwise survive and hold the output pipes open.
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in env_vars {
            cmd.env(key, value);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn provision(&self) -> Result<EnvironmentHandle> {
        let dir = tempfile::Builder::new()
            .prefix("runbox-")
            .tempdir()
            .context("Failed to create sandbox workspace")?;
        let handle = EnvironmentHandle {
            id: Uuid::new_v4().to_string(),
            workspace: dir.path().to_path_buf(),
        };
        debug!(env = %handle.id, workspace = %handle.workspace.display(), "Workspace provisioned");
        self.workspaces.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(
            handle.id.clone(),
            Workspace {
                dir,
                shell_pids: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn write_file(&self, env: &EnvironmentHandle, path: &str, bytes: &[u8]) -> Result<()> {
        let full = env.workspace.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create parent directories for {path}"))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .with_context(|| format!("Failed to write {path}"))
    }

    #[instrument(skip(self, env_vars), fields(env = %env.id))]
    async fn exec(
        &self,
        env: &EnvironmentHandle,
        argv: &[String],
        env_vars: &[(String, String)],
        cwd: &Path,
    ) -> Result<Box<dyn RunningCommand>> {
        let mut child = Self::command(argv, env_vars, cwd)?
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", argv[0]))?;
        // No interactive stdin for one-shot runs
        drop(child.stdin.take());

        let stdout = child.stdout.take().context("Failed to take stdout")?;
        let stderr = child.stderr.take().context("Failed to take stderr")?;
        let pid = child.id();

        Ok(Box::new(ProcessCommand {
            pid,
            child,
            stdout_task: Some(tokio::spawn(collect(stdout))),
            stderr_task: Some(tokio::spawn(collect(stderr))),
            finished: None,
        }))
    }

    #[instrument(skip(self), fields(env = %env.id))]
    async fn attach_shell(&self, env: &EnvironmentHandle) -> Result<ShellChannel> {
        let mut child = Self::command(&self.shell_argv, &[], &env.workspace)?
            .spawn()
            .with_context(|| format!("Failed to spawn shell: {}", self.shell_argv[0]))?;

        let mut stdin = child.stdin.take().context("Failed to take shell stdin")?;
        let stdout = child.stdout.take().context("Failed to take shell stdout")?;
        let stderr = child.stderr.take().context("Failed to take shell stderr")?;
        let pid = child.id();

        if let Some(pid) = pid {
            let mut workspaces = self
                .workspaces
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(ws) = workspaces.get_mut(&env.id) {
                ws.shell_pids.push(pid);
            }
        }

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(32);
        let (output_tx, output_rx) = mpsc::channel::<ShellOutput>(64);
        let (exited_tx, exited_rx) = watch::channel(false);

        // Client input -> shell stdin
        tokio::spawn(async move {
            while let Some(bytes) = input_rx.recv().await {
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Shell stdout/stderr -> client, pushed chunk by chunk
        let stdout_task = tokio::spawn(pump(stdout, output_tx.clone(), ShellOutput::Stdout));
        let stderr_task = tokio::spawn(pump(stderr, output_tx.clone(), ShellOutput::Stderr));

        // Reap the shell; Exited is always the final message
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let code = status.ok().and_then(|s| s.code());
            let _ = exited_tx.send(true);
            let _ = output_tx.send(ShellOutput::Exited(code)).await;
        });

        Ok(ShellChannel {
            input: input_tx,
            output: output_rx,
            control: Box::new(ProcessShellControl { pid, exited_rx }),
        })
    }

    async fn destroy(&self, env: &EnvironmentHandle) -> Result<()> {
        let workspace = self
            .workspaces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&env.id);
        let Some(workspace) = workspace else {
            return Ok(()); // already destroyed
        };
        for pid in &workspace.shell_pids {
            signal_group(*pid, ShellSignal::Kill);
        }
        let path = workspace.dir.path().to_path_buf();
        if let Err(e) = workspace.dir.close() {
            warn!(env = %env.id, workspace = %path.display(), error = %e,
                "Failed to remove workspace; leaving for out-of-band reaping");
        }
        debug!(env = %env.id, "Environment destroyed");
        Ok(())
    }
}

/// One command running as a host subprocess.
struct ProcessCommand {
    pid: Option<u32>,
    child: Child,
    stdout_task: Option<JoinHandle<Vec<u8>>>,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
    finished: Option<CommandOutput>,
}

#[async_trait]
impl RunningCommand for ProcessCommand {
    async fn wait(&mut self) -> Result<CommandOutput> {
        if let Some(output) = &self.finished {
            return Ok(output.clone());
        }
        let status = self
            .child
            .wait()
            .await
            .context("Failed to wait for process")?;
        let stdout = match self.stdout_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let output = CommandOutput {
            stdout,
            stderr,
            exit_code: status.code(),
        };
        self.finished = Some(output.clone());
        Ok(output)
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(pid) = self.pid {
            signal_group(pid, ShellSignal::Terminate);
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(pid) = self.pid {
            signal_group(pid, ShellSignal::Kill);
        }
        self.child
            .start_kill()
            .context("Failed to kill process")?;
        Ok(())
    }
}

struct ProcessShellControl {
    pid: Option<u32>,
    exited_rx: watch::Receiver<bool>,
}

#[async_trait]
impl ShellControl for ProcessShellControl {
    async fn signal(&self, signal: ShellSignal) -> Result<()> {
        if let Some(pid) = self.pid {
            signal_group(pid, signal);
        }
        Ok(())
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<bool> {
        // Plain pipes carry no terminal geometry
        Ok(false)
    }

    async fn shutdown(&self, grace: Duration) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        signal_group(pid, ShellSignal::Terminate);

        let mut exited_rx = self.exited_rx.clone();
        let exited = tokio::time::timeout(grace, exited_rx.wait_for(|done| *done)).await;
        if exited.is_err() {
            debug!(pid, "Shell ignored SIGTERM; force-killing");
            signal_group(pid, ShellSignal::Kill);
        }
        Ok(())
    }
}

async fn collect(mut reader: impl AsyncReadExt + Unpin) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

async fn pump<R, F>(mut reader: R, tx: mpsc::Sender<ShellOutput>, wrap: F)
where
    R: AsyncReadExt + Unpin,
    F: Fn(Vec<u8>) -> ShellOutput,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Deliver a signal to the process group rooted at `pid`. Every spawn puts
/// the child in its own group, so this reaches grandchildren too.
#[cfg(unix)]
fn signal_group(pid: u32, signal: ShellSignal) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        ShellSignal::Interrupt => Signal::SIGINT,
        ShellSignal::Terminate => Signal::SIGTERM,
        ShellSignal::Kill => Signal::SIGKILL,
        ShellSignal::Hangup => Signal::SIGHUP,
    };
    #[allow(clippy::cast_possible_wrap)]
    let group = Pid::from_raw(-(pid as i32));
    if let Err(e) = kill(group, sig) {
        // ESRCH just means the group is already gone
        if e != nix::errno::Errno::ESRCH {
            warn!(pid, ?sig, error = %e, "Failed to deliver signal");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: ShellSignal) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ProcessBackend {
        ProcessBackend::new(vec!["/bin/sh".to_string(), "-i".to_string()])
    }

    #[tokio::test]
    async fn exec_captures_output_and_exit_code() {
        let backend = backend();
        let env = backend.provision().await.unwrap();
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo out; echo err >&2; exit 3".to_string(),
        ];
        let mut cmd = backend
            .exec(&env, &argv, &[], &env.workspace)
            .await
            .unwrap();
        let output = cmd.wait().await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn wait_is_repeatable_after_completion() {
        let backend = backend();
        let env = backend.provision().await.unwrap();
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()];
        let mut cmd = backend
            .exec(&env, &argv, &[], &env.workspace)
            .await
            .unwrap();
        let first = cmd.wait().await.unwrap();
        let second = cmd.wait().await.unwrap();
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(first.exit_code, second.exit_code);
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn write_file_lands_in_workspace() {
        let backend = backend();
        let env = backend.provision().await.unwrap();
        backend
            .write_file(&env, "nested/dir/hello.txt", b"hi")
            .await
            .unwrap();
        let content = tokio::fs::read(env.workspace.join("nested/dir/hello.txt"))
            .await
            .unwrap();
        assert_eq!(content, b"hi");
        backend.destroy(&env).await.unwrap();
        assert!(!env.workspace.exists());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let backend = backend();
        let env = backend.provision().await.unwrap();
        backend.destroy(&env).await.unwrap();
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn shell_round_trip() {
        let backend = ProcessBackend::new(vec!["/bin/sh".to_string()]);
        let env = backend.provision().await.unwrap();
        let mut shell = backend.attach_shell(&env).await.unwrap();

        shell.input.send(b"echo ready\n".to_vec()).await.unwrap();
        shell.input.send(b"exit 0\n".to_vec()).await.unwrap();

        let mut stdout = Vec::new();
        let mut exit = None;
        while let Some(msg) = shell.output.recv().await {
            match msg {
                ShellOutput::Stdout(bytes) => stdout.extend_from_slice(&bytes),
                ShellOutput::Stderr(_) => {}
                ShellOutput::Exited(code) => {
                    exit = Some(code);
                    break;
                }
            }
        }
        assert_eq!(exit, Some(Some(0)));
        assert!(String::from_utf8_lossy(&stdout).contains("ready"));
        backend.destroy(&env).await.unwrap();
    }
}
