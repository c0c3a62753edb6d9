//! Interactive terminal sessions.
//!
//! A session is a long-lived bidirectional bridge between a client and a
//! shell inside a sandbox. Client bytes are forwarded verbatim to the shell;
//! shell output is pushed to the client as it arrives. Four triggers funnel
//! into one Closing path — shell exit, explicit stop, client disconnect, and
//! the idle/lifetime deadlines — so teardown runs exactly once per session,
//! and the sandbox itself is destroyed when its last session closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{EnvironmentHandle, ExecutionBackend, ShellChannel, ShellOutput, ShellSignal};
use crate::registry::SandboxRegistry;

/// Control messages a client sends into a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionControl {
    /// Raw bytes for the shell's stdin.
    Input(Vec<u8>),
    /// Terminal geometry change. Recorded as metadata and forwarded when the
    /// backend supports geometry; never fails the session.
    Resize { cols: u16, rows: u16 },
    /// Deliver a process signal to the shell.
    Signal(ShellSignal),
    /// Close the session.
    Stop,
}

/// Events a session emits toward its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { sandbox_id: String },
    Output(Vec<u8>),
    Exited { code: Option<i32> },
    Error { message: String },
}

/// Client-side handle to a live session. Dropping the handle counts as a
/// client disconnect and closes the session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub sandbox_id: String,
    pub events: mpsc::Receiver<SessionEvent>,
    pub(crate) control: mpsc::Sender<SessionControl>,
}

/// Why a session left the Streaming state. All variants share the same
/// cleanup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ShellExited,
    Stopped,
    ClientDisconnected,
    IdleTimeout,
    LifetimeExceeded,
}

/// The long-lived half of a terminal session: owns the shell channel and
/// pumps bytes both ways until a close trigger fires.
pub struct TerminalSessionBridge {
    pub session_id: String,
    pub sandbox_id: String,
    pub env: EnvironmentHandle,
    pub backend: Arc<dyn ExecutionBackend>,
    pub registry: Arc<SandboxRegistry>,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub kill_grace: Duration,
}

impl TerminalSessionBridge {
    /// Run the bridge to completion on its own task.
    pub fn spawn(
        self,
        shell: ShellChannel,
        control: mpsc::Receiver<SessionControl>,
        events: mpsc::Sender<SessionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.stream(shell, control, events))
    }

    async fn stream(
        self,
        mut shell: ShellChannel,
        mut control: mpsc::Receiver<SessionControl>,
        events: mpsc::Sender<SessionEvent>,
    ) {
        let lifetime_deadline = Instant::now() + self.max_lifetime;
        let mut idle_deadline = Instant::now() + self.idle_timeout;
        let mut exit_code: Option<i32> = None;

        let reason = loop {
            tokio::select! {
                message = control.recv() => match message {
                    Some(SessionControl::Input(bytes)) => {
                        idle_deadline = Instant::now() + self.idle_timeout;
                        self.registry.touch_session(&self.session_id);
                        if shell.input.send(bytes).await.is_err() {
                            // Shell stdin gone; the Exited message follows on
                            // the output channel.
                            debug!(session = %self.session_id, "Input after shell stdin closed");
                        }
                    }
                    Some(SessionControl::Resize { cols, rows }) => {
                        self.registry.set_session_geometry(&self.session_id, cols, rows);
                        match shell.control.resize(cols, rows).await {
                            Ok(true) => debug!(session = %self.session_id, cols, rows, "Resize forwarded"),
                            Ok(false) => debug!(session = %self.session_id, cols, rows, "Resize recorded; backend has no geometry"),
                            Err(e) => warn!(session = %self.session_id, error = %e, "Resize failed; session continues"),
                        }
                    }
                    Some(SessionControl::Signal(signal)) => {
                        if let Err(e) = shell.control.signal(signal).await {
                            let _ = events.send(SessionEvent::Error {
                                message: format!("signal delivery failed: {e}"),
                            }).await;
                        }
                    }
                    Some(SessionControl::Stop) => break CloseReason::Stopped,
                    None => break CloseReason::ClientDisconnected,
                },
                output = shell.output.recv() => match output {
                    Some(ShellOutput::Stdout(bytes) | ShellOutput::Stderr(bytes)) => {
                        idle_deadline = Instant::now() + self.idle_timeout;
                        self.registry.touch_session(&self.session_id);
                        if events.send(SessionEvent::Output(bytes)).await.is_err() {
                            break CloseReason::ClientDisconnected;
                        }
                    }
                    Some(ShellOutput::Exited(code)) => {
                        exit_code = code;
                        break CloseReason::ShellExited;
                    }
                    None => break CloseReason::ShellExited,
                },
                // The client's event receiver lives on its SessionHandle;
                // dropping the handle is the disconnect signal.
                () = events.closed() => break CloseReason::ClientDisconnected,
                () = tokio::time::sleep_until(idle_deadline) => break CloseReason::IdleTimeout,
                () = tokio::time::sleep_until(lifetime_deadline) => break CloseReason::LifetimeExceeded,
            }
        };

        self.close(&shell, reason, exit_code, &events).await;
    }

    /// The single Closing → Destroyed path, reached exactly once per session
    /// regardless of which trigger fired.
    async fn close(
        &self,
        shell: &ShellChannel,
        reason: CloseReason,
        exit_code: Option<i32>,
        events: &mpsc::Sender<SessionEvent>,
    ) {
        info!(
            session = %self.session_id,
            sandbox = %self.sandbox_id,
            ?reason,
            "Closing terminal session"
        );

        if reason != CloseReason::ShellExited {
            if let Err(e) = shell.control.shutdown(self.kill_grace).await {
                warn!(session = %self.session_id, error = %e, "Shell shutdown failed");
            }
        }

        // Detach is idempotent through the registry: whichever racer loses
        // gets None and does nothing further.
        if let Some((sandbox_id, last)) = self.registry.detach_session(&self.session_id) {
            if last {
                if let Err(e) = self.backend.destroy(&self.env).await {
                    warn!(sandbox = %sandbox_id, error = %e,
                        "Teardown failed; environment left for out-of-band reaping");
                }
                self.registry.unregister(&sandbox_id);
            }
        }

        // Emitted after the registry is clean: a client that observes Exited
        // can rely on the session and sandbox being gone.
        let _ = events.send(SessionEvent::Exited { code: exit_code }).await;
    }
}
