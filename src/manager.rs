//! The sandbox manager facade.
//!
//! The only entry point surrounding code calls: one-shot runs, interactive
//! sessions, session control, listing, and the shutdown sweep. Everything
//! else in the crate is wiring behind this type.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{EnvironmentHandle, ExecutionBackend, ProcessBackend, ShellSignal};
use crate::config::ManagerConfig;
use crate::error::SandboxError;
use crate::pipeline::{self, validate_relative_path};
use crate::registry::{SandboxRegistry, SessionRecord};
use crate::session::{
    SessionControl, SessionEvent, SessionHandle, TerminalSessionBridge,
};
use crate::types::{ActiveSandbox, ExecutionRequest, ExecutionResult, SandboxKind, SourceFile};

/// Request to open an interactive session.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// Files to materialize into the workspace before attaching the shell.
    /// May be empty; the workspace itself is always created.
    pub files: Vec<SourceFile>,

    /// Attach to an existing session sandbox (e.g. a split pane) instead of
    /// provisioning a fresh one.
    pub sandbox_id: Option<String>,
}

/// Facade wiring the registry, pipeline, and session bridge together over a
/// construction-time backend choice.
pub struct SandboxManager {
    config: ManagerConfig,
    backend: Arc<dyn ExecutionBackend>,
    registry: Arc<SandboxRegistry>,
}

impl SandboxManager {
    pub fn new(config: ManagerConfig, backend: Arc<dyn ExecutionBackend>) -> Self {
        let registry = Arc::new(SandboxRegistry::new(config.max_sandboxes));
        Self {
            config,
            backend,
            registry,
        }
    }

    /// Manager over the plain-subprocess backend.
    pub fn with_process_backend(config: ManagerConfig) -> Self {
        let backend = Arc::new(ProcessBackend::new(config.shell.clone()));
        Self::new(config, backend)
    }

    /// Execute one request in a fresh sandbox. The sandbox is destroyed
    /// before this returns, success or failure.
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        pipeline::run(&self.backend, &self.registry, &self.config, request).await
    }

    /// Open an interactive terminal session, provisioning a sandbox unless
    /// the request names an existing one.
    pub async fn start_session(
        &self,
        request: SessionRequest,
    ) -> Result<SessionHandle, SandboxError> {
        // Validate before any backend resource is consumed
        for file in &request.files {
            validate_relative_path(&file.path)?;
        }

        let (sandbox_id, env, fresh) = match request.sandbox_id {
            Some(existing) => self.reuse_sandbox(existing)?,
            None => self.provision_session_sandbox().await?,
        };

        let result = self.attach(&sandbox_id, &env, &request.files).await;
        match result {
            Ok(handle) => Ok(handle),
            Err(e) => {
                // A fresh sandbox with no session yet is ours to tear down;
                // a reused one still belongs to its existing sessions.
                if fresh {
                    if let Err(destroy_err) = self.backend.destroy(&env).await {
                        warn!(sandbox = %sandbox_id, error = %destroy_err,
                            "Teardown failed; environment left for out-of-band reaping");
                    }
                    self.registry.unregister(&sandbox_id);
                }
                Err(e)
            }
        }
    }

    fn reuse_sandbox(
        &self,
        sandbox_id: String,
    ) -> Result<(String, EnvironmentHandle, bool), SandboxError> {
        let kind = self
            .registry
            .kind_of(&sandbox_id)
            .ok_or_else(|| SandboxError::SessionNotFound(sandbox_id.clone()))?;
        // A run sandbox is owned by its pipeline and never hosts sessions
        if kind != SandboxKind::Session {
            return Err(SandboxError::AlreadyAttached(sandbox_id));
        }
        if self.registry.session_count_for(&sandbox_id) > 0
            && !self.backend.supports_multi_attach()
        {
            return Err(SandboxError::AlreadyAttached(sandbox_id));
        }
        let env = self
            .registry
            .env_of(&sandbox_id)
            .ok_or_else(|| SandboxError::SessionNotFound(sandbox_id.clone()))?;
        Ok((sandbox_id, env, false))
    }

    async fn provision_session_sandbox(
        &self,
    ) -> Result<(String, EnvironmentHandle, bool), SandboxError> {
        let token = self.registry.try_reserve()?;
        let env = self
            .backend
            .provision()
            .await
            .map_err(SandboxError::Provision)?;
        let sandbox_id = Uuid::new_v4().to_string();
        token.register(&sandbox_id, SandboxKind::Session, env.clone());
        Ok((sandbox_id, env, true))
    }

    async fn attach(
        &self,
        sandbox_id: &str,
        env: &EnvironmentHandle,
        files: &[SourceFile],
    ) -> Result<SessionHandle, SandboxError> {
        for file in files {
            self.backend
                .write_file(env, &file.path, file.content.as_bytes())
                .await
                .map_err(SandboxError::Backend)?;
        }

        let shell = self
            .backend
            .attach_shell(env)
            .await
            .map_err(SandboxError::Backend)?;

        let session_id = Uuid::new_v4().to_string();
        let (control_tx, control_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(256);

        self.registry.attach_session(
            &session_id,
            SessionRecord {
                sandbox_id: sandbox_id.to_string(),
                control: control_tx.clone(),
                last_activity: std::time::Instant::now(),
                cols: 80,
                rows: 24,
            },
        )?;

        let _ = events_tx
            .send(SessionEvent::Started {
                sandbox_id: sandbox_id.to_string(),
            })
            .await;

        info!(session = %session_id, sandbox = %sandbox_id, "Terminal session started");

        let bridge = TerminalSessionBridge {
            session_id: session_id.clone(),
            sandbox_id: sandbox_id.to_string(),
            env: env.clone(),
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            idle_timeout: self.config.session_idle_timeout(),
            max_lifetime: self.config.session_max_lifetime(),
            kill_grace: self.config.kill_grace(),
        };
        bridge.spawn(shell, control_rx, events_tx);

        Ok(SessionHandle {
            id: session_id,
            sandbox_id: sandbox_id.to_string(),
            events: events_rx,
            control: control_tx,
        })
    }

    /// Forward raw bytes to a session's shell.
    pub async fn send_input(&self, session_id: &str, bytes: Vec<u8>) -> Result<(), SandboxError> {
        self.send_control(session_id, SessionControl::Input(bytes))
            .await
    }

    /// Update a session's terminal geometry.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), SandboxError> {
        self.send_control(session_id, SessionControl::Resize { cols, rows })
            .await
    }

    /// Deliver a process signal to a session's shell.
    pub async fn signal(&self, session_id: &str, signal: ShellSignal) -> Result<(), SandboxError> {
        self.send_control(session_id, SessionControl::Signal(signal))
            .await
    }

    /// Close a session. Idempotent while the session is closing: a second
    /// stop is a no-op, and only a stale id is an error.
    pub async fn stop(&self, session_id: &str) -> Result<(), SandboxError> {
        let control = self
            .registry
            .session_control(session_id)
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))?;
        // A closed channel means the bridge is already past Streaming; the
        // session is closing anyway, which is what stop asks for.
        let _ = control.send(SessionControl::Stop).await;
        Ok(())
    }

    async fn send_control(
        &self,
        session_id: &str,
        message: SessionControl,
    ) -> Result<(), SandboxError> {
        let control = self
            .registry
            .session_control(session_id)
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))?;
        control
            .send(message)
            .await
            .map_err(|_| SandboxError::SessionNotFound(session_id.to_string()))
    }

    /// Snapshot of live sandboxes.
    pub fn list_active(&self) -> Vec<ActiveSandbox> {
        self.registry.list_active()
    }

    /// Destroy every live sandbox. Called on process shutdown; no sandbox
    /// outlives the manager.
    pub async fn shutdown(&self) {
        let sandboxes = self.registry.all_sandboxes();
        if !sandboxes.is_empty() {
            info!(count = sandboxes.len(), "Shutdown sweep: destroying live sandboxes");
        }
        for control in self.registry.all_session_controls() {
            let _ = control.send(SessionControl::Stop).await;
        }
        for (sandbox_id, env) in sandboxes {
            if let Err(e) = self.backend.destroy(&env).await {
                warn!(sandbox = %sandbox_id, error = %e, "Shutdown teardown failed");
            }
            self.registry.unregister(&sandbox_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockExec};

    fn manager_with(backend: MockBackend) -> (SandboxManager, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let manager = SandboxManager::new(
            ManagerConfig::default(),
            Arc::clone(&backend) as Arc<dyn ExecutionBackend>,
        );
        (manager, backend)
    }

    fn python_request() -> ExecutionRequest {
        ExecutionRequest {
            files: vec![SourceFile {
                path: "main.py".into(),
                content: "print('hi')".into(),
            }],
            language: "python".into(),
            timeout_ms: None,
        }
    }

    async fn wait_for_started(handle: &mut SessionHandle) {
        match handle.events.recv().await {
            Some(SessionEvent::Started { .. }) => {}
            other => panic!("expected Started, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_produces_result_and_clean_registry() {
        let (manager, backend) = manager_with(MockBackend::new());
        backend.script_exec(MockExec::immediate(0, "hi\n", ""));

        let result = manager.run(&python_request()).await.unwrap();
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(manager.list_active().is_empty());
    }

    #[tokio::test]
    async fn session_lifecycle_with_double_stop() {
        let (manager, _backend) = manager_with(MockBackend::new());

        let mut handle = manager.start_session(SessionRequest::default()).await.unwrap();
        wait_for_started(&mut handle).await;
        assert_eq!(manager.list_active().len(), 1);

        manager.resize(&handle.id, 100, 30).await.unwrap();
        manager.resize(&handle.id, 120, 40).await.unwrap();

        // Two stops in a row: the second is a no-op, not an error
        manager.stop(&handle.id).await.unwrap();
        manager.stop(&handle.id).await.unwrap();

        // Drain until the bridge reports Exited
        loop {
            match handle.events.recv().await {
                Some(SessionEvent::Exited { .. }) | None => break,
                Some(_) => {}
            }
        }
        assert!(manager.list_active().is_empty());

        // Now the id is stale
        assert!(matches!(
            manager.stop(&handle.id).await,
            Err(SandboxError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn session_input_round_trip() {
        let (manager, backend) = manager_with(MockBackend::new());

        let mut handle = manager.start_session(SessionRequest::default()).await.unwrap();
        wait_for_started(&mut handle).await;

        manager.send_input(&handle.id, b"pwd\n".to_vec()).await.unwrap();
        let driver = backend.shell_driver(0);
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if driver.received_input.lock().unwrap().as_slice() == b"pwd\n" {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        driver
            .output_tx
            .send(crate::backend::ShellOutput::Stdout(b"/work\n".to_vec()))
            .await
            .unwrap();
        assert_eq!(
            handle.events.recv().await,
            Some(SessionEvent::Output(b"/work\n".to_vec()))
        );

        manager.stop(&handle.id).await.unwrap();
    }

    #[tokio::test]
    async fn session_files_are_written_before_attach() {
        let (manager, backend) = manager_with(MockBackend::new());

        let request = SessionRequest {
            files: vec![SourceFile {
                path: "notes/todo.txt".into(),
                content: "x".into(),
            }],
            sandbox_id: None,
        };
        let mut handle = manager.start_session(request).await.unwrap();
        wait_for_started(&mut handle).await;

        let calls = backend.recorded_calls();
        let write_pos = calls.iter().position(|c| c == "write notes/todo.txt");
        let attach_pos = calls.iter().position(|c| c == "attach_shell");
        assert!(write_pos.unwrap() < attach_pos.unwrap());
    }

    #[tokio::test]
    async fn second_attach_shares_sandbox_until_last_stop() {
        let (manager, backend) = manager_with(MockBackend::new());

        let mut first = manager.start_session(SessionRequest::default()).await.unwrap();
        wait_for_started(&mut first).await;
        let mut second = manager
            .start_session(SessionRequest {
                files: Vec::new(),
                sandbox_id: Some(first.sandbox_id.clone()),
            })
            .await
            .unwrap();
        wait_for_started(&mut second).await;
        assert_eq!(first.sandbox_id, second.sandbox_id);
        assert_eq!(manager.list_active().len(), 1);

        manager.stop(&first.id).await.unwrap();
        loop {
            match first.events.recv().await {
                Some(SessionEvent::Exited { .. }) | None => break,
                Some(_) => {}
            }
        }
        // Sandbox survives while the second session is attached
        assert_eq!(manager.list_active().len(), 1);
        assert_eq!(
            backend
                .recorded_calls()
                .iter()
                .filter(|c| c.starts_with("destroy"))
                .count(),
            0
        );

        manager.stop(&second.id).await.unwrap();
        loop {
            match second.events.recv().await {
                Some(SessionEvent::Exited { .. }) | None => break,
                Some(_) => {}
            }
        }
        assert!(manager.list_active().is_empty());
        assert_eq!(
            backend
                .recorded_calls()
                .iter()
                .filter(|c| c.starts_with("destroy"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn non_multiplexing_backend_rejects_second_attach() {
        let (manager, _backend) = manager_with(MockBackend::single_attach());

        let mut first = manager.start_session(SessionRequest::default()).await.unwrap();
        wait_for_started(&mut first).await;

        let err = manager
            .start_session(SessionRequest {
                files: Vec::new(),
                sandbox_id: Some(first.sandbox_id.clone()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyAttached(_)));
        // The reused sandbox was not torn down by the failed attach
        assert_eq!(manager.list_active().len(), 1);
    }

    #[tokio::test]
    async fn unknown_session_ids_error() {
        let (manager, _backend) = manager_with(MockBackend::new());
        assert!(matches!(
            manager.send_input("ghost", b"x".to_vec()).await,
            Err(SandboxError::SessionNotFound(_))
        ));
        assert!(matches!(
            manager.resize("ghost", 1, 1).await,
            Err(SandboxError::SessionNotFound(_))
        ));
        assert!(matches!(
            manager.stop("ghost").await,
            Err(SandboxError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_session_file_path_consumes_nothing() {
        let (manager, backend) = manager_with(MockBackend::new());
        let err = manager
            .start_session(SessionRequest {
                files: vec![SourceFile {
                    path: "../escape.txt".into(),
                    content: "x".into(),
                }],
                sandbox_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidPath(_)));
        assert!(backend.recorded_calls().is_empty());
        assert!(manager.list_active().is_empty());
    }

    #[tokio::test]
    async fn shutdown_sweep_destroys_everything() {
        let (manager, backend) = manager_with(MockBackend::new());

        let mut handle = manager.start_session(SessionRequest::default()).await.unwrap();
        wait_for_started(&mut handle).await;
        assert_eq!(manager.list_active().len(), 1);

        manager.shutdown().await;
        assert!(manager.list_active().is_empty());
        assert!(backend
            .recorded_calls()
            .iter()
            .any(|c| c.starts_with("destroy")));
    }

    #[tokio::test]
    async fn run_shell_end_to_end() {
        let manager = SandboxManager::with_process_backend(ManagerConfig::default());
        let result = manager
            .run(&ExecutionRequest {
                files: vec![SourceFile {
                    path: "main.sh".into(),
                    content: "echo hi".into(),
                }],
                language: "shell".into(),
                timeout_ms: Some(10_000),
            })
            .await
            .unwrap();
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(manager.list_active().is_empty());
    }

    #[tokio::test]
    async fn run_shell_timeout_fidelity() {
        let manager = SandboxManager::with_process_backend(ManagerConfig::default());
        let started = std::time::Instant::now();
        let result = manager
            .run(&ExecutionRequest {
                files: vec![SourceFile {
                    path: "main.sh".into(),
                    content: "sleep 5".into(),
                }],
                language: "shell".into(),
                timeout_ms: Some(50),
            })
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(result.exit_code, None);
        assert!(result.stderr.contains(crate::pipeline::TIMEOUT_MARKER));
        assert!(manager.list_active().is_empty());
    }

    #[tokio::test]
    async fn run_python_hello_world() {
        // Needs a python3 on PATH; opt in the way the backend tests do
        if std::env::var("RUNBOX_EXEC_TESTS").is_err() {
            return;
        }
        let manager = SandboxManager::with_process_backend(ManagerConfig::default());
        let result = manager.run(&python_request()).await.unwrap();
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn capacity_error_is_structured() {
        let backend = Arc::new(MockBackend::new());
        let config = ManagerConfig {
            max_sandboxes: 1,
            ..ManagerConfig::default()
        };
        let manager = SandboxManager::new(config, Arc::clone(&backend) as Arc<dyn ExecutionBackend>);

        let mut handle = manager.start_session(SessionRequest::default()).await.unwrap();
        wait_for_started(&mut handle).await;

        let err = manager.run(&python_request()).await.unwrap_err();
        assert!(matches!(err, SandboxError::CapacityExceeded { limit: 1 }));
        assert!(err.is_retryable());
    }
}
