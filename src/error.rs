//! Error taxonomy surfaced to callers.
//!
//! Every public operation returns either a well-formed value or one of these
//! variants; raw backend errors never leak past the manager boundary.

use thiserror::Error;

/// Errors produced by the sandbox manager and its components.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The concurrency cap is full. Retryable by the caller after backoff.
    #[error("sandbox capacity exceeded (limit {limit})")]
    CapacityExceeded { limit: usize },

    /// The requested language has no dispatch entry.
    #[error("unsupported language: '{0}'")]
    UnsupportedLanguage(String),

    /// The file set is non-empty but contains no recognizable entry file.
    #[error("no entry file for language '{language}' in submitted files")]
    NoEntryFile { language: String },

    /// The request carried zero files.
    #[error("request contains no files")]
    EmptyFileSet,

    /// A file path would resolve outside the sandbox workspace.
    #[error("invalid path: '{0}' escapes the workspace")]
    InvalidPath(String),

    /// The backend failed to materialize an environment.
    #[error("failed to provision sandbox")]
    Provision(#[source] anyhow::Error),

    /// The backend failed mid-flight (write, exec, attach).
    #[error("sandbox backend error")]
    Backend(#[source] anyhow::Error),

    /// The session id is unknown or the session is already destroyed.
    #[error("session not found: '{0}'")]
    SessionNotFound(String),

    /// The sandbox already has a terminal bound and the backend cannot
    /// multiplex a second one.
    #[error("sandbox '{0}' already has an attached terminal")]
    AlreadyAttached(String),
}

impl SandboxError {
    /// Whether the caller may retry the operation as-is.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::Provision(_) | Self::Backend(_)
        )
    }

    /// Process exit code for the CLI shim. Stable 1:1 mapping onto the
    /// taxonomy so scripts can branch on the failure class.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::CapacityExceeded { .. } => 10,
            Self::UnsupportedLanguage(_) => 11,
            Self::NoEntryFile { .. } => 12,
            Self::EmptyFileSet => 13,
            Self::InvalidPath(_) => 14,
            Self::Provision(_) => 15,
            Self::Backend(_) => 16,
            Self::SessionNotFound(_) => 17,
            Self::AlreadyAttached(_) => 18,
        }
    }
}
