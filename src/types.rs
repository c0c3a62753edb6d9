//! Value objects crossing the manager boundary.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// One source file in a run or session request. `path` is relative to the
/// sandbox workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// A one-shot execution request. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub files: Vec<SourceFile>,
    pub language: String,

    /// Run deadline in milliseconds. Clamped to the configured ceiling;
    /// `None` means the configured default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// The outcome of a one-shot run. Produced exactly once per request.
///
/// `exit_code` is `None` when the run was killed by its deadline; stderr then
/// carries a timeout marker so callers can tell a timeout from a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub sandbox_id: String,
}

/// What a live sandbox is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// One-shot execution owned by a pipeline run.
    Run,
    /// Interactive sandbox owned by one or more terminal sessions.
    Session,
}

/// One row of `list_active()`.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSandbox {
    pub id: String,
    pub kind: SandboxKind,
    #[serde(serialize_with = "epoch_ms")]
    pub started_at: SystemTime,
}

fn epoch_ms<S: serde::Serializer>(t: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let ms = t
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    serializer.serialize_u64(u64::try_from(ms).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_timeout_defaults_to_none() {
        let json = r#"{"files":[{"path":"main.py","content":"print(1)"}],"language":"python"}"#;
        let req: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert!(req.timeout_ms.is_none());
        assert_eq!(req.files.len(), 1);
        assert_eq!(req.language, "python");
    }

    #[test]
    fn result_serializes_null_exit_code() {
        let result = ExecutionResult {
            stdout: String::new(),
            stderr: "timed out".into(),
            exit_code: None,
            duration_ms: 52,
            sandbox_id: "sb-1".into(),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"exit_code\":null"));
    }
}
