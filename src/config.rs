//! Manager configuration.
//!
//! Defaults are suitable for local use; every knob can be overridden from a
//! JSON document or from `RUNBOX_*` environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration for the sandbox manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Global cap on concurrently live sandboxes (runs and sessions).
    pub max_sandboxes: usize,

    /// Default run deadline when a request does not carry one, milliseconds.
    pub default_timeout_ms: u64,

    /// Ceiling a request's `timeout_ms` is clamped to, milliseconds.
    pub max_timeout_ms: u64,

    /// How long a terminal session may sit idle before it is closed, seconds.
    pub session_idle_timeout_secs: u64,

    /// Maximum total lifetime of a terminal session, regardless of activity,
    /// seconds.
    pub session_max_lifetime_secs: u64,

    /// Grace window between the graceful-termination signal and the forced
    /// kill, milliseconds.
    pub kill_grace_ms: u64,

    /// Cap on captured stdout/stderr per run, bytes. Output past the cap is
    /// dropped and the result is marked truncated.
    pub max_output_bytes: usize,

    /// Shell argv for interactive sessions.
    pub shell: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sandboxes: default_max_sandboxes(),
            default_timeout_ms: 10_000,
            max_timeout_ms: 60_000,
            session_idle_timeout_secs: 1800,
            session_max_lifetime_secs: 4 * 3600,
            kill_grace_ms: 5_000,
            max_output_bytes: 1024 * 1024,
            shell: vec!["/bin/sh".to_string(), "-i".to_string()],
        }
    }
}

impl ManagerConfig {
    /// Load defaults, then apply `RUNBOX_*` environment overrides.
    ///
    /// Unset or unparsable variables fall back to the default value.
    pub fn from_env() -> Self {
        Self {
            max_sandboxes: env_parse("RUNBOX_MAX_SANDBOXES")
                .unwrap_or_else(default_max_sandboxes),
            default_timeout_ms: env_parse("RUNBOX_DEFAULT_TIMEOUT_MS").unwrap_or(10_000),
            max_timeout_ms: env_parse("RUNBOX_MAX_TIMEOUT_MS").unwrap_or(60_000),
            session_idle_timeout_secs: env_parse("RUNBOX_SESSION_IDLE_TIMEOUT").unwrap_or(1800),
            session_max_lifetime_secs: env_parse("RUNBOX_SESSION_MAX_LIFETIME")
                .unwrap_or(4 * 3600),
            ..Self::default()
        }
    }

    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse manager configuration")
    }

    /// Clamp a requested run timeout to the configured ceiling, falling back
    /// to the default when absent or zero.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = match requested_ms {
            Some(ms) if ms > 0 => ms.min(self.max_timeout_ms),
            _ => self.default_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub const fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub const fn session_max_lifetime(&self) -> Duration {
        Duration::from_secs(self.session_max_lifetime_secs)
    }

    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

const fn default_max_sandboxes() -> usize {
    5
}
