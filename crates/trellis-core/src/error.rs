//! Error types for trellis-core

use std::fmt::Write;
use thiserror::Error;

use crate::identity::EntityKind;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for trellis-core
#[derive(Error, Debug)]
pub enum Error {
    /// A handle did not resolve to a live entity (stale ID, out-of-range alias)
    #[error("{kind} not found: {handle}")]
    NotFound { kind: EntityKind, handle: String },

    /// Operation not valid for the current tree shape
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A surface adapter capture/restore call failed
    #[error("surface {surface} adapter failure: {source}")]
    AdapterFailure {
        surface: String,
        #[source]
        source: AdapterError,
    },

    /// Malformed request
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller is not allowed to use the control socket
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Request exceeded the per-request timeout
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Snapshot save/restore errors
    #[error("Snapshot error: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] error.
    pub fn not_found(kind: EntityKind, handle: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            handle: handle.into(),
        }
    }

    /// Shorthand for a [`Error::InvalidState`] error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Stable error code used on the wire.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::AdapterFailure { .. } => "adapter_failure",
            Self::Protocol(_) | Self::Json(_) => "protocol_error",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Timeout(_) => "timeout",
            Self::Config(_) | Self::Persistence(_) | Self::Io(_) => "internal",
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::NotFound { kind, .. } => Some(
                Remediation::new(format!(
                    "List the current {kind}s and retry with a live id or alias."
                ))
                .command("Show hierarchy", "trellis tree --all")
                .alternative(
                    "Positional aliases like workspace:2 are recomputed on every call; prefer ids.",
                ),
            ),
            Self::PermissionDenied(_) => Some(
                Remediation::new("Connect as the user that owns the socket.")
                    .alternative("For automated tests start the host with --socket-mode allow-all."),
            ),
            Self::Timeout(_) => Some(
                Remediation::new("The host is busy or stalled; retry the request.")
                    .command("Check host", "trellis ping"),
            ),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) | Self::Persistence(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the snapshot directory exists and is writable."),
            ),
            _ => None,
        }
    }
}

/// Errors raised by a surface adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The captured state belongs to another surface variant
    #[error("capture kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// The runtime behind the surface is gone or stalled
    #[error("surface runtime unavailable: {0}")]
    Unavailable(String),

    /// The surface rejected the request
    #[error("{0}")]
    Rejected(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("failed to parse config: {0}")]
    ParseFailed(String),

    #[error("invalid config value: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Make sure {path} exists and is readable."))
                    .alternative("Remove --config to fall back to built-in defaults.")
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Compare against the defaults documented in the README."),
            Self::ValidationError(_) => {
                Remediation::new("Correct the reported value and restart the host.")
            }
        }
    }
}
