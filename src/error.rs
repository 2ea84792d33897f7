//! Error types for the takeover engine
//!
//! Every failure is classified at the point it occurs: prerequisite and probe
//! failures abort before anything destructive happens, external tool failures
//! abort the install handoff, best-effort failures are logged and dropped.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for takeover operations
pub type Result<T> = std::result::Result<T, TakeoverError>;

/// Main error type for the takeover engine
#[derive(Error, Debug)]
pub enum TakeoverError {
    /// A required tool is absent or the process is not privileged
    #[error("Prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    /// A probe could not establish a fact the configuration depends on
    #[error("Probe failed: {0}")]
    ProbeFailure(String),

    /// Existing configuration conflicts with generated configuration.
    ///
    /// Never raised: an existing main configuration silently wins.
    #[error("Configuration conflict at {0}")]
    ConfigConflict(PathBuf),

    /// An external command exited unsuccessfully
    #[error("Command '{cmd}' failed with exit code {code}: {stderr}")]
    ExternalToolFailure {
        cmd: String,
        code: i32,
        stderr: String,
    },

    /// A cleanup step failed; only ever logged
    #[error("Best-effort step failed: {0}")]
    BestEffortFailure(String),

    /// Invalid environment or CLI configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Command output did not have the expected shape
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A value cannot be represented in the generated Nix text
    #[error("Cannot render configuration: {0}")]
    Render(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TakeoverError {
    /// Create a prerequisite error
    pub fn prerequisite<S: Into<String>>(msg: S) -> Self {
        Self::PrerequisiteMissing(msg.into())
    }

    /// Create a probe error
    pub fn probe<S: Into<String>>(msg: S) -> Self {
        Self::ProbeFailure(msg.into())
    }

    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a parse error
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a render error
    pub fn render<S: Into<String>>(msg: S) -> Self {
        Self::Render(msg.into())
    }

    /// Whether this error must abort the run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::BestEffortFailure(_) | Self::ConfigConflict(_))
    }

    /// Downgrade any error into a best-effort failure for logging
    pub fn best_effort(step: &str, err: TakeoverError) -> Self {
        Self::BestEffortFailure(format!("{}: {}", step, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TakeoverError::probe("no ESP");
        assert!(matches!(err, TakeoverError::ProbeFailure(_)));
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "Probe failed: no ESP");
    }

    #[test]
    fn test_best_effort_is_not_fatal() {
        let err = TakeoverError::best_effort("swapoff", TakeoverError::parse("bad"));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("swapoff"));
    }

    #[test]
    fn test_external_tool_failure() {
        let err = TakeoverError::ExternalToolFailure {
            cmd: "nix-channel --update".to_string(),
            code: 1,
            stderr: "unable to download".to_string(),
        };
        assert!(err.to_string().contains("nix-channel --update"));
        assert!(err.is_fatal());
    }
}
