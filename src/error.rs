// ============================================
// error.rs - Error types
// ============================================
//
// Native helpers (DISM, subst, registry, PowerShell) return anyhow errors
// with context. Everything that crosses the session surface is converted
// into one of the typed errors below so callers can tell a missing app
// name from a missing admin token from an I/O failure.
// ============================================

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ToolkitConfig;

/// Exit code used when a session fails for a reason the caller can't fix
/// by deferring (missing admin rights, unexpected failures).
pub const DEVICE_ERROR_EXIT_CODE: i32 = 60008;

/// Errors raised by the log sink.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("no valid log messages were provided to log")]
    NoMessages,

    #[error("log entry {field} cannot be empty")]
    EmptyField { field: &'static str },

    #[error("failed to write log file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write log output to the console: {0}")]
    Console(#[source] std::io::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse toolkit config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse JSON document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Errors surfaced by a deployment session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("the application name was not specified")]
    MissingAppName,

    #[error(
        "this deployment requires administrative permissions and the current user is not an \
         Administrator, or the process is not elevated"
    )]
    AdminRequired,

    #[error(
        "this deployment requires interactivity, however there are no suitable logged on users \
         available and this process is running non-interactively"
    )]
    NoInteractiveTarget,

    #[error("the current process is {process} on a {os} operating system")]
    WowProcess { process: String, os: String },

    #[error("this deployment session has already been closed")]
    AlreadyClosed,

    #[error("logging has not been initialized for this session")]
    NotInitialized,

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl SessionError {
    /// Exit code recorded on the session before it's closed because of this error.
    pub fn exit_code(&self, config: &ToolkitConfig) -> i32 {
        match self {
            SessionError::NoInteractiveTarget => config.ui.defer_exit_code,
            _ => DEVICE_ERROR_EXIT_CODE,
        }
    }

    /// Message written to the log when construction fails with this error.
    pub(crate) fn construction_message(&self) -> String {
        match self {
            SessionError::AdminRequired | SessionError::NoInteractiveTarget => self.to_string(),
            other => format!("Failure occurred while instantiating new deployment session: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_exit_code_mapping() {
        let config = testing::toolkit_config();
        assert_eq!(SessionError::AdminRequired.exit_code(&config), DEVICE_ERROR_EXIT_CODE);
        assert_eq!(SessionError::MissingAppName.exit_code(&config), DEVICE_ERROR_EXIT_CODE);
        assert_eq!(
            SessionError::NoInteractiveTarget.exit_code(&config),
            config.ui.defer_exit_code
        );
    }

    #[test]
    fn test_construction_message() {
        let msg = SessionError::AdminRequired.construction_message();
        assert!(msg.starts_with("this deployment requires administrative permissions"));

        let msg = SessionError::MissingAppName.construction_message();
        assert!(msg.starts_with("Failure occurred while instantiating new deployment session"));
    }
}
