//! Error types for the deployment toolkit.
//!
//! [`DeployError`] covers every fallible library operation: HTTP calls to the
//! release service, process execution, filesystem work, and platform
//! adapters. [`RegistrationError`] names the reason a registration run ended.

use thiserror::Error;

/// Result type alias using [`DeployError`].
pub type Result<T> = std::result::Result<T, DeployError>;

/// Errors that can occur during deployment operations.
#[derive(Debug, Error)]
pub enum DeployError {
    /// HTTP request or response error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The release service answered with a non-success status.
    #[error("Release service returned {status}: {message}")]
    ReleaseService {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// No installable release was found.
    #[error("No installable release: {0}")]
    ReleaseUnavailable(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operating system facility failed (service manager, event log, registry).
    #[error("Platform error: {0}")]
    Platform(String),

    /// An external program could not be launched or misbehaved.
    #[error("Process error: {0}")]
    Process(String),

    /// An operation exceeded its time budget.
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// Budget that elapsed.
        seconds: u64,
    },

    /// Package installation failed.
    #[error("Installer exited with code {exit_code}")]
    Install {
        /// Installer exit code.
        exit_code: i32,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Create a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a platform error with the given message.
    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform(msg.into())
    }

    /// Create a process error with the given message.
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a release service error with status and message.
    pub fn release_service(status: u16, message: impl Into<String>) -> Self {
        Self::ReleaseService {
            status,
            message: message.into(),
        }
    }

    /// Create a release-unavailable error.
    pub fn release_unavailable(msg: impl Into<String>) -> Self {
        Self::ReleaseUnavailable(msg.into())
    }

    /// Create an installer failure error.
    pub fn install(exit_code: i32) -> Self {
        Self::Install { exit_code }
    }

    /// Returns true if this is a 404 from the release service.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ReleaseService { status: 404, .. })
    }
}

/// Reason a registration run ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Network prerequisites failed twice; no attempts were spent.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The client daemon never answered, even after a service restart.
    #[error("Daemon not ready after {waited_seconds}s")]
    DaemonNotReady {
        /// Total seconds spent waiting.
        waited_seconds: u64,
    },

    /// Management endpoint unreachable or conflicting prior registration.
    #[error("Prerequisite failed: {0}")]
    PrerequisiteFailed(String),

    /// Clearing local client state failed on a non-fresh install.
    #[error("State reset failed")]
    ResetFailed,

    /// Attempts exhausted or a recovery step gave up.
    #[error("Registration failed after {attempts} attempt(s): {reason}")]
    RegistrationAttemptFailed {
        /// Attempts made.
        attempts: u32,
        /// Last failure description.
        reason: String,
    },

    /// The join command succeeded but connectivity was never confirmed.
    #[error("Verification failed after {attempts} attempt(s)")]
    VerificationFailed {
        /// Attempts made.
        attempts: u32,
    },
}
