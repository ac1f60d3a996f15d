//! Core error types for tether
//!
//! Each component has its own error enum. [`OrchestratorError`] is the
//! boundary taxonomy every request ends in; it knows its HTTP-style status
//! and a stable machine-readable code.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// SSH resolution, connection and command errors
#[derive(Error, Debug, Clone)]
pub enum SshError {
    /// No machine registered under this id
    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    /// Connection parameters are unusable (missing key file, bad host)
    #[error("SSH misconfiguration: {0}")]
    Misconfigured(String),

    /// The server rejected our credentials
    #[error("Authentication failed for {0}")]
    AuthenticationFailed(String),

    /// TCP or handshake failure
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A remote operation exceeded its budget
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Channel-level failure after the connection was established
    #[error("Channel error: {0}")]
    Channel(String),
}

/// Terminal session errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// No live session is registered for this instance
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// A session is already registered for this instance
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// The backend could not be started
    #[error("Failed to spawn session: {0}")]
    Spawn(String),

    /// The backend is gone and no longer accepts input
    #[error("Session closed: {0}")]
    Closed(String),
}

/// Reverse tunnel errors
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    /// The reverse forward could not be established
    #[error("Failed to create tunnel for {machine}: {reason}")]
    Creation { machine: String, reason: String },

    /// Every port in the configured range is taken
    #[error("No free tunnel port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },
}

/// Hook installation errors
#[derive(Error, Debug, Clone)]
pub enum HookError {
    /// Install did not complete; the remote file was left untouched
    #[error("Hook installation incomplete: {0}")]
    PartialInstall(String),

    /// The existing remote config is not valid JSON
    #[error("Remote hook config is malformed: {0}")]
    Malformed(String),

    /// Remote I/O failed
    #[error("Remote error: {0}")]
    Remote(#[from] SshError),
}

/// Persistence layer errors
#[derive(Error, Debug, Clone)]
#[error("Store error: {0}")]
pub struct StoreError(pub String);

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors surfaced at the orchestrator boundary
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    /// Caller input is missing or contradictory
    #[error("{0}")]
    Validation(String),

    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Local backend failed to start
    #[error("Failed to start session: {0}")]
    SessionSpawn(String),

    /// SSH backend failed to start
    #[error("Failed to connect to remote machine: {0}")]
    RemoteSpawn(String),

    #[error("{0}")]
    TunnelCreation(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    PartialInstall(String),

    /// Operation does not apply to this kind of instance
    #[error("{0}")]
    UnsupportedOperation(String),

    #[error("{0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

impl OrchestratorError {
    /// HTTP-style status for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::UnsupportedOperation(_) => 400,
            Self::MachineNotFound(_) | Self::InstanceNotFound(_) | Self::UnknownSession(_) => 404,
            Self::SessionSpawn(_)
            | Self::RemoteSpawn(_)
            | Self::TunnelCreation(_)
            | Self::Timeout(_)
            | Self::PartialInstall(_)
            | Self::Store(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::MachineNotFound(_) => "MACHINE_NOT_FOUND",
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::UnknownSession(_) => "UNKNOWN_SESSION",
            Self::SessionSpawn(_) => "SESSION_SPAWN_ERROR",
            Self::RemoteSpawn(_) => "REMOTE_SPAWN_ERROR",
            Self::TunnelCreation(_) => "TUNNEL_CREATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::PartialInstall(_) => "PARTIAL_INSTALL",
            Self::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
            Self::Store(_) => "STORE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<SshError> for OrchestratorError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::MachineNotFound(id) => Self::MachineNotFound(id),
            SshError::Timeout { .. } => Self::Timeout(err.to_string()),
            SshError::Misconfigured(_) => Self::Validation(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<SessionError> for OrchestratorError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::UnknownSession(id) => Self::UnknownSession(id),
            SessionError::Spawn(reason) => Self::SessionSpawn(reason),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<TunnelError> for OrchestratorError {
    fn from(err: TunnelError) -> Self {
        Self::TunnelCreation(err.to_string())
    }
}

impl From<HookError> for OrchestratorError {
    fn from(err: HookError) -> Self {
        match err {
            HookError::Remote(ssh) => ssh.into(),
            HookError::PartialInstall(_) | HookError::Malformed(_) => {
                Self::PartialInstall(err.to_string())
            }
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(OrchestratorError::validation("x").status_code(), 400);
        assert_eq!(
            OrchestratorError::UnsupportedOperation("local".into()).status_code(),
            400
        );
        assert_eq!(OrchestratorError::MachineNotFound("m".into()).status_code(), 404);
        assert_eq!(OrchestratorError::InstanceNotFound("i".into()).status_code(), 404);
        assert_eq!(OrchestratorError::RemoteSpawn("auth".into()).status_code(), 500);
        assert_eq!(OrchestratorError::Timeout("slow".into()).status_code(), 500);
    }

    #[test]
    fn test_remote_spawn_message() {
        let err = OrchestratorError::RemoteSpawn("Authentication failed".into());
        assert_eq!(
            err.to_string(),
            "Failed to connect to remote machine: Authentication failed"
        );
    }

    #[test]
    fn test_ssh_error_conversion() {
        let err: OrchestratorError = SshError::MachineNotFound("machine-123".into()).into();
        assert!(matches!(err, OrchestratorError::MachineNotFound(ref id) if id == "machine-123"));

        let err: OrchestratorError = SshError::Timeout {
            operation: "exec".into(),
            after: Duration::from_secs(3),
        }
        .into();
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[test]
    fn test_hook_error_conversion() {
        let err: OrchestratorError = HookError::PartialInstall("write failed".into()).into();
        assert_eq!(err.code(), "PARTIAL_INSTALL");

        let err: OrchestratorError =
            HookError::Remote(SshError::ConnectionFailed("refused".into())).into();
        assert_eq!(err.status_code(), 500);
    }
}
