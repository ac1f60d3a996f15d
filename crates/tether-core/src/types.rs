//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Unique identifier for a remote machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl MachineId {
    /// Create a new machine ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Generate a fresh random ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the assistant inside an instance is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Waiting for a prompt
    Idle,
    /// Processing a prompt
    Working,
    /// Blocked on the operator (permission prompt, notification)
    Awaiting,
    Error,
    /// Backend session is gone
    Disconnected,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Idle => write!(f, "idle"),
            InstanceStatus::Working => write!(f, "working"),
            InstanceStatus::Awaiting => write!(f, "awaiting"),
            InstanceStatus::Error => write!(f, "error"),
            InstanceStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Where an instance executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    Local,
    Remote,
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTarget::Local => write!(f, "local"),
            ExecutionTarget::Remote => write!(f, "remote"),
        }
    }
}

/// Mechanism backing a terminal session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local pseudo-terminal
    LocalPty,
    /// Interactive shell over an SSH channel
    SshShell,
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 120, rows: 32 }
    }
}

/// A managed interactive CLI session
///
/// `machine_id` is set if and only if `machine_type` is [`ExecutionTarget::Remote`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub working_dir: String,
    pub status: InstanceStatus,
    pub machine_type: ExecutionTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<MachineId>,
    /// Local process id, when the backend exposes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub pinned: bool,
    pub display_order: i64,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<u64>,
}

impl Instance {
    pub fn is_remote(&self) -> bool {
        self.machine_type == ExecutionTarget::Remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

/// Last observed reachability of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Unknown => write!(f, "unknown"),
            Reachability::Reachable => write!(f, "reachable"),
            Reachability::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A registered SSH endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMachine {
    pub id: MachineId,
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default, alias = "key_path")]
    pub key_path: Option<PathBuf>,
    /// Pinned server key fingerprint
    #[serde(default, alias = "host_key")]
    pub host_key: Option<String>,
    #[serde(default)]
    pub reachability: Reachability,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_username() -> String {
    whoami::username()
}

impl RemoteMachine {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, username: impl Into<String>) -> Self {
        let id = MachineId::new(id);
        Self {
            name: id.to_string(),
            id,
            hostname: hostname.into(),
            port: default_ssh_port(),
            username: username.into(),
            key_path: None,
            host_key: None,
            reachability: Reachability::Unknown,
        }
    }

    /// `user@host:port`, used in log lines
    pub fn destination(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}
