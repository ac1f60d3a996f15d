//! Backend abstraction for terminal sessions
//!
//! A backend is started once from a [`BackendSpec`] and from then on is
//! driven only through the channels in [`BackendIo`]. The manager never
//! needs to know which kind it is talking to.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use tether_core::error::SessionError;
use tether_core::types::{BackendKind, InstanceId, MachineId, TerminalSize};

use crate::ssh::{ConnectionPool, MachineRegistry};

use super::{local, remote};

/// Environment variable carrying the instance id into every session
pub const INSTANCE_ID_ENV: &str = "TETHER_INSTANCE_ID";

/// How to start a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    /// Local pseudo-terminal
    Local {
        working_dir: PathBuf,
        shell: Option<String>,
        startup_command: Option<String>,
        env: Vec<(String, String)>,
        size: TerminalSize,
    },
    /// Interactive shell on a remote machine
    Ssh {
        machine_id: MachineId,
        working_dir: String,
        startup_command: Option<String>,
        env: Vec<(String, String)>,
        size: TerminalSize,
    },
}

impl BackendSpec {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendSpec::Local { .. } => BackendKind::LocalPty,
            BackendSpec::Ssh { .. } => BackendKind::SshShell,
        }
    }
}

/// Input side of a running backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCommand {
    Data(Bytes),
    Resize(TerminalSize),
    Kill,
}

/// Why a backend stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendExit {
    pub code: Option<u32>,
    pub reason: String,
}

/// Channels connecting a running backend to its session
pub struct BackendIo {
    pub pid: Option<u32>,
    pub input: mpsc::Sender<BackendCommand>,
    pub output: mpsc::UnboundedReceiver<Bytes>,
    pub exit: oneshot::Receiver<BackendExit>,
}

/// Starts backends
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self, instance_id: &InstanceId, spec: &BackendSpec)
        -> Result<BackendIo, SessionError>;
}

/// Launcher for real local ptys and SSH shells
pub struct SystemLauncher {
    registry: Arc<MachineRegistry>,
    pool: Arc<ConnectionPool>,
}

impl SystemLauncher {
    pub fn new(registry: Arc<MachineRegistry>, pool: Arc<ConnectionPool>) -> Self {
        Self { registry, pool }
    }
}

#[async_trait]
impl BackendLauncher for SystemLauncher {
    async fn launch(
        &self,
        instance_id: &InstanceId,
        spec: &BackendSpec,
    ) -> Result<BackendIo, SessionError> {
        match spec {
            BackendSpec::Local {
                working_dir,
                shell,
                startup_command,
                env,
                size,
            } => {
                let working_dir = working_dir.clone();
                let shell = shell.clone();
                let startup_command = startup_command.clone();
                let env = env.clone();
                let size = *size;
                let instance_id = instance_id.clone();

                // openpty and fork are blocking
                tokio::task::spawn_blocking(move || {
                    local::spawn(
                        &instance_id,
                        &working_dir,
                        shell.as_deref(),
                        startup_command.as_deref(),
                        &env,
                        size,
                    )
                })
                .await
                .map_err(|e| SessionError::Spawn(format!("pty spawn task failed: {}", e)))?
            }
            BackendSpec::Ssh {
                machine_id,
                working_dir,
                startup_command,
                env,
                size,
            } => {
                let config = self
                    .registry
                    .resolve_config(machine_id)
                    .await
                    .map_err(|e| SessionError::Spawn(e.to_string()))?;
                let handle = self
                    .pool
                    .get_or_connect(&config)
                    .await
                    .map_err(|e| SessionError::Spawn(e.to_string()))?;

                remote::spawn(
                    instance_id,
                    &handle,
                    working_dir,
                    startup_command.as_deref(),
                    env,
                    *size,
                    self.pool.connect_timeout(),
                )
                .await
            }
        }
    }
}
