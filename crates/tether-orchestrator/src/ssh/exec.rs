//! One-shot remote command execution and reachability probes

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use serde::Serialize;

use tether_core::config::SshSettings;
use tether_core::error::SshError;
use tether_core::time::duration_millis;
use tether_core::types::{MachineId, Reachability};

use super::client;
use super::pool::ConnectionPool;
use super::registry::{MachineRegistry, SshConfig};

/// Per-call execution options
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// Overrides the configured command timeout
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server never reported an exit status
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Result of a reachability probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTest {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Machine-scoped remote execution, the seam hooks and preflight run through
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Open and authenticate without running anything.
    ///
    /// Ordinary network failure is reported as unreachable; only
    /// misconfiguration is an error.
    async fn test_connection(&self, machine_id: &MachineId) -> Result<ConnectionTest, SshError>;

    /// Run `command` to completion on its own channel
    async fn execute_command(
        &self,
        machine_id: &MachineId,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandOutput, SshError>;
}

/// russh-backed executor
pub struct SshExecutor {
    registry: Arc<MachineRegistry>,
    pool: Arc<ConnectionPool>,
    settings: SshSettings,
}

impl SshExecutor {
    pub fn new(registry: Arc<MachineRegistry>, pool: Arc<ConnectionPool>, settings: SshSettings) -> Self {
        Self {
            registry,
            pool,
            settings,
        }
    }

    /// Probe `config` with a fresh, unpooled connection
    pub async fn probe(&self, config: &SshConfig) -> Result<ConnectionTest, SshError> {
        let started = Instant::now();

        match client::connect(config, self.settings.probe_timeout, None).await {
            Ok(handle) => {
                let latency = duration_millis(started.elapsed());
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "probe", "en")
                    .await;
                tracing::debug!("{} reachable in {}ms", config.machine_id, latency);
                Ok(ConnectionTest {
                    reachable: true,
                    latency_ms: Some(latency),
                    error: None,
                })
            }
            Err(e @ SshError::Misconfigured(_)) => Err(e),
            Err(e) => {
                tracing::info!("{} unreachable: {}", config.machine_id, e);
                Ok(ConnectionTest {
                    reachable: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Run `command` on `config` with a hard deadline.
    ///
    /// On expiry the channel gets a KILL signal, EOF and close before the
    /// timeout is reported; the pooled connection stays usable.
    pub async fn run(
        &self,
        config: &SshConfig,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandOutput, SshError> {
        let budget = opts.timeout.unwrap_or(self.settings.command_timeout);
        let wrapped = if self.settings.remote_kill_guard {
            guard_command(command, budget)
        } else {
            command.to_string()
        };

        // One budget covers channel open, exec and output collection
        let deadline = tokio::time::Instant::now() + budget;
        let mut channel = client::within(
            budget,
            format!("command on {}", config.machine_id),
            self.start(config, wrapped),
        )
        .await??;
        tracing::debug!("exec on {}: {}", config.machine_id, command);

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, collect_output(&mut channel)).await {
            Ok(output) => {
                let _ = channel.close().await;
                Ok(output)
            }
            Err(_) => {
                tracing::warn!(
                    "Command on {} exceeded {:?}, terminating channel",
                    config.machine_id,
                    budget
                );
                terminate(&channel).await;
                Err(SshError::Timeout {
                    operation: format!("command on {}", config.machine_id),
                    after: budget,
                })
            }
        }
    }

    async fn start(&self, config: &SshConfig, command: String) -> Result<Channel<Msg>, SshError> {
        let channel = self.open_channel(config).await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::Channel(format!("exec failed: {}", e)))?;
        Ok(channel)
    }

    async fn open_channel(&self, config: &SshConfig) -> Result<Channel<Msg>, SshError> {
        let handle = self.pool.get_or_connect(config).await?;
        match handle.channel_open_session().await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                // Stale connection: reconnect once
                tracing::debug!("Channel open on {} failed ({}), reconnecting", config.machine_id, e);
                self.pool.evict(&config.machine_id).await;
                let handle = self.pool.get_or_connect(config).await?;
                handle
                    .channel_open_session()
                    .await
                    .map_err(|e| SshError::Channel(format!("channel open failed: {}", e)))
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn test_connection(&self, machine_id: &MachineId) -> Result<ConnectionTest, SshError> {
        let config = self.registry.resolve_config(machine_id).await?;
        let result = self.probe(&config).await?;

        let reachability = if result.reachable {
            Reachability::Reachable
        } else {
            Reachability::Unreachable
        };
        self.registry.set_reachability(machine_id, reachability);
        Ok(result)
    }

    async fn execute_command(
        &self,
        machine_id: &MachineId,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandOutput, SshError> {
        let config = self.registry.resolve_config(machine_id).await?;
        self.run(&config, command, opts).await
    }
}

async fn collect_output(channel: &mut Channel<Msg>) -> CommandOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    }
}

async fn terminate(channel: &Channel<Msg>) {
    if let Err(e) = channel.signal(russh::Sig::KILL).await {
        tracing::debug!("KILL signal request failed: {}", e);
    }
    let _ = channel.eof().await;
    let _ = channel.close().await;
}

/// Wrap `command` so the remote side kills it one second after `budget`
/// when `timeout(1)` is available there.
pub fn guard_command(command: &str, budget: Duration) -> String {
    let secs = budget.as_secs().max(1) + 1;
    let quoted = shell_quote(command);
    format!(
        "if command -v timeout >/dev/null 2>&1; then exec timeout -s KILL {secs} sh -c {quoted}; else exec sh -c {quoted}; fi"
    )
}

/// Single-quote `s` for POSIX shells
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// Shell expression for a remote path; relative and `~` paths resolve
/// against the remote `$HOME`
pub fn remote_path_expr(path: &str) -> String {
    if path == "~" {
        return r#""$HOME""#.to_string();
    }
    let relative = path.strip_prefix("~/").unwrap_or(path);
    if relative.starts_with('/') {
        shell_quote(relative)
    } else {
        format!(r#""$HOME"/{}"#, shell_quote(relative))
    }
}
