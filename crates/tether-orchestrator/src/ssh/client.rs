//! Outbound SSH client
//!
//! Opens authenticated russh connections to remote machines. The same
//! handler serves reverse forwards: connections the remote side accepts on a
//! forwarded port are piped into the local orchestrator listener.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::Channel;
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::TcpStream;

use tether_core::error::SshError;
use tether_core::types::MachineId;

use super::registry::SshConfig;

/// Handle to an authenticated connection
pub type SshHandle = Handle<ClientHandler>;

/// Interval between SSH keepalives on long-lived connections
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Key files tried when a machine has neither a key path nor a password
const DEFAULT_KEY_FILES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// russh client handler for one remote machine
pub struct ClientHandler {
    machine_id: MachineId,
    /// Pinned server key fingerprint
    expected_host_key: Option<String>,
    /// Local address that forwarded connections are piped to
    forward_target: Option<String>,
}

impl ClientHandler {
    fn new(
        machine_id: MachineId,
        expected_host_key: Option<String>,
        forward_target: Option<String>,
    ) -> Self {
        Self {
            machine_id,
            expected_host_key,
            forward_target,
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();

        match &self.expected_host_key {
            Some(expected) if *expected != fingerprint => {
                tracing::warn!(
                    "Host key mismatch for {}: expected {}, got {}",
                    self.machine_id,
                    expected,
                    fingerprint
                );
                Ok(false)
            }
            Some(_) => {
                tracing::debug!("Host key for {} matches pinned fingerprint", self.machine_id);
                Ok(true)
            }
            None => {
                tracing::debug!("Host key for {}: {}", self.machine_id, fingerprint);
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(target) = self.forward_target.clone() else {
            tracing::warn!(
                "Unexpected forwarded connection on {}:{} from {}",
                connected_address,
                connected_port,
                self.machine_id
            );
            let _ = channel.close().await;
            return Ok(());
        };

        tracing::debug!(
            "Forwarded connection {}:{} -> {} (from {}:{})",
            connected_address,
            connected_port,
            target,
            originator_address,
            originator_port
        );

        let machine_id = self.machine_id.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&target).await {
                Ok(mut socket) => {
                    let mut stream = channel.into_stream();
                    if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
                        tracing::debug!("Forwarded connection from {} ended: {}", machine_id, e);
                    }
                }
                Err(e) => {
                    tracing::warn!("Forward target {} unreachable: {}", target, e);
                    let _ = channel.close().await;
                }
            }
        });

        Ok(())
    }
}

/// Open and authenticate a connection within `timeout`.
///
/// `forward_target` is only needed for connections that carry reverse forwards.
pub async fn connect(
    config: &SshConfig,
    timeout: Duration,
    forward_target: Option<String>,
) -> Result<SshHandle, SshError> {
    let key = load_key(config)?;

    within(
        timeout,
        format!("connect to {}", config.address()),
        connect_inner(config, key, forward_target),
    )
    .await?
}

/// Await `fut` for at most `after`, reporting expiry as [`SshError::Timeout`]
pub async fn within<F: Future>(
    after: Duration,
    operation: impl Into<String>,
    fut: F,
) -> Result<F::Output, SshError> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| SshError::Timeout {
            operation: operation.into(),
            after,
        })
}

async fn connect_inner(
    config: &SshConfig,
    key: Option<KeyPair>,
    forward_target: Option<String>,
) -> Result<SshHandle, SshError> {
    let ssh_config = Arc::new(client::Config {
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        ..Default::default()
    });

    let handler = ClientHandler::new(
        config.machine_id.clone(),
        config.host_key.clone(),
        forward_target,
    );

    tracing::debug!("Connecting to {}@{}", config.username, config.address());
    let mut session = client::connect(ssh_config, config.address(), handler)
        .await
        .map_err(|e| {
            let err_str = e.to_string();
            if err_str.contains("Unknown server key") || err_str.contains("server key") {
                return SshError::ConnectionFailed(format!(
                    "host key for {} was rejected",
                    config.address()
                ));
            }
            SshError::ConnectionFailed(format!("{}: {}", config.address(), err_str))
        })?;

    let authenticated = match (key, &config.password) {
        (Some(key), _) => session
            .authenticate_publickey(&config.username, Arc::new(key))
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("authentication error: {}", e)))?,
        (None, Some(password)) => session
            .authenticate_password(&config.username, password)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("authentication error: {}", e)))?,
        (None, None) => {
            return Err(SshError::Misconfigured(format!(
                "no private key or unlocked password for {}",
                config.machine_id
            )))
        }
    };

    if !authenticated {
        return Err(SshError::AuthenticationFailed(format!(
            "{}@{}",
            config.username,
            config.address()
        )));
    }

    tracing::debug!("Authenticated to {}", config.machine_id);
    Ok(session)
}

/// Load the configured key, or a default key when no password is available
fn load_key(config: &SshConfig) -> Result<Option<KeyPair>, SshError> {
    let path = match &config.key_path {
        Some(path) => {
            if !path.exists() {
                return Err(SshError::Misconfigured(format!(
                    "private key not found at {}",
                    path.display()
                )));
            }
            path.clone()
        }
        None if config.password.is_some() => return Ok(None),
        None => match default_key_path() {
            Some(path) => path,
            None => return Ok(None),
        },
    };

    russh_keys::load_secret_key(&path, None)
        .map(Some)
        .map_err(|e| {
            SshError::Misconfigured(format!("failed to load key {}: {}", path.display(), e))
        })
}

fn default_key_path() -> Option<PathBuf> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    DEFAULT_KEY_FILES
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_within_reports_stalled_step() {
        let err = within(
            Duration::from_secs(5),
            "channel open on m",
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            SshError::Timeout { ref operation, after }
                if operation == "channel open on m" && after == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn test_within_passes_through_result() {
        let value = within(Duration::from_secs(5), "noop", async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    fn config(key_path: Option<PathBuf>, password: Option<&str>) -> SshConfig {
        SshConfig {
            machine_id: MachineId::new("m"),
            host: "127.0.0.1".into(),
            port: 22,
            username: "ops".into(),
            key_path,
            password: password.map(String::from),
            host_key: None,
        }
    }

    #[test]
    fn test_missing_key_file_is_misconfiguration() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(Some(dir.path().join("absent_key")), None);
        assert!(matches!(load_key(&cfg), Err(SshError::Misconfigured(_))));
    }

    #[test]
    fn test_garbage_key_file_is_misconfiguration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_bad");
        std::fs::write(&path, "not a key").unwrap();
        assert!(matches!(
            load_key(&config(Some(path), None)),
            Err(SshError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_password_only_needs_no_key() {
        assert!(matches!(load_key(&config(None, Some("pw"))), Ok(None)));
    }
}
