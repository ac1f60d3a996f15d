//! Reverse SSH port forwards
//!
//! Each forward owns a dedicated SSH connection. The remote side listens on
//! the allocated port and every connection it accepts is piped back to the
//! orchestrator's HTTP listener.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tether_core::error::TunnelError;
use tether_core::types::MachineId;

use crate::ssh::{client, MachineRegistry, SshHandle};

/// A live reverse forward
#[async_trait]
pub trait ForwardHandle: Send + Sync {
    /// Whether the underlying connection is still up
    fn is_alive(&self) -> bool;

    /// Cancel the forward and drop the connection
    async fn close(self: Box<Self>);
}

/// Starts reverse forwards
#[async_trait]
pub trait ReverseForwarder: Send + Sync {
    async fn open(
        &self,
        machine_id: &MachineId,
        remote_port: u16,
    ) -> Result<Box<dyn ForwardHandle>, TunnelError>;
}

/// russh-backed forwarder
pub struct SshReverseForwarder {
    registry: Arc<MachineRegistry>,
    connect_timeout: Duration,
    /// Address the remote side binds
    bind_address: String,
    /// Local address forwarded connections are piped to
    local_target: String,
}

impl SshReverseForwarder {
    pub fn new(
        registry: Arc<MachineRegistry>,
        connect_timeout: Duration,
        bind_address: impl Into<String>,
        local_target: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            connect_timeout,
            bind_address: bind_address.into(),
            local_target: local_target.into(),
        }
    }
}

#[async_trait]
impl ReverseForwarder for SshReverseForwarder {
    async fn open(
        &self,
        machine_id: &MachineId,
        remote_port: u16,
    ) -> Result<Box<dyn ForwardHandle>, TunnelError> {
        let creation = |reason: String| TunnelError::Creation {
            machine: machine_id.to_string(),
            reason,
        };

        let config = self
            .registry
            .resolve_config(machine_id)
            .await
            .map_err(|e| creation(e.to_string()))?;

        let mut handle = client::connect(
            &config,
            self.connect_timeout,
            Some(self.local_target.clone()),
        )
        .await
        .map_err(|e| creation(e.to_string()))?;

        let requested = tokio::time::timeout(
            self.connect_timeout,
            handle.tcpip_forward(self.bind_address.clone(), u32::from(remote_port)),
        )
        .await;

        match requested {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(creation(format!(
                    "remote refused to listen on {}:{}: {}",
                    self.bind_address, remote_port, e
                )))
            }
            Err(_) => {
                return Err(creation(format!(
                    "forward request timed out after {:?}",
                    self.connect_timeout
                )))
            }
        }

        tracing::info!(
            "Reverse forward {}:{} on {} -> {}",
            self.bind_address,
            remote_port,
            machine_id,
            self.local_target
        );

        Ok(Box::new(SshForward {
            machine_id: machine_id.clone(),
            handle,
            bind_address: self.bind_address.clone(),
            port: remote_port,
        }))
    }
}

struct SshForward {
    machine_id: MachineId,
    handle: SshHandle,
    bind_address: String,
    port: u16,
}

#[async_trait]
impl ForwardHandle for SshForward {
    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self
            .handle
            .cancel_tcpip_forward(self.bind_address.clone(), u32::from(self.port))
            .await
        {
            tracing::debug!("cancel-tcpip-forward on {} failed: {}", self.machine_id, e);
        }
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
            .await;
        tracing::info!("Reverse forward on {}:{} closed", self.machine_id, self.port);
    }
}
