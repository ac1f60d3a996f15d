//! Pool of authenticated SSH connections, one per machine
//!
//! One-shot commands and remote shells open their own channel on the pooled
//! connection, so operations against the same machine run in parallel
//! without sharing channel state.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use tether_core::error::SshError;
use tether_core::types::MachineId;

use super::client::{self, SshHandle};
use super::registry::SshConfig;

type Slot = Arc<Mutex<Option<Arc<SshHandle>>>>;

pub struct ConnectionPool {
    /// Connections indexed by machine ID; the mutex serializes connects
    connections: DashMap<MachineId, Slot>,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            connect_timeout,
        }
    }

    /// Deadline applied to connects and session setup on pooled connections
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn slot(&self, machine_id: &MachineId) -> Slot {
        self.connections
            .entry(machine_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Return the live pooled connection, connecting if there is none
    pub async fn get_or_connect(&self, config: &SshConfig) -> Result<Arc<SshHandle>, SshError> {
        let slot = self.slot(&config.machine_id);
        let mut guard = slot.lock().await;

        if let Some(handle) = guard.as_ref() {
            if !handle.is_closed() {
                return Ok(Arc::clone(handle));
            }
            tracing::debug!("Pooled connection to {} is closed, reconnecting", config.machine_id);
        }

        let handle = Arc::new(client::connect(config, self.connect_timeout, None).await?);
        *guard = Some(Arc::clone(&handle));
        tracing::info!("Opened pooled SSH connection to {}", config.machine_id);
        Ok(handle)
    }

    /// Drop the pooled connection for a machine
    pub async fn evict(&self, machine_id: &MachineId) {
        if let Some((_, slot)) = self.connections.remove(machine_id) {
            if let Some(handle) = slot.lock().await.take() {
                disconnect(&handle, machine_id).await;
            }
        }
    }

    /// Disconnect everything (shutdown)
    pub async fn close_all(&self) {
        let ids: Vec<MachineId> = self.connections.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.evict(&id).await;
        }
    }

    /// Number of machines with a pool slot
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

async fn disconnect(handle: &SshHandle, machine_id: &MachineId) {
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "closing", "en")
        .await
    {
        tracing::debug!("Disconnect from {} failed: {}", machine_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_evict_unknown_machine_is_noop() {
        let pool = ConnectionPool::new(Duration::from_secs(1));
        pool.evict(&MachineId::new("nobody")).await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_slot_empty() {
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let config = SshConfig {
            machine_id: MachineId::new("m"),
            host: "127.0.0.1".into(),
            port: 22,
            username: "ops".into(),
            key_path: Some(std::path::PathBuf::from("/nonexistent/key")),
            password: None,
            host_key: None,
        };

        let Err(err) = pool.get_or_connect(&config).await else {
            panic!("expected connect failure");
        };
        assert!(matches!(err, SshError::Misconfigured(_)));
        assert_eq!(pool.len(), 1);

        let slot = pool.slot(&config.machine_id);
        assert!(slot.lock().await.is_none());
    }
}
