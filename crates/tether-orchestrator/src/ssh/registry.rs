//! Machine registry and connection parameter resolution

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use tether_core::error::SshError;
use tether_core::traits::CredentialStore;
use tether_core::types::{MachineId, Reachability, RemoteMachine};

/// Everything needed to open an SSH connection to one machine
#[derive(Clone)]
pub struct SshConfig {
    pub machine_id: MachineId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: Option<PathBuf>,
    /// Only set when the keychain holds an unlocked password
    pub password: Option<String>,
    pub host_key: Option<String>,
}

impl SshConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("machine_id", &self.machine_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Registered remote machines, looked up by id
///
/// Instances reference machines by id only; removing a machine never
/// touches instances that point at it.
pub struct MachineRegistry {
    machines: DashMap<MachineId, RemoteMachine>,
    keychain: Arc<dyn CredentialStore>,
}

impl MachineRegistry {
    pub fn new(keychain: Arc<dyn CredentialStore>) -> Self {
        Self {
            machines: DashMap::new(),
            keychain,
        }
    }

    /// Seed the registry from statically configured machines
    pub fn with_machines(
        machines: impl IntoIterator<Item = RemoteMachine>,
        keychain: Arc<dyn CredentialStore>,
    ) -> Self {
        let registry = Self::new(keychain);
        for machine in machines {
            registry.register(machine);
        }
        registry
    }

    /// Insert or replace a machine
    pub fn register(&self, machine: RemoteMachine) {
        tracing::info!("Registered machine {} ({})", machine.id, machine.destination());
        self.machines.insert(machine.id.clone(), machine);
    }

    pub fn remove(&self, machine_id: &MachineId) -> Option<RemoteMachine> {
        self.machines.remove(machine_id).map(|(_, m)| m)
    }

    pub fn get(&self, machine_id: &MachineId) -> Option<RemoteMachine> {
        self.machines.get(machine_id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<RemoteMachine> {
        let mut machines: Vec<_> = self.machines.iter().map(|r| r.clone()).collect();
        machines.sort_by(|a, b| a.id.cmp(&b.id));
        machines
    }

    pub fn contains(&self, machine_id: &MachineId) -> bool {
        self.machines.contains_key(machine_id)
    }

    pub fn set_reachability(&self, machine_id: &MachineId, reachability: Reachability) {
        if let Some(mut machine) = self.machines.get_mut(machine_id) {
            machine.reachability = reachability;
        }
    }

    /// Resolve connection parameters for a machine
    pub async fn resolve_config(&self, machine_id: &MachineId) -> Result<SshConfig, SshError> {
        let machine = self
            .get(machine_id)
            .ok_or_else(|| SshError::MachineNotFound(machine_id.to_string()))?;

        if machine.hostname.trim().is_empty() {
            return Err(SshError::Misconfigured(format!(
                "machine {} has no hostname",
                machine_id
            )));
        }

        let password = if self.keychain.is_unlocked(machine_id).await {
            self.keychain.get_password(machine_id).await
        } else {
            None
        };

        Ok(SshConfig {
            machine_id: machine.id.clone(),
            host: machine.hostname.clone(),
            port: machine.port,
            username: machine.username.clone(),
            key_path: machine.key_path.as_deref().map(expand_home),
            password,
            host_key: machine.host_key.clone(),
        })
    }
}

/// Expand a leading `~/` to the local home directory
pub fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        Err(_) => path.to_path_buf(),
    }
}
