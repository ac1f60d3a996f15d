//! In-process credential store
//!
//! Holds machine passwords in memory for the lifetime of the daemon. A
//! password is only handed out after the machine has been unlocked.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use tether_core::traits::CredentialStore;
use tether_core::types::MachineId;

#[derive(Default)]
pub struct MemoryKeychain {
    passwords: DashMap<MachineId, String>,
    unlocked: DashSet<MachineId>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) a password; the machine stays locked
    pub fn store_password(&self, machine_id: &MachineId, password: &str) {
        self.passwords.insert(machine_id.clone(), password.to_string());
    }

    pub fn forget(&self, machine_id: &MachineId) {
        self.passwords.remove(machine_id);
        self.unlocked.remove(machine_id);
    }
}

#[async_trait]
impl CredentialStore for MemoryKeychain {
    async fn has_password(&self, machine_id: &MachineId) -> bool {
        self.passwords.contains_key(machine_id)
    }

    async fn get_password(&self, machine_id: &MachineId) -> Option<String> {
        if !self.unlocked.contains(machine_id) {
            return None;
        }
        self.passwords.get(machine_id).map(|p| p.clone())
    }

    async fn is_unlocked(&self, machine_id: &MachineId) -> bool {
        self.unlocked.contains(machine_id)
    }

    async fn mark_unlocked(&self, machine_id: &MachineId) {
        self.unlocked.insert(machine_id.clone());
    }

    async fn mark_locked(&self, machine_id: &MachineId) {
        self.unlocked.remove(machine_id);
    }

    async fn unlock_with_verification(&self, machine_id: &MachineId, password: &str) -> bool {
        let matches = match self.passwords.get(machine_id) {
            Some(stored) => stored.as_str() == password,
            // First unlock stores the password
            None => {
                self.passwords.insert(machine_id.clone(), password.to_string());
                true
            }
        };

        if matches {
            self.unlocked.insert(machine_id.clone());
        } else {
            tracing::warn!("Keychain unlock rejected for {}", machine_id);
        }
        matches
    }
}
