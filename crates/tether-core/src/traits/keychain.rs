//! Keychain / credential store interface
//!
//! The orchestrator only looks capabilities up through this trait; how
//! passwords are encrypted at rest is the implementor's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::MachineId;

/// Credential state of one machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeychainStatus {
    pub has_password: bool,
    pub unlocked: bool,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Whether a password is stored for this machine
    async fn has_password(&self, machine_id: &MachineId) -> bool;

    /// The stored password, only while unlocked
    async fn get_password(&self, machine_id: &MachineId) -> Option<String>;

    async fn is_unlocked(&self, machine_id: &MachineId) -> bool;

    async fn mark_unlocked(&self, machine_id: &MachineId);

    async fn mark_locked(&self, machine_id: &MachineId);

    /// Unlock after verifying `password`; returns whether it was accepted
    async fn unlock_with_verification(&self, machine_id: &MachineId, password: &str) -> bool;

    async fn get_status(&self, machine_id: &MachineId) -> KeychainStatus {
        KeychainStatus {
            has_password: self.has_password(machine_id).await,
            unlocked: self.is_unlocked(machine_id).await,
        }
    }
}
