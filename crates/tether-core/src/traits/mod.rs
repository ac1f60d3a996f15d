//! Collaborator interfaces consumed by the orchestrator

mod keychain;
mod store;

pub use keychain::{CredentialStore, KeychainStatus};
pub use store::InstanceStore;
