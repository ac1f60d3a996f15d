//! tether-core: Core abstractions and configuration for tether
//!
//! Shared domain types, error taxonomy, configuration, HTTP wire shapes and
//! the collaborator traits (keychain, instance store) used by the
//! orchestrator daemon.

pub mod api;
pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::OrchestratorError;
pub use types::{Instance, InstanceId, InstanceStatus, MachineId, RemoteMachine};
