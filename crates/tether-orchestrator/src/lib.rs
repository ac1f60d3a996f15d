//! tether-orchestrator: local daemon driving remote assistant instances
//!
//! Runs terminal sessions (local pty or SSH shell), keeps one reference
//! counted reverse tunnel per remote machine so hooks there can call back,
//! installs those hooks, runs machine preflight checks and pushes every
//! state change to dashboard clients.

pub mod api;
pub mod events;
pub mod hooks;
pub mod keychain;
pub mod lifecycle;
pub mod preflight;
pub mod session;
pub mod ssh;
pub mod state;
pub mod store;
pub mod testsupport;
pub mod tunnel;

pub use events::EventBroadcaster;
pub use lifecycle::InstanceController;
pub use state::{Collaborators, OrchestratorState};
