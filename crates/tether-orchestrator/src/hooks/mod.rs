//! Remote lifecycle hook management

pub mod document;
mod installer;
mod remote_files;

pub use document::{HookCheck, HookState, HookVerification, VerificationStatus};
pub use installer::{ExistingHooks, HookInstaller, InstallOutcome, ToolReport, UninstallOutcome};
pub use remote_files::{RemoteFiles, SshRemoteFiles};
