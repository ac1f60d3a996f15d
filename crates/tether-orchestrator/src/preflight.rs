//! Machine readiness checks
//!
//! Checks run in a fixed order. Only an unreachable machine short-circuits
//! the run; every other check is isolated, so one failing probe still
//! produces a full report.

use std::sync::Arc;

use tether_core::api::{CheckStatus, DashboardEvent, PreflightCheck, PreflightReport};
use tether_core::error::SshError;
use tether_core::time::current_time_millis;
use tether_core::traits::CredentialStore;
use tether_core::types::MachineId;

use crate::events::EventBroadcaster;
use crate::hooks::HookInstaller;
use crate::ssh::{shell_quote, ExecOptions, MachineRegistry, RemoteExecutor};

pub const CHECK_SSH: &str = "ssh";
pub const CHECK_ASSISTANT: &str = "claude-cli";
pub const CHECK_TOOLS: &str = "tools";
pub const CHECK_KEYCHAIN: &str = "keychain";

pub struct PreflightRunner {
    registry: Arc<MachineRegistry>,
    exec: Arc<dyn RemoteExecutor>,
    hooks: Arc<HookInstaller>,
    keychain: Arc<dyn CredentialStore>,
    events: EventBroadcaster,
    /// Binary probed by the assistant check
    assistant_binary: String,
}

impl PreflightRunner {
    pub fn new(
        registry: Arc<MachineRegistry>,
        exec: Arc<dyn RemoteExecutor>,
        hooks: Arc<HookInstaller>,
        keychain: Arc<dyn CredentialStore>,
        events: EventBroadcaster,
        assistant_command: Option<&str>,
    ) -> Self {
        let assistant_binary = assistant_command
            .and_then(|c| c.split_whitespace().next())
            .unwrap_or("claude")
            .to_string();

        Self {
            registry,
            exec,
            hooks,
            keychain,
            events,
            assistant_binary,
        }
    }

    /// Run every check against `machine_id` and broadcast the report
    pub async fn run_all_checks(&self, machine_id: &MachineId) -> Result<PreflightReport, SshError> {
        let machine = self
            .registry
            .get(machine_id)
            .ok_or_else(|| SshError::MachineNotFound(machine_id.to_string()))?;

        tracing::info!("Running preflight for {}", machine_id);

        let ssh = self.check_ssh(machine_id).await;
        let checks = if ssh.status == CheckStatus::Fail {
            let reason = "Skipped: SSH unreachable";
            vec![
                ssh,
                PreflightCheck::new(CHECK_ASSISTANT, CheckStatus::Skip, reason),
                PreflightCheck::new(CHECK_TOOLS, CheckStatus::Skip, reason),
                PreflightCheck::new(CHECK_KEYCHAIN, CheckStatus::Skip, reason),
            ]
        } else {
            vec![
                ssh,
                self.check_assistant(machine_id).await,
                self.check_tools(machine_id).await,
                self.check_keychain(machine_id, machine.key_path.is_some()).await,
            ]
        };

        let report = PreflightReport::from_checks(machine_id.clone(), checks, current_time_millis());
        tracing::info!("Preflight for {}: {:?}", machine_id, report.overall);

        self.events.emit(DashboardEvent::MachinePreflight {
            report: report.clone(),
        });
        Ok(report)
    }

    async fn check_ssh(&self, machine_id: &MachineId) -> PreflightCheck {
        match self.exec.test_connection(machine_id).await {
            Ok(test) if test.reachable => PreflightCheck::new(
                CHECK_SSH,
                CheckStatus::Pass,
                format!("Connected in {}ms", test.latency_ms.unwrap_or(0)),
            ),
            Ok(test) => PreflightCheck::new(
                CHECK_SSH,
                CheckStatus::Fail,
                test.error.unwrap_or_else(|| "Unreachable".to_string()),
            ),
            Err(e) => PreflightCheck::new(CHECK_SSH, CheckStatus::Fail, e.to_string()),
        }
    }

    async fn check_assistant(&self, machine_id: &MachineId) -> PreflightCheck {
        let bin = shell_quote(&self.assistant_binary);
        let command = format!(
            "command -v {bin} >/dev/null 2>&1 && {bin} --version 2>/dev/null | head -n 1"
        );

        match self
            .exec
            .execute_command(machine_id, &command, ExecOptions::default())
            .await
        {
            Ok(output) if output.success() => {
                let version = output.stdout.trim();
                let message = if version.is_empty() {
                    format!("{} installed", self.assistant_binary)
                } else {
                    format!("{} {}", self.assistant_binary, version)
                };
                PreflightCheck::new(CHECK_ASSISTANT, CheckStatus::Pass, message)
            }
            Ok(_) => PreflightCheck::new(
                CHECK_ASSISTANT,
                CheckStatus::Fail,
                format!("{} not found in PATH", self.assistant_binary),
            ),
            Err(e) => {
                tracing::warn!("Assistant check on {} failed: {}", machine_id, e);
                PreflightCheck::new(CHECK_ASSISTANT, CheckStatus::Fail, e.to_string())
            }
        }
    }

    async fn check_tools(&self, machine_id: &MachineId) -> PreflightCheck {
        match self.hooks.check_required_tools(machine_id).await {
            Ok(report) if report.missing.is_empty() => PreflightCheck::new(
                CHECK_TOOLS,
                CheckStatus::Pass,
                format!("All tools available ({})", report.available.join(", ")),
            ),
            Ok(report) => PreflightCheck::new(
                CHECK_TOOLS,
                CheckStatus::Warn,
                format!("Missing: {}", report.missing.join(", ")),
            ),
            Err(e) => {
                tracing::warn!("Tool check on {} failed: {}", machine_id, e);
                PreflightCheck::new(CHECK_TOOLS, CheckStatus::Warn, format!("Could not probe tools: {}", e))
            }
        }
    }

    async fn check_keychain(&self, machine_id: &MachineId, uses_key: bool) -> PreflightCheck {
        if uses_key {
            return PreflightCheck::new(CHECK_KEYCHAIN, CheckStatus::Skip, "Key-based authentication");
        }

        let status = self.keychain.get_status(machine_id).await;
        match (status.has_password, status.unlocked) {
            (true, true) => PreflightCheck::new(CHECK_KEYCHAIN, CheckStatus::Pass, "Password unlocked"),
            (true, false) => PreflightCheck::new(
                CHECK_KEYCHAIN,
                CheckStatus::Warn,
                "Stored password is locked",
            ),
            (false, _) => PreflightCheck::new(
                CHECK_KEYCHAIN,
                CheckStatus::Warn,
                "No key path or stored password; relying on default keys",
            ),
        }
    }
}
