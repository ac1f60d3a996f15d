//! Wire shapes shared by the orchestrator HTTP API and its dashboard clients
//!
//! Requests and responses are JSON with camelCase keys. Broadcast events
//! carry a `type` tag such as `instance:created`.

use serde::{Deserialize, Serialize};

use crate::types::{ExecutionTarget, Instance, InstanceId, InstanceStatus, MachineId, Reachability};

/// `POST /api/instances`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub name: String,
    pub working_dir: String,
    pub machine_type: ExecutionTarget,
    #[serde(default)]
    pub machine_id: Option<MachineId>,
}

/// `PATCH /api/instances/{id}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInstanceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
}

/// `POST /api/instances/reorder`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderRequest {
    pub ids: Vec<InstanceId>,
}

/// `POST /api/instances/{id}/input`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

/// `POST /api/instances/{id}/resize`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /api/instances/{id}/hooks`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallHooksRequest {
    #[serde(default)]
    pub orchestrator_url: Option<String>,
}

/// What `ensureTunnel` did while installing hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelOutcome {
    Created,
    Reused,
    Failed,
}

/// Result of an install-hooks command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallHooksResponse {
    pub success: bool,
    pub message: String,
    pub tunnel: TunnelOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_port: Option<u16>,
    /// URL written into the remote hook commands
    pub hook_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    /// Tools the hooks need at run time that the remote lacks
    pub missing_tools: Vec<String>,
}

/// Result of an uninstall-hooks command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallHooksResponse {
    pub success: bool,
    pub message: String,
    /// Managed hook entries removed from the remote settings
    pub removed: usize,
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    #[default]
    None,
    Creating,
    Active,
    Closing,
    Closed,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::None => write!(f, "none"),
            TunnelState::Creating => write!(f, "creating"),
            TunnelState::Active => write!(f, "active"),
            TunnelState::Closing => write!(f, "closing"),
            TunnelState::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of one machine's tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub machine_id: MachineId,
    pub state: TunnelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub dependents: Vec<InstanceId>,
}

/// Outcome of a single preflight check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

/// Aggregate readiness of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightOverall {
    Ready,
    Warnings,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl PreflightCheck {
    pub fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }
}

/// Readiness report for one machine, recomputed on every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub machine_id: MachineId,
    pub checks: Vec<PreflightCheck>,
    pub overall: PreflightOverall,
    pub checked_at: u64,
}

impl PreflightReport {
    /// Build a report, deriving `overall` from the checks.
    ///
    /// Any `fail` blocks; otherwise any `warn` yields warnings.
    pub fn from_checks(machine_id: MachineId, checks: Vec<PreflightCheck>, checked_at: u64) -> Self {
        let overall = if checks.iter().any(|c| c.status == CheckStatus::Fail) {
            PreflightOverall::Blocked
        } else if checks.iter().any(|c| c.status == CheckStatus::Warn) {
            PreflightOverall::Warnings
        } else {
            PreflightOverall::Ready
        };

        Self {
            machine_id,
            checks,
            overall,
            checked_at,
        }
    }
}

/// Lifecycle hook event posted back by a remote assistant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEventKind {
    PromptSubmit,
    PreToolUse,
    Notification,
    Stop,
}

impl HookEventKind {
    /// Map an assistant hook name (`UserPromptSubmit`) to its callback kind
    pub fn from_hook_name(name: &str) -> Option<Self> {
        match name {
            "UserPromptSubmit" => Some(Self::PromptSubmit),
            "PreToolUse" => Some(Self::PreToolUse),
            "Notification" => Some(Self::Notification),
            "Stop" => Some(Self::Stop),
            _ => None,
        }
    }

    /// Path segment used in the callback URL
    pub fn slug(&self) -> &'static str {
        match self {
            Self::PromptSubmit => "prompt-submit",
            Self::PreToolUse => "pre-tool-use",
            Self::Notification => "notification",
            Self::Stop => "stop",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "prompt-submit" => Some(Self::PromptSubmit),
            "pre-tool-use" => Some(Self::PreToolUse),
            "notification" => Some(Self::Notification),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    /// Status an instance moves to when this event arrives
    pub fn resulting_status(&self) -> InstanceStatus {
        match self {
            Self::PromptSubmit | Self::PreToolUse => InstanceStatus::Working,
            Self::Notification => InstanceStatus::Awaiting,
            Self::Stop => InstanceStatus::Idle,
        }
    }
}

/// Body of `POST /api/hooks/{event}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookCallback {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Event pushed to every connected dashboard client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DashboardEvent {
    #[serde(rename = "instance:created")]
    InstanceCreated { instance: Instance },

    #[serde(rename = "instance:closed")]
    InstanceClosed { instance: Instance },

    #[serde(rename = "instance:updated")]
    InstanceUpdated { instance: Instance },

    #[serde(rename = "instance:status", rename_all = "camelCase")]
    InstanceStatus {
        instance_id: InstanceId,
        status: InstanceStatus,
    },

    #[serde(rename = "instances:reordered")]
    InstancesReordered { ids: Vec<InstanceId> },

    #[serde(rename = "ports:updated")]
    PortsUpdated { tunnels: Vec<TunnelInfo> },

    #[serde(rename = "machine:preflight")]
    MachinePreflight { report: PreflightReport },

    #[serde(rename = "machine:status", rename_all = "camelCase")]
    MachineStatus {
        machine_id: MachineId,
        reachability: Reachability,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
    },

    #[serde(rename = "hooks:installed", rename_all = "camelCase")]
    HooksInstalled {
        instance_id: InstanceId,
        machine_id: MachineId,
    },

    #[serde(rename = "hooks:uninstalled", rename_all = "camelCase")]
    HooksUninstalled {
        instance_id: InstanceId,
        machine_id: MachineId,
    },
}

impl DashboardEvent {
    /// The `type` tag, used as the SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::InstanceCreated { .. } => "instance:created",
            Self::InstanceClosed { .. } => "instance:closed",
            Self::InstanceUpdated { .. } => "instance:updated",
            Self::InstanceStatus { .. } => "instance:status",
            Self::InstancesReordered { .. } => "instances:reordered",
            Self::PortsUpdated { .. } => "ports:updated",
            Self::MachinePreflight { .. } => "machine:preflight",
            Self::MachineStatus { .. } => "machine:status",
            Self::HooksInstalled { .. } => "hooks:installed",
            Self::HooksUninstalled { .. } => "hooks:uninstalled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(status: CheckStatus) -> PreflightCheck {
        PreflightCheck::new("probe", status, "")
    }

    #[test]
    fn test_overall_for_every_two_check_combination() {
        use CheckStatus::*;
        let statuses = [Pass, Warn, Fail];

        for a in statuses {
            for b in statuses {
                let report =
                    PreflightReport::from_checks(MachineId::new("m"), vec![check(a), check(b)], 0);
                let expected = if a == Fail || b == Fail {
                    PreflightOverall::Blocked
                } else if a == Warn || b == Warn {
                    PreflightOverall::Warnings
                } else {
                    PreflightOverall::Ready
                };
                assert_eq!(report.overall, expected, "checks {:?} + {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_skipped_checks_do_not_block() {
        let report = PreflightReport::from_checks(
            MachineId::new("m"),
            vec![check(CheckStatus::Pass), check(CheckStatus::Skip)],
            0,
        );
        assert_eq!(report.overall, PreflightOverall::Ready);
    }

    #[test]
    fn test_create_request_accepts_missing_machine_id() {
        let req: CreateInstanceRequest = serde_json::from_str(
            r#"{"name":"api","workingDir":"/srv/api","machineType":"remote"}"#,
        )
        .unwrap();
        assert_eq!(req.machine_type, ExecutionTarget::Remote);
        assert!(req.machine_id.is_none());
    }

    #[test]
    fn test_event_tags() {
        let event = DashboardEvent::InstanceStatus {
            instance_id: InstanceId::new("i-1"),
            status: InstanceStatus::Awaiting,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "instance:status");
        assert_eq!(json["instanceId"], "i-1");
        assert_eq!(json["status"], "awaiting");
        assert_eq!(event.name(), "instance:status");

        let ports = DashboardEvent::PortsUpdated { tunnels: vec![] };
        let json = serde_json::to_value(&ports).unwrap();
        assert_eq!(json["type"], "ports:updated");
    }

    #[test]
    fn test_hook_event_mapping() {
        assert_eq!(
            HookEventKind::from_hook_name("UserPromptSubmit"),
            Some(HookEventKind::PromptSubmit)
        );
        assert_eq!(HookEventKind::from_slug("stop"), Some(HookEventKind::Stop));
        assert_eq!(HookEventKind::from_slug("bogus"), None);
        assert_eq!(
            HookEventKind::Notification.resulting_status(),
            InstanceStatus::Awaiting
        );
        assert_eq!(HookEventKind::PreToolUse.slug(), "pre-tool-use");
    }
}
