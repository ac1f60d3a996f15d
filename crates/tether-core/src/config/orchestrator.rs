//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::RemoteMachine;

/// Configuration for the orchestrator daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Address of the HTTP listener (dashboard API and hook callbacks).
    /// Reverse tunnels forward to this address.
    pub http_bind: String,

    /// Command typed into every new session once the shell is up
    pub assistant_command: Option<String>,

    /// Shell for local sessions (falls back to `$SHELL`, then `/bin/sh`)
    pub default_shell: Option<String>,

    /// Per-session output ring capacity in bytes
    pub scrollback_bytes: usize,

    pub ssh: SshSettings,

    pub tunnel: TunnelSettings,

    pub hooks: HookSettings,

    /// Statically registered machines
    pub machines: Vec<RemoteMachine>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            http_bind: "127.0.0.1:7420".to_string(),
            assistant_command: Some("claude".to_string()),
            default_shell: None,
            scrollback_bytes: 256 * 1024,
            ssh: SshSettings::default(),
            tunnel: TunnelSettings::default(),
            hooks: HookSettings::default(),
            machines: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Base URL of the local HTTP listener
    pub fn local_url(&self) -> String {
        format!("http://{}", self.http_bind)
    }
}

/// SSH timeouts and remote command behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Budget for TCP connect + handshake + auth
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Budget for reachability probes
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,

    /// Default budget for one-shot remote commands
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Wrap remote commands in `timeout(1)` so the remote side dies with the budget
    pub remote_kill_guard: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            remote_kill_guard: true,
        }
    }
}

/// Reverse tunnel port allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Address the remote side listens on
    pub remote_bind_address: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            remote_bind_address: "127.0.0.1".to_string(),
            port_range_start: 47100,
            port_range_end: 47199,
        }
    }
}

/// How a hook's callback URL is compared with the expected orchestrator URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlMatch {
    /// Byte-for-byte, ignoring a trailing slash
    #[default]
    Exact,
    /// Hook URL starts with the expected URL
    Prefix,
    /// Same host and port, any path
    Host,
}

/// Remote hook installation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSettings {
    /// Assistant settings file, relative to the remote `$HOME`
    pub config_path: String,

    /// Lifecycle hook names managed by tether
    pub events: Vec<String>,

    /// Remote tools the hook commands rely on
    pub required_tools: Vec<String>,

    pub url_match: UrlMatch,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            config_path: ".claude/settings.json".to_string(),
            events: vec![
                "UserPromptSubmit".to_string(),
                "PreToolUse".to_string(),
                "Notification".to_string(),
                "Stop".to_string(),
            ],
            required_tools: vec![
                "jq".to_string(),
                "curl".to_string(),
                "bash".to_string(),
                "python3".to_string(),
            ],
            url_match: UrlMatch::Exact,
        }
    }
}
