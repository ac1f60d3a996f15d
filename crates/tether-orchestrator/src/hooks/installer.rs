//! Install, verify and remove lifecycle hooks on a remote machine
//!
//! Every mutation is read, merge, back up, then replace in one atomic
//! write. Any failure before the final rename leaves the remote settings
//! exactly as they were.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use tether_core::config::HookSettings;
use tether_core::error::HookError;
use tether_core::time::current_time_millis;
use tether_core::types::MachineId;

use crate::ssh::{ExecOptions, RemoteExecutor};

use super::document::{self, HookVerification};
use super::remote_files::RemoteFiles;

/// Hook names already present in a machine's settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingHooks {
    pub config_path: String,
    pub file_exists: bool,
    /// Every event with at least one hook, ours or not
    pub defined: Vec<String>,
    /// Events carrying entries we own
    pub owned: Vec<String>,
    /// Managed events that already have foreign hooks
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub message: String,
    pub backup_path: Option<String>,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallOutcome {
    pub message: String,
    pub removed: usize,
    pub backup_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolReport {
    pub available: Vec<String>,
    pub missing: Vec<String>,
}

pub struct HookInstaller {
    exec: Arc<dyn RemoteExecutor>,
    files: Arc<dyn RemoteFiles>,
    settings: HookSettings,
}

impl HookInstaller {
    pub fn new(
        exec: Arc<dyn RemoteExecutor>,
        files: Arc<dyn RemoteFiles>,
        settings: HookSettings,
    ) -> Self {
        Self {
            exec,
            files,
            settings,
        }
    }

    pub fn settings(&self) -> &HookSettings {
        &self.settings
    }

    /// The hook document for `orchestrator_url`, without touching any machine
    pub fn config_preview(&self, orchestrator_url: &str) -> Value {
        document::preview(&self.settings.events, orchestrator_url)
    }

    async fn load(&self, machine_id: &MachineId) -> Result<Option<(String, Value)>, HookError> {
        match self.files.read(machine_id, &self.settings.config_path).await? {
            Some(text) => {
                let doc = document::parse(&text)?;
                Ok(Some((text, doc)))
            }
            None => Ok(None),
        }
    }

    pub async fn check_existing_hooks(&self, machine_id: &MachineId) -> Result<ExistingHooks, HookError> {
        let loaded = self.load(machine_id).await?;
        let file_exists = loaded.is_some();
        let doc = loaded.map(|(_, doc)| doc).unwrap_or_else(|| serde_json::json!({}));

        let defined = document::defined_events(&doc);
        let owned = document::owned_events(&doc);
        let conflicts = self
            .settings
            .events
            .iter()
            .filter(|name| defined.contains(name) && !owned.contains(name))
            .cloned()
            .collect();

        Ok(ExistingHooks {
            config_path: self.settings.config_path.clone(),
            file_exists,
            defined,
            owned,
            conflicts,
        })
    }

    fn backup_path(&self) -> String {
        format!(
            "{}.tether-backup-{}",
            self.settings.config_path,
            current_time_millis()
        )
    }

    /// Copy the current file aside; only called when it exists
    async fn backup(&self, machine_id: &MachineId) -> Result<String, HookError> {
        let path = self.backup_path();
        self.files
            .copy(machine_id, &self.settings.config_path, &path)
            .await
            .map_err(|e| HookError::PartialInstall(format!("backup failed: {}", e)))?;
        Ok(path)
    }

    /// Point every managed hook at `orchestrator_url`
    pub async fn install(
        &self,
        machine_id: &MachineId,
        orchestrator_url: &str,
    ) -> Result<InstallOutcome, HookError> {
        let loaded = self
            .load(machine_id)
            .await
            .map_err(|e| match e {
                HookError::Remote(ssh) => HookError::PartialInstall(format!("read failed: {}", ssh)),
                other => other,
            })?;

        let (original, doc) = match loaded {
            Some((text, doc)) => (Some(text), doc),
            None => (None, serde_json::json!({})),
        };

        let merged = document::merge(doc.clone(), &self.settings.events, orchestrator_url)?;
        if original.is_some() && merged == doc {
            tracing::info!("Hooks on {} already point at {}", machine_id, orchestrator_url);
            return Ok(InstallOutcome {
                message: "Hooks already installed".to_string(),
                backup_path: None,
                changed: false,
            });
        }

        let backup_path = match original {
            Some(_) => Some(self.backup(machine_id).await?),
            None => None,
        };

        let text = serialize(&merged)?;
        self.files
            .write_atomic(machine_id, &self.settings.config_path, &text)
            .await
            .map_err(|e| HookError::PartialInstall(format!("write failed: {}", e)))?;

        tracing::info!(
            "Installed {} hook(s) on {} -> {}",
            self.settings.events.len(),
            machine_id,
            orchestrator_url
        );

        let message = match &backup_path {
            Some(path) => format!("Hooks installed (previous settings saved to {})", path),
            None => "Hooks installed".to_string(),
        };
        Ok(InstallOutcome {
            message,
            backup_path,
            changed: true,
        })
    }

    /// Re-read the remote settings and classify every managed hook
    pub async fn verify(&self, machine_id: &MachineId, expected_url: &str) -> Result<HookVerification, HookError> {
        let doc = self
            .load(machine_id)
            .await?
            .map(|(_, doc)| doc)
            .unwrap_or_else(|| serde_json::json!({}));

        Ok(document::verify(
            &doc,
            &self.settings.events,
            expected_url,
            self.settings.url_match,
        ))
    }

    /// Remove only the entries we own
    pub async fn uninstall(&self, machine_id: &MachineId) -> Result<UninstallOutcome, HookError> {
        let Some((_, doc)) = self.load(machine_id).await? else {
            return Ok(UninstallOutcome {
                message: "No hook configuration present".to_string(),
                removed: 0,
                backup_path: None,
            });
        };

        let (stripped, removed) = document::strip(doc)?;
        if removed == 0 {
            return Ok(UninstallOutcome {
                message: "No managed hooks to remove".to_string(),
                removed: 0,
                backup_path: None,
            });
        }

        let backup_path = self.backup(machine_id).await?;
        let text = serialize(&stripped)?;
        self.files
            .write_atomic(machine_id, &self.settings.config_path, &text)
            .await
            .map_err(|e| HookError::PartialInstall(format!("write failed: {}", e)))?;

        tracing::info!("Removed {} managed hook(s) from {}", removed, machine_id);
        Ok(UninstallOutcome {
            message: format!("Removed {} hook(s)", removed),
            removed,
            backup_path: Some(backup_path),
        })
    }

    /// Probe the remote PATH for every required tool in one command
    pub async fn check_required_tools(&self, machine_id: &MachineId) -> Result<ToolReport, HookError> {
        if self.settings.required_tools.is_empty() {
            return Ok(ToolReport::default());
        }

        let output = self
            .exec
            .execute_command(
                machine_id,
                &tools_command(&self.settings.required_tools),
                ExecOptions::default(),
            )
            .await?;

        let report = parse_tools(&output.stdout, &self.settings.required_tools);
        if !report.missing.is_empty() {
            tracing::warn!("{} is missing tools: {}", machine_id, report.missing.join(", "));
        }
        Ok(report)
    }
}

fn serialize(doc: &Value) -> Result<String, HookError> {
    serde_json::to_string_pretty(doc)
        .map(|mut s| {
            s.push('\n');
            s
        })
        .map_err(|e| HookError::Malformed(e.to_string()))
}

fn tools_command(tools: &[String]) -> String {
    let names: Vec<String> = tools.iter().map(|t| crate::ssh::shell_quote(t)).collect();
    format!(
        "for t in {}; do if command -v \"$t\" >/dev/null 2>&1; then echo \"ok $t\"; else echo \"missing $t\"; fi; done",
        names.join(" ")
    )
}

/// Tools not reported `ok` count as missing
fn parse_tools(stdout: &str, tools: &[String]) -> ToolReport {
    let found: Vec<&str> = stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("ok "))
        .collect();

    let (available, missing) = tools
        .iter()
        .cloned()
        .partition(|tool| found.contains(&tool.as_str()));
    ToolReport { available, missing }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{FakeExecutor, MemoryRemoteFiles};

    const URL: &str = "http://127.0.0.1:47100";
    const PATH: &str = ".claude/settings.json";

    fn installer(files: Arc<MemoryRemoteFiles>) -> HookInstaller {
        HookInstaller::new(Arc::new(FakeExecutor::new()), files, HookSettings::default())
    }

    fn machine() -> MachineId {
        MachineId::new("machine-123")
    }

    #[tokio::test]
    async fn test_install_on_fresh_machine() {
        let files = Arc::new(MemoryRemoteFiles::new());
        let hooks = installer(files.clone());

        let outcome = hooks.install(&machine(), URL).await.unwrap();
        assert!(outcome.changed);
        assert!(outcome.backup_path.is_none());

        let verification = hooks.verify(&machine(), URL).await.unwrap();
        assert_eq!(verification.status, document::VerificationStatus::Installed);
    }

    #[tokio::test]
    async fn test_install_backs_up_existing_file() {
        let files = Arc::new(MemoryRemoteFiles::new());
        files.put(&machine(), PATH, r#"{"theme":"dark"}"#);
        let hooks = installer(files.clone());

        let outcome = hooks.install(&machine(), URL).await.unwrap();
        let backup = outcome.backup_path.unwrap();
        assert!(backup.starts_with(".claude/settings.json.tether-backup-"));
        assert_eq!(files.get(&machine(), &backup).as_deref(), Some(r#"{"theme":"dark"}"#));

        let written: Value = serde_json::from_str(&files.get(&machine(), PATH).unwrap()).unwrap();
        assert_eq!(written["theme"], "dark");
    }

    #[tokio::test]
    async fn test_reinstall_is_noop() {
        let files = Arc::new(MemoryRemoteFiles::new());
        let hooks = installer(files.clone());
        hooks.install(&machine(), URL).await.unwrap();
        let writes = files.writes();

        let again = hooks.install(&machine(), URL).await.unwrap();
        assert!(!again.changed);
        assert_eq!(files.writes(), writes);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_file_untouched() {
        let files = Arc::new(MemoryRemoteFiles::new());
        let original = r#"{"hooks":{"Stop":[{"hooks":[{"type":"command","command":"say done"}]}]}}"#;
        files.put(&machine(), PATH, original);
        let hooks = installer(files.clone());
        let before = hooks.check_existing_hooks(&machine()).await.unwrap();

        files.fail_writes(true);
        let err = hooks.install(&machine(), URL).await.unwrap_err();
        assert!(matches!(err, HookError::PartialInstall(_)));

        assert_eq!(files.get(&machine(), PATH).as_deref(), Some(original));
        assert_eq!(hooks.check_existing_hooks(&machine()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_malformed_settings_are_not_overwritten() {
        let files = Arc::new(MemoryRemoteFiles::new());
        files.put(&machine(), PATH, "{ oops");
        let hooks = installer(files.clone());

        let err = hooks.install(&machine(), URL).await.unwrap_err();
        assert!(matches!(err, HookError::Malformed(_)));
        assert_eq!(files.get(&machine(), PATH).as_deref(), Some("{ oops"));
    }

    #[tokio::test]
    async fn test_existing_hooks_reports_conflicts() {
        let files = Arc::new(MemoryRemoteFiles::new());
        files.put(
            &machine(),
            PATH,
            r#"{"hooks":{"Stop":[{"hooks":[{"type":"command","command":"say done"}]}]}}"#,
        );
        let hooks = installer(files);

        let existing = hooks.check_existing_hooks(&machine()).await.unwrap();
        assert!(existing.file_exists);
        assert_eq!(existing.defined, vec!["Stop".to_string()]);
        assert!(existing.owned.is_empty());
        assert_eq!(existing.conflicts, vec!["Stop".to_string()]);
    }

    #[tokio::test]
    async fn test_uninstall_keeps_foreign_hooks() {
        let files = Arc::new(MemoryRemoteFiles::new());
        files.put(
            &machine(),
            PATH,
            r#"{"hooks":{"Stop":[{"hooks":[{"type":"command","command":"say done"}]}]}}"#,
        );
        let hooks = installer(files.clone());
        hooks.install(&machine(), URL).await.unwrap();

        let outcome = hooks.uninstall(&machine()).await.unwrap();
        assert_eq!(outcome.removed, 4);

        let existing = hooks.check_existing_hooks(&machine()).await.unwrap();
        assert_eq!(existing.defined, vec!["Stop".to_string()]);
        assert!(existing.owned.is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_without_file() {
        let hooks = installer(Arc::new(MemoryRemoteFiles::new()));
        let outcome = hooks.uninstall(&machine()).await.unwrap();
        assert_eq!(outcome.removed, 0);
    }

    #[test]
    fn test_parse_tools() {
        let tools: Vec<String> = ["jq", "curl", "python3"].iter().map(|s| s.to_string()).collect();
        let report = parse_tools("ok jq\nmissing curl\nok python3\n", &tools);
        assert_eq!(report.available, vec!["jq", "python3"]);
        assert_eq!(report.missing, vec!["curl"]);

        let garbled = parse_tools("", &tools);
        assert_eq!(garbled.missing.len(), 3);
    }

    #[test]
    fn test_tools_command_quotes_names() {
        let cmd = tools_command(&["jq".to_string(), "curl".to_string()]);
        assert!(cmd.starts_with("for t in 'jq' 'curl'; do"));
    }
}
