//! Remote file access over one-shot SSH commands
//!
//! Writes go to a temp file that is renamed into place, so the target is
//! either fully replaced or left as it was.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;

use tether_core::error::SshError;
use tether_core::types::MachineId;

use crate::ssh::{remote_path_expr, ExecOptions, RemoteExecutor};

/// Exit status the read command uses for "no such file"
const ABSENT_EXIT: u32 = 44;

#[async_trait]
pub trait RemoteFiles: Send + Sync {
    /// File contents, or `None` if it does not exist
    async fn read(&self, machine_id: &MachineId, path: &str) -> Result<Option<String>, SshError>;

    /// Replace `path` atomically, creating parent directories
    async fn write_atomic(&self, machine_id: &MachineId, path: &str, contents: &str) -> Result<(), SshError>;

    async fn copy(&self, machine_id: &MachineId, from: &str, to: &str) -> Result<(), SshError>;
}

pub struct SshRemoteFiles {
    exec: Arc<dyn RemoteExecutor>,
}

impl SshRemoteFiles {
    pub fn new(exec: Arc<dyn RemoteExecutor>) -> Self {
        Self { exec }
    }
}

fn failure(what: &str, path: &str, stderr: &str, code: Option<u32>) -> SshError {
    SshError::Channel(format!(
        "{} {} failed (exit {}): {}",
        what,
        path,
        code.map(|c| c.to_string()).unwrap_or_else(|| "?".into()),
        stderr.trim()
    ))
}

pub(crate) fn read_command(path: &str) -> String {
    let p = remote_path_expr(path);
    format!("if [ -f {p} ]; then cat {p}; else exit {ABSENT_EXIT}; fi")
}

pub(crate) fn write_command(path: &str, contents: &str) -> String {
    let p = remote_path_expr(path);
    let tmp = remote_path_expr(&format!("{}.tether-tmp", path));
    let encoded = base64::engine::general_purpose::STANDARD.encode(contents);
    format!(
        "mkdir -p \"$(dirname {p})\" && printf '%s' '{encoded}' | base64 -d > {tmp} && mv -f {tmp} {p} || {{ rm -f {tmp}; exit 1; }}"
    )
}

#[async_trait]
impl RemoteFiles for SshRemoteFiles {
    async fn read(&self, machine_id: &MachineId, path: &str) -> Result<Option<String>, SshError> {
        let output = self
            .exec
            .execute_command(machine_id, &read_command(path), ExecOptions::default())
            .await?;

        match output.exit_code {
            Some(0) => Ok(Some(output.stdout)),
            Some(ABSENT_EXIT) => Ok(None),
            code => Err(failure("read", path, &output.stderr, code)),
        }
    }

    async fn write_atomic(&self, machine_id: &MachineId, path: &str, contents: &str) -> Result<(), SshError> {
        let output = self
            .exec
            .execute_command(machine_id, &write_command(path, contents), ExecOptions::default())
            .await?;

        if output.success() {
            tracing::debug!("Wrote {} bytes to {}:{}", contents.len(), machine_id, path);
            Ok(())
        } else {
            Err(failure("write", path, &output.stderr, output.exit_code))
        }
    }

    async fn copy(&self, machine_id: &MachineId, from: &str, to: &str) -> Result<(), SshError> {
        let command = format!("cp -p {} {}", remote_path_expr(from), remote_path_expr(to));
        let output = self
            .exec
            .execute_command(machine_id, &command, ExecOptions::default())
            .await?;

        if output.success() {
            Ok(())
        } else {
            Err(failure("copy", from, &output.stderr, output.exit_code))
        }
    }
}
