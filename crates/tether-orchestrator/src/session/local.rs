//! Local pseudo-terminal backend

use std::io::{Read, Write};
use std::path::Path;

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};

use tether_core::error::SessionError;
use tether_core::types::{InstanceId, TerminalSize};

use super::backend::{BackendCommand, BackendExit, BackendIo, INSTANCE_ID_ENV};

const INPUT_QUEUE: usize = 256;

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Pick the shell: explicit, then `$SHELL`, then `/bin/sh`
fn resolve_shell(requested: Option<&str>) -> Result<String, SessionError> {
    let shell = requested
        .map(str::to_string)
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| {
            if cfg!(windows) {
                "cmd.exe".to_string()
            } else {
                "/bin/sh".to_string()
            }
        });

    if !cfg!(windows) && !Path::new(&shell).exists() {
        return Err(SessionError::Spawn(format!("shell '{}' does not exist", shell)));
    }
    Ok(shell)
}

/// Start a shell in a new pty. Blocking; call from a blocking context.
pub fn spawn(
    instance_id: &InstanceId,
    working_dir: &Path,
    shell: Option<&str>,
    startup_command: Option<&str>,
    env: &[(String, String)],
    size: TerminalSize,
) -> Result<BackendIo, SessionError> {
    if !working_dir.is_dir() {
        return Err(SessionError::Spawn(format!(
            "working directory {} does not exist",
            working_dir.display()
        )));
    }

    let shell = resolve_shell(shell)?;
    tracing::info!(
        "Starting local pty for {} ({} in {}, {}x{})",
        instance_id,
        shell,
        working_dir.display(),
        size.cols,
        size.rows
    );

    let pair = native_pty_system()
        .openpty(pty_size(size))
        .map_err(|e| SessionError::Spawn(format!("failed to open pty: {}", e)))?;

    let mut cmd = CommandBuilder::new(&shell);
    cmd.cwd(working_dir);
    cmd.env("TERM", "xterm-256color");
    cmd.env(INSTANCE_ID_ENV, instance_id.as_str());
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SessionError::Spawn(format!("failed to spawn {}: {}", shell, e)))?;
    // The child holds its own copy; keeping ours would hide EOF
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SessionError::Spawn(format!("failed to clone pty reader: {}", e)))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| SessionError::Spawn(format!("failed to take pty writer: {}", e)))?;

    if let Some(command) = startup_command {
        writer
            .write_all(format!("{}\n", command).as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| SessionError::Spawn(format!("failed to send startup command: {}", e)))?;
    }

    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();

    let id = instance_id.clone();
    tokio::task::spawn_blocking(move || read_loop(id, reader, output_tx));

    let id = instance_id.clone();
    tokio::task::spawn_blocking(move || input_loop(id, input_rx, writer, pair.master, killer));

    let id = instance_id.clone();
    tokio::task::spawn_blocking(move || {
        let exit = match child.wait() {
            Ok(status) => BackendExit {
                code: Some(status.exit_code()),
                reason: format!("process exited with code {}", status.exit_code()),
            },
            Err(e) => BackendExit {
                code: None,
                reason: format!("wait failed: {}", e),
            },
        };
        tracing::debug!("Local session {}: {}", id, exit.reason);
        let _ = exit_tx.send(exit);
    });

    Ok(BackendIo {
        pid,
        input: input_tx,
        output: output_rx,
        exit: exit_rx,
    })
}

fn read_loop(id: InstanceId, mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Bytes>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the child is gone
                tracing::debug!("pty reader for {} stopped: {}", id, e);
                break;
            }
        }
    }
    tracing::debug!("pty reader for {} exiting", id);
}

fn input_loop(
    id: InstanceId,
    mut rx: mpsc::Receiver<BackendCommand>,
    mut writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    mut killer: Box<dyn ChildKiller + Send + Sync>,
) {
    loop {
        let Some(command) = rx.blocking_recv() else {
            // Session handle dropped
            let _ = killer.kill();
            break;
        };
        match command {
            BackendCommand::Data(data) => {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    tracing::warn!("pty write for {} failed: {}", id, e);
                    break;
                }
            }
            BackendCommand::Resize(size) => {
                if let Err(e) = master.resize(pty_size(size)) {
                    tracing::warn!("pty resize for {} failed: {}", id, e);
                }
            }
            BackendCommand::Kill => {
                if let Err(e) = killer.kill() {
                    tracing::debug!("kill for {} failed: {}", id, e);
                }
                break;
            }
        }
    }
}
