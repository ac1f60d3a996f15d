//! SSH shell backend
//!
//! One session channel per instance on the machine's pooled connection.
//! A single task owns the channel and multiplexes input with remote output.

use std::time::Duration;

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use tokio::sync::{mpsc, oneshot};

use tether_core::error::SessionError;
use tether_core::types::{InstanceId, TerminalSize};

use crate::ssh::{remote_path_expr, shell_quote, within, SshHandle};

use super::backend::{BackendCommand, BackendExit, BackendIo, INSTANCE_ID_ENV};

const INPUT_QUEUE: usize = 256;

/// First line typed into the remote shell
fn startup_line(
    instance_id: &InstanceId,
    working_dir: &str,
    startup_command: Option<&str>,
    env: &[(String, String)],
) -> String {
    let mut line = format!("export {}={}; ", INSTANCE_ID_ENV, shell_quote(instance_id.as_str()));
    for (key, value) in env {
        line.push_str(&format!("export {}={}; ", key, shell_quote(value)));
    }
    line.push_str(&format!("cd {}", remote_path_expr(working_dir)));
    if let Some(command) = startup_command {
        line.push_str(" && ");
        line.push_str(command);
    }
    line.push('\n');
    line
}

/// Open a pty-backed shell channel and type the startup line into it
async fn open_shell(handle: &SshHandle, size: TerminalSize, line: &str) -> Result<Channel<Msg>, SessionError> {
    let spawn_err = |what: &str, e: russh::Error| SessionError::Spawn(format!("{}: {}", what, e));

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| spawn_err("channel open failed", e))?;
    channel
        .request_pty(
            false,
            "xterm-256color",
            u32::from(size.cols),
            u32::from(size.rows),
            0,
            0,
            &[],
        )
        .await
        .map_err(|e| spawn_err("pty request failed", e))?;
    channel
        .request_shell(false)
        .await
        .map_err(|e| spawn_err("shell request failed", e))?;
    channel
        .data(line.as_bytes())
        .await
        .map_err(|e| spawn_err("failed to send startup command", e))?;
    Ok(channel)
}

pub async fn spawn(
    instance_id: &InstanceId,
    handle: &SshHandle,
    working_dir: &str,
    startup_command: Option<&str>,
    env: &[(String, String)],
    size: TerminalSize,
    setup_timeout: Duration,
) -> Result<BackendIo, SessionError> {
    let line = startup_line(instance_id, working_dir, startup_command, env);
    let channel = within(
        setup_timeout,
        format!("remote shell setup for {}", instance_id),
        open_shell(handle, size, &line),
    )
    .await
    .map_err(|e| SessionError::Spawn(e.to_string()))??;

    tracing::info!("Started remote shell for {} in {}", instance_id, working_dir);

    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();

    tokio::spawn(drive(instance_id.clone(), channel, input_rx, output_tx, exit_tx));

    Ok(BackendIo {
        pid: None,
        input: input_tx,
        output: output_rx,
        exit: exit_rx,
    })
}

enum Step {
    Input(Option<BackendCommand>),
    Remote(Option<ChannelMsg>),
}

async fn drive(
    id: InstanceId,
    mut channel: Channel<Msg>,
    mut input: mpsc::Receiver<BackendCommand>,
    output: mpsc::UnboundedSender<Bytes>,
    exit_tx: oneshot::Sender<BackendExit>,
) {
    let mut exit_code = None;

    let reason = loop {
        let step = tokio::select! {
            cmd = input.recv() => Step::Input(cmd),
            msg = channel.wait() => Step::Remote(msg),
        };

        match step {
            Step::Input(Some(BackendCommand::Data(data))) => {
                if let Err(e) = channel.data(&data[..]).await {
                    break format!("write failed: {}", e);
                }
            }
            Step::Input(Some(BackendCommand::Resize(size))) => {
                if let Err(e) = channel
                    .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
                    .await
                {
                    tracing::warn!("window change for {} failed: {}", id, e);
                }
            }
            Step::Input(Some(BackendCommand::Kill)) | Step::Input(None) => {
                let _ = channel.signal(Sig::KILL).await;
                let _ = channel.eof().await;
                let _ = channel.close().await;
                break "killed".to_string();
            }
            Step::Remote(Some(ChannelMsg::Data { data })) => {
                let _ = output.send(Bytes::copy_from_slice(&data));
            }
            Step::Remote(Some(ChannelMsg::ExtendedData { data, .. })) => {
                let _ = output.send(Bytes::copy_from_slice(&data));
            }
            Step::Remote(Some(ChannelMsg::ExitStatus { exit_status })) => {
                exit_code = Some(exit_status);
            }
            Step::Remote(Some(ChannelMsg::Close)) | Step::Remote(None) => {
                break match exit_code {
                    Some(code) => format!("remote shell exited with code {}", code),
                    None => "ssh channel closed".to_string(),
                };
            }
            Step::Remote(Some(_)) => {}
        }
    };

    tracing::debug!("Remote session {}: {}", id, reason);
    let _ = exit_tx.send(BackendExit {
        code: exit_code,
        reason,
    });
}
