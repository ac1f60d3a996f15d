//! In-memory stand-ins for the SSH, pty and persistence seams.
//!
//! Unit tests and the integration suite drive the orchestrator through
//! these instead of real machines. Every fake records what was asked of it
//! so tests can assert on side effects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use tether_core::error::{SessionError, SshError, StoreError, TunnelError};
use tether_core::traits::InstanceStore;
use tether_core::types::{Instance, InstanceId, MachineId};

use crate::hooks::RemoteFiles;
use crate::session::{BackendCommand, BackendExit, BackendIo, BackendLauncher, BackendSpec};
use crate::ssh::{CommandOutput, ConnectionTest, ExecOptions, RemoteExecutor};
use crate::store::MemoryInstanceStore;
use crate::tunnel::{ForwardHandle, ReverseForwarder};

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FakeBackend {
    input: Arc<tokio::sync::Mutex<mpsc::Receiver<BackendCommand>>>,
    output: mpsc::UnboundedSender<Bytes>,
    exit: Option<oneshot::Sender<BackendExit>>,
}

/// Launcher whose backends are driven by the test
#[derive(Default)]
pub struct FakeLauncher {
    backends: Mutex<HashMap<InstanceId, FakeBackend>>,
    specs: Mutex<Vec<(InstanceId, BackendSpec)>>,
    fail_next: Mutex<Option<String>>,
    next_pid: AtomicUsize,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicUsize::new(4000),
            ..Default::default()
        }
    }

    /// Make the next launch fail with `reason`
    pub fn fail_next(&self, reason: &str) {
        *locked(&self.fail_next) = Some(reason.to_string());
    }

    /// Specs passed to every launch so far
    pub fn launched(&self) -> Vec<(InstanceId, BackendSpec)> {
        locked(&self.specs).clone()
    }

    /// Produce output as if the backend printed it
    pub fn emit(&self, instance_id: &InstanceId, data: &[u8]) {
        if let Some(backend) = locked(&self.backends).get(instance_id) {
            let _ = backend.output.send(Bytes::copy_from_slice(data));
        }
    }

    /// Stop the backend on its own
    pub fn exit(&self, instance_id: &InstanceId, code: Option<u32>, reason: &str) {
        let sender = locked(&self.backends)
            .get_mut(instance_id)
            .and_then(|b| b.exit.take());
        if let Some(sender) = sender {
            let _ = sender.send(BackendExit {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Next command the session sent to the backend
    pub async fn wait_for_input(&self, instance_id: &InstanceId, timeout: Duration) -> Option<BackendCommand> {
        let input = locked(&self.backends).get(instance_id)?.input.clone();
        let mut input = input.lock().await;
        tokio::time::timeout(timeout, input.recv()).await.ok().flatten()
    }
}

#[async_trait]
impl BackendLauncher for FakeLauncher {
    async fn launch(&self, instance_id: &InstanceId, spec: &BackendSpec) -> Result<BackendIo, SessionError> {
        if let Some(reason) = locked(&self.fail_next).take() {
            return Err(SessionError::Spawn(reason));
        }
        locked(&self.specs).push((instance_id.clone(), spec.clone()));

        let (input_tx, input_rx) = mpsc::channel(64);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        locked(&self.backends).insert(
            instance_id.clone(),
            FakeBackend {
                input: Arc::new(tokio::sync::Mutex::new(input_rx)),
                output: output_tx,
                exit: Some(exit_tx),
            },
        );

        Ok(BackendIo {
            pid: Some(self.next_pid.fetch_add(1, Ordering::SeqCst) as u32),
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
        })
    }
}

struct FakeForward {
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
    stall_close: Arc<AtomicBool>,
}

#[async_trait]
impl ForwardHandle for FakeForward {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(self: Box<Self>) {
        if self.stall_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Forwarder that counts opens and closes
#[derive(Default)]
pub struct FakeForwarder {
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    live: Mutex<Vec<Arc<AtomicBool>>>,
    fail_next: Mutex<Option<String>>,
    stall_close: Arc<AtomicBool>,
    /// Simulated handshake time
    delay: Mutex<Option<Duration>>,
}

impl FakeForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, reason: &str) {
        *locked(&self.fail_next) = Some(reason.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *locked(&self.delay) = Some(delay);
    }

    /// Make closing a forward hang like an unresponsive peer
    pub fn stall_close(&self, stall: bool) {
        self.stall_close.store(stall, Ordering::SeqCst);
    }

    /// Drop every forward's connection without closing it
    pub fn kill_all(&self) {
        for alive in locked(&self.live).iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ReverseForwarder for FakeForwarder {
    async fn open(&self, machine_id: &MachineId, _remote_port: u16) -> Result<Box<dyn ForwardHandle>, TunnelError> {
        let delay = *locked(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = locked(&self.fail_next).take() {
            return Err(TunnelError::Creation {
                machine: machine_id.to_string(),
                reason,
            });
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        locked(&self.live).push(alive.clone());
        Ok(Box::new(FakeForward {
            alive,
            closed: self.closed.clone(),
            stall_close: self.stall_close.clone(),
        }))
    }
}

/// Executor answering commands from canned responses
#[derive(Default)]
pub struct FakeExecutor {
    responses: Mutex<Vec<(String, CommandOutput)>>,
    commands: Mutex<Vec<String>>,
    unreachable: Mutex<Option<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `output`.
    ///
    /// Later registrations win. Unmatched commands succeed with no output.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        locked(&self.responses).push((pattern.to_string(), output));
    }

    /// Fail connection tests and every command with `reason`
    pub fn set_unreachable(&self, reason: &str) {
        *locked(&self.unreachable) = Some(reason.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        locked(&self.commands).clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn test_connection(&self, _machine_id: &MachineId) -> Result<ConnectionTest, SshError> {
        Ok(match locked(&self.unreachable).clone() {
            Some(reason) => ConnectionTest {
                reachable: false,
                latency_ms: None,
                error: Some(reason),
            },
            None => ConnectionTest {
                reachable: true,
                latency_ms: Some(1),
                error: None,
            },
        })
    }

    async fn execute_command(
        &self,
        _machine_id: &MachineId,
        command: &str,
        _opts: ExecOptions,
    ) -> Result<CommandOutput, SshError> {
        if let Some(reason) = locked(&self.unreachable).clone() {
            return Err(SshError::ConnectionFailed(reason));
        }
        locked(&self.commands).push(command.to_string());

        let responses = locked(&self.responses);
        Ok(responses
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            }))
    }
}

/// Remote files kept in a map keyed by machine and path
#[derive(Default)]
pub struct MemoryRemoteFiles {
    files: Mutex<HashMap<(MachineId, String), String>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryRemoteFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, machine_id: &MachineId, path: &str, contents: &str) {
        locked(&self.files).insert((machine_id.clone(), path.to_string()), contents.to_string());
    }

    pub fn get(&self, machine_id: &MachineId, path: &str) -> Option<String> {
        locked(&self.files)
            .get(&(machine_id.clone(), path.to_string()))
            .cloned()
    }

    /// Successful writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteFiles for MemoryRemoteFiles {
    async fn read(&self, machine_id: &MachineId, path: &str) -> Result<Option<String>, SshError> {
        Ok(self.get(machine_id, path))
    }

    async fn write_atomic(&self, machine_id: &MachineId, path: &str, contents: &str) -> Result<(), SshError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SshError::Channel("write refused".to_string()));
        }
        self.put(machine_id, path, contents);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn copy(&self, machine_id: &MachineId, from: &str, to: &str) -> Result<(), SshError> {
        let contents = self
            .get(machine_id, from)
            .ok_or_else(|| SshError::Channel(format!("{}: no such file", from)))?;
        self.put(machine_id, to, &contents);
        Ok(())
    }
}

/// Store whose inserts can be made to fail
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryInstanceStore,
    fail_inserts: AtomicBool,
    inserts: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Committed inserts
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceStore for FailingStore {
    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError> {
        self.inner.get(id).await
    }

    async fn all(&self) -> Result<Vec<Instance>, StoreError> {
        self.inner.all().await
    }

    async fn insert(&self, instance: &Instance) -> Result<(), StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError("disk full".to_string()));
        }
        self.inner.insert(instance).await?;
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, instance: &Instance) -> Result<(), StoreError> {
        self.inner.update(instance).await
    }
}
