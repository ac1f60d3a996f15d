//! Session manager implementation

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tether_core::error::SessionError;
use tether_core::types::{BackendKind, InstanceId, TerminalSize};

use super::backend::{BackendCommand, BackendLauncher, BackendSpec};
use super::buffer::OutputRing;

/// Live subscribers lagging by more than this many chunks skip ahead
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Notice that a backend stopped on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    pub instance_id: InstanceId,
    pub code: Option<u32>,
    pub reason: String,
}

/// Handle to a live session
pub struct Session {
    pub instance_id: InstanceId,
    pub kind: BackendKind,
    pub pid: Option<u32>,
    input: mpsc::Sender<BackendCommand>,
    ring: Arc<Mutex<OutputRing>>,
    live: broadcast::Sender<Bytes>,
    /// Cancelled when the session is killed on request
    cancel: CancellationToken,
}

/// Output subscription: buffered scrollback plus the live feed
pub struct OutputSubscription {
    pub replay: Bytes,
    pub live: broadcast::Receiver<Bytes>,
}

type SessionTable = DashMap<InstanceId, Arc<Session>>;

/// Owns every live terminal session, keyed by instance
pub struct SessionManager {
    sessions: Arc<SessionTable>,
    launcher: Arc<dyn BackendLauncher>,
    exits: mpsc::UnboundedSender<SessionExit>,
    scrollback_bytes: usize,
}

impl SessionManager {
    /// Create a manager; unsolicited exits arrive on the returned receiver
    pub fn new(
        launcher: Arc<dyn BackendLauncher>,
        scrollback_bytes: usize,
    ) -> (Self, mpsc::UnboundedReceiver<SessionExit>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let manager = Self {
            sessions: Arc::new(DashMap::new()),
            launcher,
            exits,
            scrollback_bytes,
        };
        (manager, exit_rx)
    }

    /// Start a backend and register it under `instance_id`
    pub async fn spawn(
        &self,
        instance_id: &InstanceId,
        spec: BackendSpec,
    ) -> Result<Option<u32>, SessionError> {
        if self.sessions.contains_key(instance_id) {
            return Err(SessionError::AlreadyExists(instance_id.to_string()));
        }

        let io = self.launcher.launch(instance_id, &spec).await?;

        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let session = Arc::new(Session {
            instance_id: instance_id.clone(),
            kind: spec.kind(),
            pid: io.pid,
            input: io.input,
            ring: Arc::new(Mutex::new(OutputRing::new(self.scrollback_bytes))),
            live,
            cancel: CancellationToken::new(),
        });

        // Register before the watchers run so an instant exit still finds it
        self.sessions.insert(instance_id.clone(), Arc::clone(&session));

        tokio::spawn(pump_output(
            io.output,
            Arc::clone(&session.ring),
            session.live.clone(),
        ));
        tokio::spawn(watch_exit(
            Arc::clone(&session),
            io.exit,
            Arc::clone(&self.sessions),
            self.exits.clone(),
        ));

        tracing::info!("Session {} started ({:?})", instance_id, session.kind);
        Ok(session.pid)
    }

    fn get(&self, instance_id: &InstanceId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(instance_id)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| SessionError::UnknownSession(instance_id.to_string()))
    }

    /// Forward input to the backend
    pub async fn write(&self, instance_id: &InstanceId, data: Bytes) -> Result<(), SessionError> {
        let session = self.get(instance_id)?;
        session
            .input
            .send(BackendCommand::Data(data))
            .await
            .map_err(|_| SessionError::Closed(instance_id.to_string()))
    }

    pub async fn resize(&self, instance_id: &InstanceId, size: TerminalSize) -> Result<(), SessionError> {
        let session = self.get(instance_id)?;
        session
            .input
            .send(BackendCommand::Resize(size))
            .await
            .map_err(|_| SessionError::Closed(instance_id.to_string()))
    }

    /// Terminate and deregister. No-op for unknown sessions.
    pub async fn kill(&self, instance_id: &InstanceId) {
        let Some((_, session)) = self.sessions.remove(instance_id) else {
            return;
        };

        session.cancel.cancel();
        // A full queue is fine: the backend also stops once every sender is dropped
        if let Err(e) = session.input.try_send(BackendCommand::Kill) {
            tracing::debug!("Kill for {} not queued: {}", instance_id, e);
        }
        tracing::info!("Session {} killed", instance_id);
    }

    /// Kill every session (shutdown)
    pub async fn kill_all(&self) {
        let ids: Vec<InstanceId> = self.sessions.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.kill(&id).await;
        }
    }

    pub fn has(&self, instance_id: &InstanceId) -> bool {
        self.sessions.contains_key(instance_id)
    }

    pub fn backend_kind(&self, instance_id: &InstanceId) -> Option<BackendKind> {
        self.sessions.get(instance_id).map(|s| s.kind)
    }

    pub fn pid(&self, instance_id: &InstanceId) -> Option<u32> {
        self.sessions.get(instance_id).and_then(|s| s.pid)
    }

    /// Scrollback snapshot and a live receiver, consistent with each other
    pub async fn subscribe(&self, instance_id: &InstanceId) -> Result<OutputSubscription, SessionError> {
        let session = self.get(instance_id)?;
        let ring = session.ring.lock().await;
        Ok(OutputSubscription {
            replay: ring.snapshot(),
            live: session.live.subscribe(),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

async fn pump_output(
    mut output: mpsc::UnboundedReceiver<Bytes>,
    ring: Arc<Mutex<OutputRing>>,
    live: broadcast::Sender<Bytes>,
) {
    while let Some(chunk) = output.recv().await {
        // Publish under the ring lock so subscribe() never sees a chunk twice
        let mut ring = ring.lock().await;
        ring.push(&chunk);
        let _ = live.send(chunk);
    }
}

async fn watch_exit(
    session: Arc<Session>,
    exit: tokio::sync::oneshot::Receiver<super::backend::BackendExit>,
    table: Arc<SessionTable>,
    exits: mpsc::UnboundedSender<SessionExit>,
) {
    let exit = tokio::select! {
        _ = session.cancel.cancelled() => return,
        exit = exit => exit,
    };

    if session.cancel.is_cancelled() {
        return;
    }

    let (code, reason) = match exit {
        Ok(exit) => (exit.code, exit.reason),
        Err(_) => (None, "backend dropped without reporting exit".to_string()),
    };

    // Only deregister if the table still holds this exact session
    let removed = table
        .remove_if(&session.instance_id, |_, current| Arc::ptr_eq(current, &session))
        .is_some();
    if !removed {
        return;
    }

    tracing::info!("Session {} ended: {}", session.instance_id, reason);
    let _ = exits.send(SessionExit {
        instance_id: session.instance_id.clone(),
        code,
        reason,
    });
}
