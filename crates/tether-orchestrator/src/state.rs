//! Global orchestrator state

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_core::config::OrchestratorConfig;
use tether_core::traits::{CredentialStore, InstanceStore};

use crate::events::EventBroadcaster;
use crate::hooks::{HookInstaller, RemoteFiles, SshRemoteFiles};
use crate::keychain::MemoryKeychain;
use crate::lifecycle::{ControllerSettings, InstanceController};
use crate::preflight::PreflightRunner;
use crate::session::{BackendLauncher, SessionExit, SessionManager, SystemLauncher};
use crate::ssh::{ConnectionPool, MachineRegistry, RemoteExecutor, SshExecutor};
use crate::store::MemoryInstanceStore;
use crate::tunnel::{PortAllocator, ReverseForwarder, SshReverseForwarder, TunnelManager};

/// The seams between the orchestrator and the outside world
pub struct Collaborators {
    pub launcher: Arc<dyn BackendLauncher>,
    pub forwarder: Arc<dyn ReverseForwarder>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub files: Arc<dyn RemoteFiles>,
    pub store: Arc<dyn InstanceStore>,
}

/// Global state for the orchestrator daemon
pub struct OrchestratorState {
    pub config: OrchestratorConfig,
    pub registry: Arc<MachineRegistry>,
    pub keychain: Arc<dyn CredentialStore>,
    /// Shared SSH connections, absent when running on injected collaborators
    pub pool: Option<Arc<ConnectionPool>>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub sessions: Arc<SessionManager>,
    pub tunnels: Arc<TunnelManager>,
    pub hooks: Arc<HookInstaller>,
    pub preflight: Arc<PreflightRunner>,
    pub controller: Arc<InstanceController>,
    pub events: EventBroadcaster,
    /// Cancelled when the daemon stops; long-lived streams end on it
    pub cancel: CancellationToken,
}

impl OrchestratorState {
    /// Wire every component against real SSH and pty backends.
    ///
    /// Unsolicited session exits arrive on the returned receiver; hand it to
    /// [`InstanceController::run_exit_listener`].
    pub fn new(config: OrchestratorConfig) -> (Self, mpsc::UnboundedReceiver<SessionExit>) {
        let keychain: Arc<dyn CredentialStore> = Arc::new(MemoryKeychain::new());
        let registry = Arc::new(MachineRegistry::with_machines(
            config.machines.clone(),
            keychain.clone(),
        ));
        let pool = Arc::new(ConnectionPool::new(config.ssh.connect_timeout));
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(
            registry.clone(),
            pool.clone(),
            config.ssh.clone(),
        ));

        let collaborators = Collaborators {
            launcher: Arc::new(SystemLauncher::new(registry.clone(), pool.clone())),
            forwarder: Arc::new(SshReverseForwarder::new(
                registry.clone(),
                config.ssh.connect_timeout,
                config.tunnel.remote_bind_address.clone(),
                config.http_bind.clone(),
            )),
            files: Arc::new(SshRemoteFiles::new(executor.clone())),
            executor,
            store: Arc::new(MemoryInstanceStore::new()),
        };

        Self::assemble(config, keychain, registry, Some(pool), collaborators)
    }

    /// Wire every component against the given collaborators
    pub fn with_collaborators(
        config: OrchestratorConfig,
        keychain: Arc<dyn CredentialStore>,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<SessionExit>) {
        let registry = Arc::new(MachineRegistry::with_machines(
            config.machines.clone(),
            keychain.clone(),
        ));
        Self::assemble(config, keychain, registry, None, collaborators)
    }

    fn assemble(
        config: OrchestratorConfig,
        keychain: Arc<dyn CredentialStore>,
        registry: Arc<MachineRegistry>,
        pool: Option<Arc<ConnectionPool>>,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<SessionExit>) {
        let events = EventBroadcaster::new();

        let (sessions, exits) = SessionManager::new(collaborators.launcher, config.scrollback_bytes);
        let sessions = Arc::new(sessions);

        let tunnels = Arc::new(TunnelManager::new(
            collaborators.forwarder,
            PortAllocator::new(config.tunnel.port_range_start, config.tunnel.port_range_end),
            events.clone(),
        ));

        let hooks = Arc::new(HookInstaller::new(
            collaborators.executor.clone(),
            collaborators.files,
            config.hooks.clone(),
        ));

        let preflight = Arc::new(PreflightRunner::new(
            registry.clone(),
            collaborators.executor.clone(),
            hooks.clone(),
            keychain.clone(),
            events.clone(),
            config.assistant_command.as_deref(),
        ));

        let controller = Arc::new(InstanceController::new(
            collaborators.store,
            sessions.clone(),
            tunnels.clone(),
            hooks.clone(),
            registry.clone(),
            events.clone(),
            ControllerSettings {
                assistant_command: config.assistant_command.clone(),
                default_shell: config.default_shell.clone(),
            },
        ));

        let state = Self {
            config,
            registry,
            keychain,
            pool,
            executor: collaborators.executor,
            sessions,
            tunnels,
            hooks,
            preflight,
            controller,
            events,
            cancel: CancellationToken::new(),
        };
        (state, exits)
    }

    /// Kill every session, tear every tunnel down, drop pooled connections
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.controller.shutdown().await;
        if let Some(pool) = &self.pool {
            pool.close_all().await;
        }
    }
}
