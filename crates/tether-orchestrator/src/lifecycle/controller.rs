//! Instance lifecycle controller
//!
//! The entry point for every instance command. It validates input, drives
//! the session, tunnel and hook components, persists the result and ends
//! every state change with a broadcast event.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_core::api::{
    CreateInstanceRequest, DashboardEvent, HookCallback, HookEventKind, InstallHooksResponse,
    TunnelOutcome, UninstallHooksResponse, UpdateInstanceRequest,
};
use tether_core::error::{OrchestratorError, SessionError};
use tether_core::time::current_time_millis;
use tether_core::traits::InstanceStore;
use tether_core::types::{
    ExecutionTarget, Instance, InstanceId, InstanceStatus, MachineId, TerminalSize,
};

use crate::events::EventBroadcaster;
use crate::hooks::HookInstaller;
use crate::session::{BackendSpec, SessionExit, SessionManager};
use crate::ssh::{expand_home, MachineRegistry};
use crate::tunnel::{tunnel_url, TunnelManager};

use super::locks::InstanceLocks;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Session defaults applied to every new instance
#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    pub assistant_command: Option<String>,
    pub default_shell: Option<String>,
}

pub struct InstanceController {
    store: Arc<dyn InstanceStore>,
    sessions: Arc<SessionManager>,
    tunnels: Arc<TunnelManager>,
    hooks: Arc<HookInstaller>,
    registry: Arc<MachineRegistry>,
    events: EventBroadcaster,
    locks: InstanceLocks,
    settings: ControllerSettings,
}

impl InstanceController {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        sessions: Arc<SessionManager>,
        tunnels: Arc<TunnelManager>,
        hooks: Arc<HookInstaller>,
        registry: Arc<MachineRegistry>,
        events: EventBroadcaster,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            sessions,
            tunnels,
            hooks,
            registry,
            events,
            locks: InstanceLocks::new(),
            settings,
        }
    }

    async fn require(&self, id: &InstanceId) -> Result<Instance> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.to_string()))
    }

    async fn require_open(&self, id: &InstanceId) -> Result<Instance> {
        let instance = self.require(id).await?;
        if instance.is_closed() {
            return Err(OrchestratorError::InstanceNotFound(format!("{} (closed)", id)));
        }
        Ok(instance)
    }

    async fn next_display_order(&self) -> Result<i64> {
        let rows = self.store.all().await?;
        Ok(rows
            .iter()
            .filter(|i| !i.is_closed())
            .map(|i| i.display_order)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0))
    }

    fn backend_spec(&self, req: &CreateInstanceRequest, machine_id: Option<&MachineId>) -> BackendSpec {
        let size = TerminalSize::default();
        let startup_command = self.settings.assistant_command.clone();

        match machine_id {
            Some(machine_id) => BackendSpec::Ssh {
                machine_id: machine_id.clone(),
                working_dir: req.working_dir.clone(),
                startup_command,
                env: Vec::new(),
                size,
            },
            None => BackendSpec::Local {
                working_dir: expand_home(Path::new(&req.working_dir)),
                shell: self.settings.default_shell.clone(),
                startup_command,
                env: Vec::new(),
                size,
            },
        }
    }

    /// Validate, spawn, persist, announce. Nothing is committed unless the
    /// backend started.
    pub async fn create_instance(&self, req: CreateInstanceRequest) -> Result<Instance> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(OrchestratorError::validation("name is required"));
        }
        if req.working_dir.trim().is_empty() {
            return Err(OrchestratorError::validation("workingDir is required"));
        }

        let machine_id = match (req.machine_type, &req.machine_id) {
            (ExecutionTarget::Remote, Some(id)) if !id.as_str().trim().is_empty() => {
                if !self.registry.contains(id) {
                    return Err(OrchestratorError::MachineNotFound(id.to_string()));
                }
                Some(id.clone())
            }
            (ExecutionTarget::Remote, _) => {
                return Err(OrchestratorError::validation(
                    "machineId is required for remote instances",
                ))
            }
            (ExecutionTarget::Local, Some(_)) => {
                return Err(OrchestratorError::validation(
                    "machineId is only valid for remote instances",
                ))
            }
            (ExecutionTarget::Local, None) => None,
        };

        let id = InstanceId::generate();
        let _guard = self.locks.lock(&id).await;
        let display_order = self.next_display_order().await?;

        let spec = self.backend_spec(&req, machine_id.as_ref());
        let remote = machine_id.is_some();
        let pid = self.sessions.spawn(&id, spec).await.map_err(|e| {
            let reason = match e {
                SessionError::Spawn(reason) => reason,
                other => other.to_string(),
            };
            tracing::warn!("Spawn for {} failed: {}", name, reason);
            if remote {
                OrchestratorError::RemoteSpawn(reason)
            } else {
                OrchestratorError::SessionSpawn(reason)
            }
        })?;

        let now = current_time_millis();
        let instance = Instance {
            id: id.clone(),
            name,
            working_dir: req.working_dir,
            status: InstanceStatus::Idle,
            machine_type: req.machine_type,
            machine_id,
            pid,
            pinned: false,
            display_order,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };

        if let Err(e) = self.store.insert(&instance).await {
            // No row, no session
            self.sessions.kill(&id).await;
            return Err(e.into());
        }

        tracing::info!(
            "Instance {} created ({}, {})",
            instance.id,
            instance.machine_type,
            instance.working_dir
        );
        self.events.emit(DashboardEvent::InstanceCreated {
            instance: instance.clone(),
        });
        Ok(instance)
    }

    /// Kill the session, drop the tunnel dependency, mark closed. Closing a
    /// closed instance returns it unchanged.
    pub async fn close_instance(&self, id: &InstanceId) -> Result<Instance> {
        let _guard = self.locks.lock(id).await;
        let mut instance = self.require(id).await?;
        if instance.is_closed() {
            return Ok(instance);
        }

        self.sessions.kill(id).await;
        self.tunnels.release_tunnel(id).await;

        let now = current_time_millis();
        instance.status = InstanceStatus::Disconnected;
        instance.closed_at = Some(now);
        instance.updated_at = now;
        self.store.update(&instance).await?;

        tracing::info!("Instance {} closed", id);
        self.events.emit(DashboardEvent::InstanceClosed {
            instance: instance.clone(),
        });
        Ok(instance)
    }

    pub async fn update_instance(&self, id: &InstanceId, req: UpdateInstanceRequest) -> Result<Instance> {
        let _guard = self.locks.lock(id).await;
        let mut instance = self.require_open(id).await?;

        if let Some(name) = req.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(OrchestratorError::validation("name cannot be empty"));
            }
            instance.name = name.to_string();
        }
        if let Some(pinned) = req.pinned {
            instance.pinned = pinned;
        }
        instance.updated_at = current_time_millis();
        self.store.update(&instance).await?;

        self.events.emit(DashboardEvent::InstanceUpdated {
            instance: instance.clone(),
        });
        Ok(instance)
    }

    /// Assign `display_order` by position in `ids`
    pub async fn reorder_instances(&self, ids: Vec<InstanceId>) -> Result<()> {
        for id in &ids {
            self.require_open(id).await?;
        }

        for (position, id) in ids.iter().enumerate() {
            let _guard = self.locks.lock(id).await;
            let mut instance = self.require_open(id).await?;
            instance.display_order = position as i64;
            instance.updated_at = current_time_millis();
            self.store.update(&instance).await?;
        }

        self.events.emit(DashboardEvent::InstancesReordered { ids });
        Ok(())
    }

    pub async fn send_input(&self, id: &InstanceId, data: Bytes) -> Result<()> {
        self.require_open(id).await?;
        self.sessions.write(id, data).await?;
        Ok(())
    }

    pub async fn resize(&self, id: &InstanceId, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(OrchestratorError::validation("cols and rows must be positive"));
        }
        self.require_open(id).await?;
        self.sessions.resize(id, TerminalSize { cols, rows }).await?;
        Ok(())
    }

    pub async fn get_instance(&self, id: &InstanceId) -> Result<Instance> {
        self.require(id).await
    }

    /// Open instances, pinned first, then by display order
    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .store
            .all()
            .await?
            .into_iter()
            .filter(|i| !i.is_closed())
            .collect();
        instances.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(a.display_order.cmp(&b.display_order))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(instances)
    }

    fn remote_machine(instance: &Instance) -> Result<MachineId> {
        match (&instance.machine_type, &instance.machine_id) {
            (ExecutionTarget::Remote, Some(machine_id)) => Ok(machine_id.clone()),
            _ => Err(OrchestratorError::UnsupportedOperation(
                "Hooks can only be managed on remote instances".to_string(),
            )),
        }
    }

    /// Ensure the machine's tunnel, then point the remote hooks at it.
    ///
    /// With a tunnel the hooks call the remote end of the forward; if the
    /// tunnel fails they fall back to `orchestrator_url` and the response
    /// says so.
    pub async fn install_hooks(
        &self,
        id: &InstanceId,
        orchestrator_url: Option<String>,
    ) -> Result<InstallHooksResponse> {
        let orchestrator_url = orchestrator_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| OrchestratorError::validation("orchestratorUrl is required"))?;

        // A close queued ahead of us must win: check openness under the lock
        let _guard = self.locks.lock(id).await;
        let instance = self.require_open(id).await?;
        let machine_id = Self::remote_machine(&instance)?;
        let had_dependency = self.tunnels.depends_on(id);

        let (tunnel, tunnel_port, tunnel_error) =
            match self.tunnels.ensure_tunnel(&machine_id, id).await {
                Ok(t) if t.created => (TunnelOutcome::Created, Some(t.port), None),
                Ok(t) => (TunnelOutcome::Reused, Some(t.port), None),
                Err(e) => {
                    tracing::warn!("No tunnel for {}: {}", machine_id, e);
                    (TunnelOutcome::Failed, None, Some(e.to_string()))
                }
            };
        let hook_url = tunnel_port.map(tunnel_url).unwrap_or(orchestrator_url);

        let missing_tools = match self.hooks.check_required_tools(&machine_id).await {
            Ok(report) => report.missing,
            Err(e) => {
                tracing::warn!("Could not probe tools on {}: {}", machine_id, e);
                Vec::new()
            }
        };

        let outcome = match self.hooks.install(&machine_id, &hook_url).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if tunnel_port.is_some() && !had_dependency {
                    self.tunnels.release_tunnel(id).await;
                }
                return Err(e.into());
            }
        };

        self.events.emit(DashboardEvent::HooksInstalled {
            instance_id: id.clone(),
            machine_id: machine_id.clone(),
        });

        Ok(InstallHooksResponse {
            success: true,
            message: outcome.message,
            tunnel,
            tunnel_active: Some(tunnel_port.is_some()),
            tunnel_error,
            tunnel_port,
            hook_url,
            backup_path: outcome.backup_path,
            missing_tools,
        })
    }

    /// Drop this instance's tunnel dependency and remove the managed hooks
    /// once no other instance on the machine relies on them.
    pub async fn uninstall_hooks(&self, id: &InstanceId) -> Result<UninstallHooksResponse> {
        let _guard = self.locks.lock(id).await;
        let instance = self.require(id).await?;
        let machine_id = Self::remote_machine(&instance)?;
        self.tunnels.release_tunnel(id).await;

        let remaining = self.tunnels.dependent_count(&machine_id).await;
        let (message, removed) = if remaining > 0 {
            (
                format!(
                    "Hooks kept: {} other instance(s) on {} still use them",
                    remaining, machine_id
                ),
                0,
            )
        } else {
            let outcome = self.hooks.uninstall(&machine_id).await?;
            (outcome.message, outcome.removed)
        };

        self.events.emit(DashboardEvent::HooksUninstalled {
            instance_id: id.clone(),
            machine_id,
        });

        Ok(UninstallHooksResponse {
            success: true,
            message,
            removed,
        })
    }

    /// Apply a hook callback from a remote assistant
    pub async fn handle_hook_event(&self, kind: HookEventKind, callback: HookCallback) -> Result<Instance> {
        let id = callback.instance_id;
        let _guard = self.locks.lock(&id).await;
        let instance = self.require(&id).await?;
        if instance.is_closed() {
            tracing::debug!("Ignoring {} hook for closed instance {}", kind.slug(), id);
            return Ok(instance);
        }
        self.set_status(instance, kind.resulting_status()).await
    }

    /// Mark an instance disconnected after its backend died on its own
    pub async fn handle_session_exit(&self, exit: SessionExit) -> Result<()> {
        let _guard = self.locks.lock(&exit.instance_id).await;
        let Some(instance) = self.store.get(&exit.instance_id).await? else {
            return Ok(());
        };
        if instance.is_closed() {
            return Ok(());
        }

        tracing::warn!("Instance {} disconnected: {}", exit.instance_id, exit.reason);
        self.set_status(instance, InstanceStatus::Disconnected).await?;
        Ok(())
    }

    async fn set_status(&self, mut instance: Instance, status: InstanceStatus) -> Result<Instance> {
        if instance.status == status {
            return Ok(instance);
        }
        instance.status = status;
        instance.updated_at = current_time_millis();
        self.store.update(&instance).await?;

        tracing::debug!("Instance {} is now {}", instance.id, status);
        self.events.emit(DashboardEvent::InstanceStatus {
            instance_id: instance.id.clone(),
            status,
        });
        Ok(instance)
    }

    /// Consume session exits until cancelled
    pub async fn run_exit_listener(
        self: Arc<Self>,
        mut exits: mpsc::UnboundedReceiver<SessionExit>,
        cancel: CancellationToken,
    ) {
        loop {
            let exit = tokio::select! {
                _ = cancel.cancelled() => break,
                exit = exits.recv() => match exit {
                    Some(exit) => exit,
                    None => break,
                },
            };
            if let Err(e) = self.handle_session_exit(exit).await {
                tracing::error!("Failed to record session exit: {}", e);
            }
        }
        tracing::debug!("Session exit listener stopped");
    }

    /// Kill every session and tear every tunnel down
    pub async fn shutdown(&self) {
        self.sessions.kill_all().await;
        self.tunnels.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryKeychain;
    use crate::testsupport::{FailingStore, FakeExecutor, FakeForwarder, FakeLauncher, MemoryRemoteFiles};
    use crate::tunnel::PortAllocator;
    use tether_core::api::TunnelState;
    use tether_core::config::HookSettings;
    use tether_core::types::RemoteMachine;

    struct Fixture {
        controller: Arc<InstanceController>,
        store: Arc<FailingStore>,
        launcher: Arc<FakeLauncher>,
        forwarder: Arc<FakeForwarder>,
        files: Arc<MemoryRemoteFiles>,
        tunnels: Arc<TunnelManager>,
        sessions: Arc<SessionManager>,
        events: EventBroadcaster,
        exits: Option<mpsc::UnboundedReceiver<SessionExit>>,
    }

    fn fixture() -> Fixture {
        let events = EventBroadcaster::new();
        let keychain = Arc::new(MemoryKeychain::new());
        let registry = Arc::new(MachineRegistry::new(keychain));
        registry.register(RemoteMachine::new("machine-123", "10.0.0.5", "ops"));

        let launcher = Arc::new(FakeLauncher::new());
        let (sessions, exits) = SessionManager::new(launcher.clone(), 1024);
        let sessions = Arc::new(sessions);

        let forwarder = Arc::new(FakeForwarder::new());
        let tunnels = Arc::new(TunnelManager::new(
            forwarder.clone(),
            PortAllocator::new(47100, 47199),
            events.clone(),
        ));

        let files = Arc::new(MemoryRemoteFiles::new());
        let hooks = Arc::new(HookInstaller::new(
            Arc::new(FakeExecutor::new()),
            files.clone(),
            HookSettings::default(),
        ));

        let store = Arc::new(FailingStore::new());
        let controller = Arc::new(InstanceController::new(
            store.clone(),
            sessions.clone(),
            tunnels.clone(),
            hooks,
            registry,
            events.clone(),
            ControllerSettings {
                assistant_command: Some("claude".into()),
                default_shell: None,
            },
        ));

        Fixture {
            controller,
            store,
            launcher,
            forwarder,
            files,
            tunnels,
            sessions,
            events,
            exits: Some(exits),
        }
    }

    fn local(name: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: name.into(),
            working_dir: "/tmp".into(),
            machine_type: ExecutionTarget::Local,
            machine_id: None,
        }
    }

    fn remote(name: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: name.into(),
            working_dir: "~/src/api".into(),
            machine_type: ExecutionTarget::Remote,
            machine_id: Some(MachineId::new("machine-123")),
        }
    }

    const URL: &str = "http://127.0.0.1:7420";
    const SETTINGS: &str = ".claude/settings.json";

    #[tokio::test]
    async fn test_create_local_instance() {
        let f = fixture();
        let mut events = f.events.subscribe();

        let instance = f.controller.create_instance(local("api")).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Idle);
        assert!(instance.pid.is_some());
        assert!(f.sessions.has(&instance.id));
        assert_eq!(f.store.inserts(), 1);
        assert_eq!(events.recv().await.unwrap().name(), "instance:created");
    }

    #[tokio::test]
    async fn test_remote_without_machine_is_rejected_before_spawn() {
        let f = fixture();
        let mut req = remote("api");
        req.machine_id = None;

        let err = f.controller.create_instance(req).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(f.launcher.launched().is_empty());
        assert_eq!(f.store.inserts(), 0);
    }

    #[tokio::test]
    async fn test_local_with_machine_is_rejected() {
        let f = fixture();
        let mut req = local("api");
        req.machine_id = Some(MachineId::new("machine-123"));

        let err = f.controller.create_instance(req).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_machine() {
        let f = fixture();
        let mut req = remote("api");
        req.machine_id = Some(MachineId::new("ghost"));

        let err = f.controller.create_instance(req).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(f.launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn test_remote_spawn_failure_persists_nothing() {
        let f = fixture();
        f.launcher.fail_next("Authentication failed");

        let err = f.controller.create_instance(remote("api")).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(
            err.to_string(),
            "Failed to connect to remote machine: Authentication failed"
        );
        assert_eq!(f.store.inserts(), 0);
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_kills_session() {
        let f = fixture();
        f.store.fail_inserts(true);

        let err = f.controller.create_instance(local("api")).await.unwrap_err();
        assert_eq!(err.code(), "STORE_ERROR");
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_remote_spec_carries_unexpanded_dir() {
        let f = fixture();
        f.controller.create_instance(remote("api")).await.unwrap();

        let (_, spec) = f.launcher.launched().remove(0);
        match spec {
            BackendSpec::Ssh {
                machine_id,
                working_dir,
                startup_command,
                ..
            } => {
                assert_eq!(machine_id, MachineId::new("machine-123"));
                assert_eq!(working_dir, "~/src/api");
                assert_eq!(startup_command.as_deref(), Some("claude"));
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_orders_pinned_then_display_order() {
        let f = fixture();
        let a = f.controller.create_instance(local("a")).await.unwrap();
        let b = f.controller.create_instance(local("b")).await.unwrap();
        let c = f.controller.create_instance(local("c")).await.unwrap();
        assert_eq!((a.display_order, b.display_order, c.display_order), (0, 1, 2));

        f.controller
            .update_instance(&c.id, UpdateInstanceRequest { name: None, pinned: Some(true) })
            .await
            .unwrap();
        f.controller.close_instance(&b.id).await.unwrap();

        let names: Vec<String> = f
            .controller
            .list_instances()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_reorder_rejects_unknown_id() {
        let f = fixture();
        let a = f.controller.create_instance(local("a")).await.unwrap();

        let err = f
            .controller
            .reorder_instances(vec![a.id.clone(), InstanceId::new("ghost")])
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(f.controller.get_instance(&a.id).await.unwrap().display_order, 0);
    }

    #[tokio::test]
    async fn test_reorder_assigns_positions() {
        let f = fixture();
        let a = f.controller.create_instance(local("a")).await.unwrap();
        let b = f.controller.create_instance(local("b")).await.unwrap();

        f.controller
            .reorder_instances(vec![b.id.clone(), a.id.clone()])
            .await
            .unwrap();
        assert_eq!(f.controller.get_instance(&b.id).await.unwrap().display_order, 0);
        assert_eq!(f.controller.get_instance(&a.id).await.unwrap().display_order, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = fixture();
        let instance = f.controller.create_instance(local("a")).await.unwrap();

        let closed = f.controller.close_instance(&instance.id).await.unwrap();
        assert!(closed.is_closed());
        assert_eq!(closed.status, InstanceStatus::Disconnected);
        assert!(!f.sessions.has(&instance.id));

        let again = f.controller.close_instance(&instance.id).await.unwrap();
        assert_eq!(again.closed_at, closed.closed_at);
    }

    #[tokio::test]
    async fn test_input_to_closed_instance() {
        let f = fixture();
        let instance = f.controller.create_instance(local("a")).await.unwrap();
        f.controller.close_instance(&instance.id).await.unwrap();

        let err = f
            .controller
            .send_input(&instance.id, Bytes::from_static(b"ls\n"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_install_hooks_creates_then_reuses_tunnel() {
        let f = fixture();
        let first = f.controller.create_instance(remote("a")).await.unwrap();
        let second = f.controller.create_instance(remote("b")).await.unwrap();

        let one = f
            .controller
            .install_hooks(&first.id, Some(URL.into()))
            .await
            .unwrap();
        assert_eq!(one.tunnel, TunnelOutcome::Created);
        assert_eq!(one.hook_url, "http://127.0.0.1:47100");

        let two = f
            .controller
            .install_hooks(&second.id, Some(URL.into()))
            .await
            .unwrap();
        assert_eq!(two.tunnel, TunnelOutcome::Reused);
        assert_eq!(two.tunnel_port, one.tunnel_port);
        assert_eq!(f.forwarder.opened(), 1);

        f.controller.close_instance(&first.id).await.unwrap();
        assert_eq!(
            f.tunnels.state(&MachineId::new("machine-123")).await,
            TunnelState::Active
        );
        f.controller.close_instance(&second.id).await.unwrap();
        assert_eq!(
            f.tunnels.state(&MachineId::new("machine-123")).await,
            TunnelState::Closed
        );
    }

    #[tokio::test]
    async fn test_install_hooks_falls_back_when_tunnel_fails() {
        let f = fixture();
        let instance = f.controller.create_instance(remote("a")).await.unwrap();
        f.forwarder.fail_next("connection refused");

        let response = f
            .controller
            .install_hooks(&instance.id, Some(URL.into()))
            .await
            .unwrap();
        assert_eq!(response.tunnel, TunnelOutcome::Failed);
        assert_eq!(response.tunnel_active, Some(false));
        assert!(response.tunnel_error.is_some());
        assert_eq!(response.hook_url, URL);
    }

    #[tokio::test]
    async fn test_install_hooks_requires_url() {
        let f = fixture();
        let instance = f.controller.create_instance(remote("a")).await.unwrap();

        let err = f.controller.install_hooks(&instance.id, None).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(f.forwarder.opened(), 0);
    }

    #[tokio::test]
    async fn test_install_hooks_on_local_instance() {
        let f = fixture();
        let instance = f.controller.create_instance(local("a")).await.unwrap();

        let err = f
            .controller
            .install_hooks(&instance.id, Some(URL.into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_OPERATION");
    }

    #[tokio::test]
    async fn test_failed_hook_write_releases_new_tunnel() {
        let f = fixture();
        let instance = f.controller.create_instance(remote("a")).await.unwrap();
        let machine = MachineId::new("machine-123");
        f.files.put(&machine, SETTINGS, r#"{"theme":"dark"}"#);
        f.files.fail_writes(true);

        let err = f
            .controller
            .install_hooks(&instance.id, Some(URL.into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PARTIAL_INSTALL");
        assert_eq!(f.tunnels.dependent_count(&machine).await, 0);
        assert_eq!(f.files.get(&machine, SETTINGS).as_deref(), Some(r#"{"theme":"dark"}"#));
    }

    #[tokio::test]
    async fn test_install_queued_behind_close_opens_no_tunnel() {
        let f = fixture();
        let instance = f.controller.create_instance(remote("a")).await.unwrap();
        let machine = MachineId::new("machine-123");

        let held = f.controller.locks.lock(&instance.id).await;
        let close = {
            let controller = f.controller.clone();
            let id = instance.id.clone();
            tokio::spawn(async move { controller.close_instance(&id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let install = {
            let controller = f.controller.clone();
            let id = instance.id.clone();
            tokio::spawn(async move { controller.install_hooks(&id, Some(URL.into())).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(held);

        let closed = close.await.unwrap().unwrap();
        assert!(closed.is_closed());
        let err = install.await.unwrap().unwrap_err();
        assert_eq!(err.status_code(), 404);

        assert_eq!(f.tunnels.dependent_count(&machine).await, 0);
        assert_eq!(f.forwarder.opened(), 0);
        assert_ne!(f.tunnels.state(&machine).await, TunnelState::Active);
    }

    #[tokio::test]
    async fn test_uninstall_queued_behind_close_leaves_no_dependents() {
        let f = fixture();
        let a = f.controller.create_instance(remote("a")).await.unwrap();
        let machine = MachineId::new("machine-123");
        f.controller.install_hooks(&a.id, Some(URL.into())).await.unwrap();

        let held = f.controller.locks.lock(&a.id).await;
        let close = {
            let controller = f.controller.clone();
            let id = a.id.clone();
            tokio::spawn(async move { controller.close_instance(&id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let uninstall = {
            let controller = f.controller.clone();
            let id = a.id.clone();
            tokio::spawn(async move { controller.uninstall_hooks(&id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(held);

        close.await.unwrap().unwrap();
        uninstall.await.unwrap().unwrap();
        assert_eq!(f.tunnels.dependent_count(&machine).await, 0);
        assert_eq!(f.forwarder.closed(), 1);
    }

    #[tokio::test]
    async fn test_closed_instances_leave_no_lock_entries() {
        let f = fixture();
        for name in ["a", "b", "c"] {
            let instance = f.controller.create_instance(local(name)).await.unwrap();
            f.controller.close_instance(&instance.id).await.unwrap();
        }
        assert!(f.controller.locks.is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_keeps_hooks_for_other_dependents() {
        let f = fixture();
        let machine = MachineId::new("machine-123");
        let a = f.controller.create_instance(remote("a")).await.unwrap();
        let b = f.controller.create_instance(remote("b")).await.unwrap();
        f.controller.install_hooks(&a.id, Some(URL.into())).await.unwrap();
        f.controller.install_hooks(&b.id, Some(URL.into())).await.unwrap();

        let kept = f.controller.uninstall_hooks(&a.id).await.unwrap();
        assert_eq!(kept.removed, 0);
        assert!(f.files.get(&machine, SETTINGS).unwrap().contains("tether-hook"));

        let removed = f.controller.uninstall_hooks(&b.id).await.unwrap();
        assert!(removed.removed > 0);
        assert!(!f.files.get(&machine, SETTINGS).unwrap().contains("tether-hook"));
    }

    #[tokio::test]
    async fn test_hook_event_sets_status() {
        let f = fixture();
        let instance = f.controller.create_instance(remote("a")).await.unwrap();
        let mut events = f.events.subscribe();

        let updated = f
            .controller
            .handle_hook_event(
                HookEventKind::PromptSubmit,
                HookCallback {
                    instance_id: instance.id.clone(),
                    payload: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, InstanceStatus::Working);
        assert_eq!(events.recv().await.unwrap().name(), "instance:status");
    }

    #[tokio::test]
    async fn test_backend_exit_marks_disconnected() {
        let mut f = fixture();
        let instance = f.controller.create_instance(local("a")).await.unwrap();

        let cancel = CancellationToken::new();
        let listener = tokio::spawn(
            f.controller
                .clone()
                .run_exit_listener(f.exits.take().unwrap(), cancel.clone()),
        );

        f.launcher.exit(&instance.id, Some(0), "process exited with code 0");
        let mut status = InstanceStatus::Idle;
        for _ in 0..50 {
            status = f.controller.get_instance(&instance.id).await.unwrap().status;
            if status == InstanceStatus::Disconnected {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, InstanceStatus::Disconnected);

        cancel.cancel();
        listener.await.unwrap();
    }
}
