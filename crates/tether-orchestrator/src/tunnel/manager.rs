//! Reference-counted reverse tunnels, one per machine
//!
//! Every state change for a machine happens under that machine's slot lock,
//! including the forward open and close. Concurrent `ensure_tunnel` calls
//! therefore queue behind the first one and find the tunnel active, and a
//! teardown waits for an in-flight creation to settle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use tether_core::api::{DashboardEvent, TunnelInfo, TunnelState};
use tether_core::error::TunnelError;
use tether_core::types::{InstanceId, MachineId};

use crate::events::EventBroadcaster;

use super::forward::{ForwardHandle, ReverseForwarder};
use super::ports::PortAllocator;

/// Upper bound on closing one forward; the slot lock is held meanwhile
const FORWARD_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct TunnelSlot {
    state: TunnelState,
    port: Option<u16>,
    dependents: HashSet<InstanceId>,
    forward: Option<Box<dyn ForwardHandle>>,
}

impl TunnelSlot {
    fn info(&self, machine_id: &MachineId) -> TunnelInfo {
        let mut dependents: Vec<InstanceId> = self.dependents.iter().cloned().collect();
        dependents.sort();
        TunnelInfo {
            machine_id: machine_id.clone(),
            state: self.state,
            port: self.port,
            dependents,
        }
    }
}

/// Result of [`TunnelManager::ensure_tunnel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsuredTunnel {
    pub port: u16,
    /// A new forward was started by this call
    pub created: bool,
}

pub struct TunnelManager {
    slots: DashMap<MachineId, Arc<Mutex<TunnelSlot>>>,
    /// Which machine each dependent instance is registered on
    owners: DashMap<InstanceId, MachineId>,
    ports: PortAllocator,
    forwarder: Arc<dyn ReverseForwarder>,
    events: EventBroadcaster,
}

impl TunnelManager {
    pub fn new(
        forwarder: Arc<dyn ReverseForwarder>,
        ports: PortAllocator,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            owners: DashMap::new(),
            ports,
            forwarder,
            events,
        }
    }

    fn slot(&self, machine_id: &MachineId) -> Arc<Mutex<TunnelSlot>> {
        self.slots
            .entry(machine_id.clone())
            .or_default()
            .clone()
    }

    /// Make sure `machine_id` has an active tunnel and record `instance_id`
    /// as depending on it.
    pub async fn ensure_tunnel(
        &self,
        machine_id: &MachineId,
        instance_id: &InstanceId,
    ) -> Result<EnsuredTunnel, TunnelError> {
        let slot = self.slot(machine_id);
        let result = {
            let mut slot = slot.lock().await;
            self.ensure_locked(&mut slot, machine_id, instance_id).await
        };

        if result.is_ok() {
            self.owners.insert(instance_id.clone(), machine_id.clone());
        }
        if matches!(result, Ok(EnsuredTunnel { created: true, .. }) | Err(_)) {
            self.broadcast().await;
        }
        result
    }

    async fn ensure_locked(
        &self,
        slot: &mut TunnelSlot,
        machine_id: &MachineId,
        instance_id: &InstanceId,
    ) -> Result<EnsuredTunnel, TunnelError> {
        if slot.state == TunnelState::Active {
            let alive = slot.forward.as_ref().map(|f| f.is_alive()).unwrap_or(false);
            if let (true, Some(port)) = (alive, slot.port) {
                slot.dependents.insert(instance_id.clone());
                tracing::debug!(
                    "Reusing tunnel on {} port {} ({} dependents)",
                    machine_id,
                    port,
                    slot.dependents.len()
                );
                return Ok(EnsuredTunnel {
                    port,
                    created: false,
                });
            }

            tracing::warn!("Tunnel on {} lost its connection, recreating", machine_id);
            self.teardown(slot, machine_id).await;
        }

        slot.state = TunnelState::Creating;
        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                slot.state = TunnelState::None;
                return Err(e);
            }
        };

        match self.forwarder.open(machine_id, port).await {
            Ok(forward) => {
                slot.forward = Some(forward);
                slot.port = Some(port);
                slot.state = TunnelState::Active;
                slot.dependents.insert(instance_id.clone());
                tracing::info!("Tunnel on {} active on port {}", machine_id, port);
                Ok(EnsuredTunnel {
                    port,
                    created: true,
                })
            }
            Err(e) => {
                self.ports.release(port);
                slot.port = None;
                slot.state = TunnelState::None;
                tracing::warn!("Tunnel creation for {} failed: {}", machine_id, e);
                Err(e)
            }
        }
    }

    /// `active -> closing -> closed`, keeping the dependent set
    async fn teardown(&self, slot: &mut TunnelSlot, machine_id: &MachineId) {
        slot.state = TunnelState::Closing;
        if let Some(forward) = slot.forward.take() {
            if tokio::time::timeout(FORWARD_CLOSE_TIMEOUT, forward.close())
                .await
                .is_err()
            {
                tracing::warn!(
                    "Closing the forward on {} took longer than {:?}, dropping it",
                    machine_id,
                    FORWARD_CLOSE_TIMEOUT
                );
            }
        }
        if let Some(port) = slot.port.take() {
            self.ports.release(port);
        }
        slot.state = TunnelState::Closed;
        tracing::info!("Tunnel on {} closed", machine_id);
    }

    /// Drop `instance_id` from whichever tunnel it depends on, closing the
    /// tunnel when nobody is left. Safe to call repeatedly.
    pub async fn release_tunnel(&self, instance_id: &InstanceId) {
        let Some((_, machine_id)) = self.owners.remove(instance_id) else {
            return;
        };
        let Some(slot) = self.slots.get(&machine_id).map(|s| Arc::clone(&s)) else {
            return;
        };

        let closed = {
            let mut slot = slot.lock().await;
            if !slot.dependents.remove(instance_id) {
                return;
            }
            tracing::debug!(
                "{} released tunnel on {} ({} remaining)",
                instance_id,
                machine_id,
                slot.dependents.len()
            );

            if slot.dependents.is_empty() && slot.state == TunnelState::Active {
                self.teardown(&mut slot, &machine_id).await;
                true
            } else {
                false
            }
        };

        if closed {
            self.broadcast().await;
        }
    }

    pub async fn state(&self, machine_id: &MachineId) -> TunnelState {
        match self.slots.get(machine_id).map(|s| Arc::clone(&s)) {
            Some(slot) => slot.lock().await.state,
            None => TunnelState::None,
        }
    }

    /// Port of the machine's active tunnel
    pub async fn active_port(&self, machine_id: &MachineId) -> Option<u16> {
        let slot = self.slots.get(machine_id).map(|s| Arc::clone(&s))?;
        let slot = slot.lock().await;
        (slot.state == TunnelState::Active).then_some(slot.port).flatten()
    }

    /// Whether `instance_id` currently holds a tunnel dependency
    pub fn depends_on(&self, instance_id: &InstanceId) -> bool {
        self.owners.contains_key(instance_id)
    }

    /// Number of instances depending on the machine's tunnel
    pub async fn dependent_count(&self, machine_id: &MachineId) -> usize {
        match self.slots.get(machine_id).map(|s| Arc::clone(&s)) {
            Some(slot) => slot.lock().await.dependents.len(),
            None => 0,
        }
    }

    /// Snapshot of every known tunnel, ordered by machine
    pub async fn list(&self) -> Vec<TunnelInfo> {
        let slots: Vec<(MachineId, Arc<Mutex<TunnelSlot>>)> = self
            .slots
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();

        let mut tunnels = Vec::with_capacity(slots.len());
        for (machine_id, slot) in slots {
            tunnels.push(slot.lock().await.info(&machine_id));
        }
        tunnels.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        tunnels
    }

    /// Tear every tunnel down regardless of dependents (shutdown)
    pub async fn shutdown(&self) {
        let slots: Vec<(MachineId, Arc<Mutex<TunnelSlot>>)> = self
            .slots
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();

        for (machine_id, slot) in slots {
            let mut slot = slot.lock().await;
            if slot.state == TunnelState::Active {
                self.teardown(&mut slot, &machine_id).await;
            }
            slot.dependents.clear();
        }
        self.owners.clear();
    }

    async fn broadcast(&self) {
        let tunnels = self.list().await;
        self.events.emit(DashboardEvent::PortsUpdated { tunnels });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::FakeForwarder;

    fn manager(forwarder: Arc<FakeForwarder>) -> TunnelManager {
        TunnelManager::new(
            forwarder,
            PortAllocator::new(47100, 47199),
            EventBroadcaster::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_forward_close_still_closes_slot() {
        let forwarder = Arc::new(FakeForwarder::new());
        let tunnels = manager(forwarder.clone());
        let machine = MachineId::new("m");
        let a = InstanceId::new("a");

        tunnels.ensure_tunnel(&machine, &a).await.unwrap();
        forwarder.stall_close(true);
        tunnels.release_tunnel(&a).await;
        assert_eq!(tunnels.state(&machine).await, TunnelState::Closed);

        // The slot is usable again
        forwarder.stall_close(false);
        let again = tunnels.ensure_tunnel(&machine, &a).await.unwrap();
        assert!(again.created);
        assert_eq!(forwarder.opened(), 2);
    }

    #[tokio::test]
    async fn test_release_without_tunnel_is_noop() {
        let tunnels = manager(Arc::new(FakeForwarder::new()));
        tunnels.release_tunnel(&InstanceId::new("nobody")).await;
        tunnels.release_tunnel(&InstanceId::new("nobody")).await;
        assert!(tunnels.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_dependent_reuses_forward() {
        let forwarder = Arc::new(FakeForwarder::new());
        let tunnels = manager(forwarder.clone());
        let machine = MachineId::new("m");

        let a = tunnels.ensure_tunnel(&machine, &InstanceId::new("a")).await.unwrap();
        let b = tunnels.ensure_tunnel(&machine, &InstanceId::new("b")).await.unwrap();

        assert!(a.created);
        assert!(!b.created);
        assert_eq!(a.port, b.port);
        assert_eq!(forwarder.opened(), 1);
        assert_eq!(tunnels.dependent_count(&machine).await, 2);
    }

    #[tokio::test]
    async fn test_double_release_does_not_steal_other_dependency() {
        let forwarder = Arc::new(FakeForwarder::new());
        let tunnels = manager(forwarder.clone());
        let machine = MachineId::new("m");
        let a = InstanceId::new("a");
        let b = InstanceId::new("b");

        tunnels.ensure_tunnel(&machine, &a).await.unwrap();
        tunnels.ensure_tunnel(&machine, &b).await.unwrap();

        tunnels.release_tunnel(&a).await;
        tunnels.release_tunnel(&a).await;

        assert_eq!(tunnels.state(&machine).await, TunnelState::Active);
        assert_eq!(tunnels.dependent_count(&machine).await, 1);
        assert_eq!(forwarder.closed(), 0);
    }

    #[tokio::test]
    async fn test_failed_creation_returns_to_none() {
        let forwarder = Arc::new(FakeForwarder::new());
        forwarder.fail_next("connection refused");
        let tunnels = manager(forwarder.clone());
        let machine = MachineId::new("m");

        let err = tunnels
            .ensure_tunnel(&machine, &InstanceId::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Creation { .. }));
        assert_eq!(tunnels.state(&machine).await, TunnelState::None);
        assert_eq!(tunnels.ports.in_use(), 0);

        // A retry goes through creating again
        let ok = tunnels.ensure_tunnel(&machine, &InstanceId::new("a")).await.unwrap();
        assert!(ok.created);
    }

    #[tokio::test]
    async fn test_dead_forward_is_recreated() {
        let forwarder = Arc::new(FakeForwarder::new());
        let tunnels = manager(forwarder.clone());
        let machine = MachineId::new("m");

        tunnels.ensure_tunnel(&machine, &InstanceId::new("a")).await.unwrap();
        forwarder.kill_all();

        let again = tunnels.ensure_tunnel(&machine, &InstanceId::new("b")).await.unwrap();
        assert!(again.created);
        assert_eq!(forwarder.opened(), 2);
        assert_eq!(forwarder.closed(), 1);
        assert_eq!(tunnels.dependent_count(&machine).await, 2);
    }

    #[tokio::test]
    async fn test_ports_updated_on_create_and_close() {
        let forwarder = Arc::new(FakeForwarder::new());
        let tunnels = manager(forwarder);
        let mut events = tunnels.events.subscribe();
        let machine = MachineId::new("m");
        let a = InstanceId::new("a");

        tunnels.ensure_tunnel(&machine, &a).await.unwrap();
        match events.recv().await.unwrap() {
            DashboardEvent::PortsUpdated { tunnels } => {
                assert_eq!(tunnels[0].state, TunnelState::Active)
            }
            other => panic!("unexpected event {:?}", other),
        }

        tunnels.release_tunnel(&a).await;
        match events.recv().await.unwrap() {
            DashboardEvent::PortsUpdated { tunnels } => {
                assert_eq!(tunnels[0].state, TunnelState::Closed);
                assert_eq!(tunnels[0].port, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
