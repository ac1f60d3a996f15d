//! Per-instance operation locks

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use tether_core::types::InstanceId;

/// Serializes state-changing operations on the same instance while letting
/// different instances proceed independently.
///
/// An entry lives only while someone holds or waits for it.
#[derive(Default)]
pub struct InstanceLocks {
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
}

/// Held lock for one instance; releasing the last holder drops the entry
pub struct InstanceGuard<'a> {
    locks: &'a InstanceLocks,
    id: InstanceId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: &InstanceId) -> InstanceGuard<'_> {
        let lock = self.locks.entry(id.clone()).or_default().clone();
        InstanceGuard {
            locks: self,
            id: id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Instances with a live entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so a count of one means nobody is queued
        self.locks
            .locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_serialized() {
        let locks = Arc::new(InstanceLocks::new());
        let id = InstanceId::new("a");

        let guard = locks.lock(&id).await;
        let contender = {
            let locks = Arc::clone(&locks);
            let id = id.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let locks = InstanceLocks::new();
        let _a = locks.lock(&InstanceId::new("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&InstanceId::new("b"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_entry_dropped_after_last_release() {
        let locks = InstanceLocks::new();
        for n in 0..5 {
            let _g = locks.lock(&InstanceId::new(format!("i-{}", n))).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_kept_while_waiter_queued() {
        let locks = Arc::new(InstanceLocks::new());
        let id = InstanceId::new("a");

        let guard = locks.lock(&id).await;
        let contender = {
            let locks = Arc::clone(&locks);
            let id = id.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&id).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        assert_eq!(locks.len(), 1);
        contender.await.unwrap();
        assert!(locks.is_empty());
    }
}
