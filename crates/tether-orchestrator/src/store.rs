//! In-memory instance store

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use tether_core::error::StoreError;
use tether_core::traits::InstanceStore;
use tether_core::types::{Instance, InstanceId};

#[derive(Default)]
pub struct MemoryInstanceStore {
    rows: RwLock<HashMap<InstanceId, Instance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn all(&self) -> Result<Vec<Instance>, StoreError> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn insert(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&instance.id) {
            return Err(StoreError(format!("instance {} already exists", instance.id)));
        }
        rows.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn update(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&instance.id) {
            Some(row) => {
                *row = instance.clone();
                Ok(())
            }
            None => Err(StoreError(format!("instance {} does not exist", instance.id))),
        }
    }
}
