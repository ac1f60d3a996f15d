//! Instance persistence interface

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Instance, InstanceId};

/// Row-level access to instance records
///
/// `insert` must be atomic: either the row is committed or nothing is.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError>;

    async fn all(&self) -> Result<Vec<Instance>, StoreError>;

    /// Fails if a row with the same id exists
    async fn insert(&self, instance: &Instance) -> Result<(), StoreError>;

    /// Fails if no row with this id exists
    async fn update(&self, instance: &Instance) -> Result<(), StoreError>;
}
