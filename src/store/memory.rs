//! プロセス内の状態ストア

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{LockOutcome, LockTable, StateStore, check_save};
use crate::engine::instance::{InstanceId, WorkflowInstance};
use crate::error::StoreError;

/// `HashMap` に保持するストア
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    instances: RwLock<HashMap<InstanceId, WorkflowInstance>>,
    locks: LockTable,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Err(StoreError::AlreadyExists(instance.id));
        }
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load(&self, id: InstanceId) -> Result<WorkflowInstance, StoreError> {
        self.instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, instance: &mut WorkflowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get(&instance.id)
            .ok_or(StoreError::NotFound(instance.id))?;
        check_save(stored, instance)?;

        instance.version += 1;
        instance.updated_at = Utc::now();
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn try_lock(&self, id: InstanceId) -> Result<LockOutcome, StoreError> {
        if !self.instances.read().await.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(self.locks.try_acquire(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::workflow::DefinitionRef;
    use crate::engine::context::Payload;
    use crate::engine::instance::InstanceStatus;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            DefinitionRef {
                name: "bmi".to_string(),
                version: "1".to_string(),
            },
            Payload::new(),
        )
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let store = InMemoryStateStore::new();
        let instance = instance();
        store.create(&instance).await.unwrap();

        assert_eq!(store.load(instance.id).await.unwrap(), instance);
        assert_eq!(store.len().await, 1);
        assert!(matches!(
            store.create(&instance).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing() {
        let store = InMemoryStateStore::new();
        let id = InstanceId::new();
        assert!(matches!(store.load(id).await, Err(StoreError::NotFound(found)) if found == id));
    }

    #[tokio::test]
    async fn test_save_bumps_version() {
        let store = InMemoryStateStore::new();
        let mut instance = instance();
        store.create(&instance).await.unwrap();

        instance.set_status(InstanceStatus::Running);
        store.save(&mut instance).await.unwrap();

        assert_eq!(instance.version, 1);
        assert_eq!(store.load(instance.id).await.unwrap().version, 1);
    }

    /// 同じバージョンからの2つの保存: 1つ目は適用、2つ目は衝突
    #[tokio::test]
    async fn test_concurrent_saves_conflict() {
        let store = InMemoryStateStore::new();
        let base = instance();
        store.create(&base).await.unwrap();

        let mut first = base.clone();
        first.set_status(InstanceStatus::Running);
        let mut second = base.clone();
        second.cancel();

        store.save(&mut first).await.unwrap();
        let err = store.save(&mut second).await.unwrap_err();

        assert!(matches!(err, StoreError::Conflict { expected: 0, actual: 1, .. }));
        assert_eq!(store.load(base.id).await.unwrap().status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_try_lock() {
        let store = InMemoryStateStore::new();
        let instance = instance();
        store.create(&instance).await.unwrap();

        let lease = store.try_lock(instance.id).await.unwrap();
        assert!(matches!(lease, LockOutcome::Acquired(_)));
        assert!(matches!(store.try_lock(instance.id).await.unwrap(), LockOutcome::Busy));

        drop(lease);
        assert!(matches!(
            store.try_lock(instance.id).await.unwrap(),
            LockOutcome::Acquired(_)
        ));
        assert!(store.try_lock(InstanceId::new()).await.is_err());
    }
}
