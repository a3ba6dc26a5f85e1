//! ワークフローインスタンスの状態ストア
//!
//! # 責務
//!
//! - インスタンスの作成・読み込み・保存
//! - 楽観的ロック: 保存時のバージョンが保存済みのものと一致しなければ `Conflict`
//! - 終了済みレコードへの保存や状態の後退も `Conflict`
//! - 実行ドライバーの排他（[`StateStore::try_lock`]）
//!
//! # モジュール構成
//!
//! - `memory` - プロセス内のストア（既定、テスト用）
//! - `file` - インスタンスごとに JSON ファイルを書くストア
//!
//! # 使用例
//!
//! ```rust,no_run
//! use melted_orchestrator::store::{InMemoryStateStore, StateStore};
//! use melted_orchestrator::engine::instance::WorkflowInstance;
//! # use melted_orchestrator::config::workflow::DefinitionRef;
//!
//! # async fn example(definition: DefinitionRef) -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStateStore::new();
//! let mut instance = WorkflowInstance::new(definition, Default::default());
//! store.create(&instance).await?;
//!
//! instance.advance_to("plan");
//! store.save(&mut instance).await?; // version 0 -> 1
//! # Ok(())
//! # }
//! ```

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::engine::instance::{InstanceId, WorkflowInstance};
use crate::error::StoreError;

/// 状態ストアの共通インターフェース
///
/// # 実装要件
///
/// - `save` はバージョン比較と書き込みを不可分に行う
/// - `save` 成功時は引数の `version` を +1 し、`updated_at` を更新する
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 新しいインスタンスを保存（同じ ID があれば `AlreadyExists`）
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    async fn load(&self, id: InstanceId) -> Result<WorkflowInstance, StoreError>;

    /// 楽観的ロック付きで保存
    async fn save(&self, instance: &mut WorkflowInstance) -> Result<(), StoreError>;

    /// 実行ドライバーのリースを取得
    async fn try_lock(&self, id: InstanceId) -> Result<LockOutcome, StoreError>;
}

/// `try_lock` の結果
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(InstanceLease),
    /// 別のドライバーが保持中
    Busy,
}

/// 実行ドライバーのリース（破棄時に解放）
#[derive(Debug)]
pub struct InstanceLease {
    id: InstanceId,
    held: Arc<Mutex<HashSet<InstanceId>>>,
}

impl InstanceLease {
    pub fn instance_id(&self) -> InstanceId {
        self.id
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// プロセス内のリース管理
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    held: Arc<Mutex<HashSet<InstanceId>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, id: InstanceId) -> LockOutcome {
        let inserted = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        if inserted {
            LockOutcome::Acquired(InstanceLease {
                id,
                held: Arc::clone(&self.held),
            })
        } else {
            LockOutcome::Busy
        }
    }
}

/// 保存の可否を判定する
///
/// - バージョン不一致
/// - 保存済みレコードが終了状態
/// - 状態の後退（例: `running` → `pending`）
///
/// のいずれかで `Conflict` を返します。
pub(crate) fn check_save(stored: &WorkflowInstance, incoming: &WorkflowInstance) -> Result<(), StoreError> {
    let conflict = || StoreError::Conflict {
        id: incoming.id,
        expected: incoming.version,
        actual: stored.version,
    };

    if stored.version != incoming.version {
        return Err(conflict());
    }
    if stored.status.is_terminal() || incoming.status.rank() < stored.status.rank() {
        return Err(conflict());
    }
    Ok(())
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

    #[test]
    fn test_lease_released_on_drop() {
        let table = LockTable::new();
        let id = InstanceId::new();

        let lease = match table.try_acquire(id) {
            LockOutcome::Acquired(lease) => lease,
            LockOutcome::Busy => panic!("first acquire must succeed"),
        };
        assert_eq!(lease.instance_id(), id);
        assert!(matches!(table.try_acquire(id), LockOutcome::Busy));

        drop(lease);
        assert!(matches!(table.try_acquire(id), LockOutcome::Acquired(_)));
    }

    #[test]
    fn test_check_save_rules() {
        let stored = instance();
        let mut incoming = stored.clone();
        assert!(check_save(&stored, &incoming).is_ok());

        incoming.version = 3;
        assert!(matches!(
            check_save(&stored, &incoming),
            Err(StoreError::Conflict { expected: 3, actual: 0, .. })
        ));

        let mut running = stored.clone();
        running.status = InstanceStatus::Running;
        let mut backwards = running.clone();
        backwards.status = InstanceStatus::Pending;
        assert!(check_save(&running, &backwards).is_err());

        let mut cancelled = stored.clone();
        cancelled.cancel();
        let mut after = cancelled.clone();
        after.status = InstanceStatus::Running;
        assert!(check_save(&cancelled, &after).is_err());
    }
}
