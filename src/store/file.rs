//! インスタンスごとの JSON ファイルによる状態ストア
//!
//! `<ディレクトリ>/<インスタンスID>.json` に保存します。書き込みは一時ファイル経由の
//! rename で行い、途中で中断しても壊れたファイルは残りません。
//!
//! バージョン比較と書き込みの不可分性はプロセス内でのみ保証されます。
//! 複数プロセスから同じディレクトリを更新する構成には対応していません。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{LockOutcome, LockTable, StateStore, check_save};
use crate::engine::instance::{InstanceId, WorkflowInstance};
use crate::error::StoreError;

/// JSON ファイルのストア
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    /// create/save の比較と書き込みを直列化する
    write_lock: Mutex<()>,
    locks: LockTable,
}

impl FileStateStore {
    /// ディレクトリを（必要なら作成して）開く
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            locks: LockTable::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: InstanceId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read(&self, id: InstanceId) -> Result<WorkflowInstance, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let path = self.path_for(instance.id);
        let tmp = self.dir.join(format!("{}.json.tmp", instance.id));
        let bytes = serde_json::to_vec_pretty(instance)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(self.path_for(instance.id)).await? {
            return Err(StoreError::AlreadyExists(instance.id));
        }
        self.write(instance).await?;
        tracing::debug!(instance_id = %instance.id, dir = %self.dir.display(), "created instance file");
        Ok(())
    }

    async fn load(&self, id: InstanceId) -> Result<WorkflowInstance, StoreError> {
        self.read(id).await
    }

    async fn save(&self, instance: &mut WorkflowInstance) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored = self.read(instance.id).await?;
        check_save(&stored, instance)?;

        let mut next = instance.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        self.write(&next).await?;
        *instance = next;
        Ok(())
    }

    async fn try_lock(&self, id: InstanceId) -> Result<LockOutcome, StoreError> {
        if !tokio::fs::try_exists(self.path_for(id)).await? {
            return Err(StoreError::NotFound(id));
        }
        Ok(self.locks.try_acquire(id))
    }
}
