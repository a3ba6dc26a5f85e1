//! ワークフローインスタンス（1回の実行）の状態モデル
//!
//! 状態遷移:
//!
//! ```text
//! pending ──▶ running ◀──▶ waiting_on_agent
//!    │           │
//!    │           ├──▶ succeeded
//!    │           ├──▶ failed
//!    └───────────┴──▶ cancelled
//! ```
//!
//! 終了状態（`succeeded` / `failed` / `cancelled`）からは遷移しません。
//! 永続化時の楽観的ロックのため、各レコードは `version` を持ちます。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::{Context, Payload};
use super::result::FailureDetail;
use crate::config::workflow::DefinitionRef;

/// インスタンス ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// インスタンスの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    WaitingOnAgent,
    Succeeded,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Succeeded | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// 状態の前後関係（後退する保存を検出するために使う）
    ///
    /// `running` と `waiting_on_agent` は相互に行き来できるため同順位です。
    pub fn rank(&self) -> u8 {
        match self {
            InstanceStatus::Pending => 0,
            InstanceStatus::Running | InstanceStatus::WaitingOnAgent => 1,
            InstanceStatus::Succeeded | InstanceStatus::Failed | InstanceStatus::Cancelled => 2,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::WaitingOnAgent => "waiting_on_agent",
            InstanceStatus::Succeeded => "succeeded",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// ワークフローインスタンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub definition: DefinitionRef,
    pub status: InstanceStatus,
    /// 実行中のステップ（終了状態では `None`）
    pub current_step: Option<String>,
    /// 開始時の入力（ソース `input.<フィールド名>` で参照される）
    pub input: Payload,
    /// 完了したステップの出力
    pub context: Context,
    /// ステップごとの試行回数
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    pub failure: Option<FailureDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 楽観的ロック用のバージョン（保存成功ごとに +1）
    pub version: u64,
}

impl WorkflowInstance {
    /// `pending` 状態の新しいインスタンス
    pub fn new(definition: DefinitionRef, input: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            definition,
            status: InstanceStatus::Pending,
            current_step: None,
            input,
            context: Context::new(),
            attempts: BTreeMap::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// ステップの試行回数を1増やし、増やした後の値を返す
    pub fn record_attempt(&mut self, step_id: &str) -> u32 {
        let count = self.attempts.entry(step_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn attempts_for(&self, step_id: &str) -> u32 {
        self.attempts.get(step_id).copied().unwrap_or(0)
    }

    pub fn advance_to(&mut self, step_id: impl Into<String>) {
        self.current_step = Some(step_id.into());
    }

    pub fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
    }

    pub fn succeed(&mut self) {
        self.finish(InstanceStatus::Succeeded);
    }

    pub fn fail(&mut self, failure: FailureDetail) {
        self.failure = Some(failure);
        self.finish(InstanceStatus::Failed);
    }

    pub fn cancel(&mut self) {
        self.finish(InstanceStatus::Cancelled);
    }

    fn finish(&mut self, status: InstanceStatus) {
        self.status = status;
        self.current_step = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::result::FailureKind;

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
    fn test_new_instance_is_pending() {
        let instance = instance();
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert!(instance.current_step.is_none());
        assert!(instance.context.is_empty());
        assert_eq!(instance.version, 0);
    }

    #[test]
    fn test_instance_id_parse_roundtrip() {
        let id = InstanceId::new();
        let parsed: InstanceId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<InstanceId>().is_err());
    }

    #[test]
    fn test_record_attempt() {
        let mut instance = instance();
        assert_eq!(instance.record_attempt("a"), 1);
        assert_eq!(instance.record_attempt("a"), 2);
        assert_eq!(instance.attempts_for("a"), 2);
        assert_eq!(instance.attempts_for("b"), 0);
    }

    /// 終了状態では現在ステップがクリアされる
    #[test]
    fn test_terminal_transitions_clear_current_step() {
        let mut instance = instance();
        instance.advance_to("a");
        instance.fail(FailureDetail::new(
            FailureKind::InputError,
            Some("a".to_string()),
            "missing",
        ));

        assert_eq!(instance.status, InstanceStatus::Failed);
        assert!(instance.current_step.is_none());
        assert!(instance.is_terminal());
        assert_eq!(instance.failure.as_ref().unwrap().kind, FailureKind::InputError);
    }

    #[test]
    fn test_status_rank() {
        assert!(InstanceStatus::Pending.rank() < InstanceStatus::Running.rank());
        assert_eq!(InstanceStatus::Running.rank(), InstanceStatus::WaitingOnAgent.rank());
        assert!(InstanceStatus::WaitingOnAgent.rank() < InstanceStatus::Cancelled.rank());
        assert_eq!(InstanceStatus::WaitingOnAgent.to_string(), "waiting_on_agent");
    }
}
