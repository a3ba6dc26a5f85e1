//! ステップ実行結果と終了サマリーの型定義
//!
//! # 責務
//!
//! - ステップの結果タグ [`StepOutcome`] の定義（遷移テーブルのキー）
//! - 失敗の分類 [`FailureKind`] の定義
//! - ステップ実行結果 [`StepResult`] と失敗詳細 [`FailureDetail`] の定義
//! - 呼び出し側に返すステータスレポート [`StatusReport`] の定義
//!
//! # 使用例
//!
//! ```rust,no_run
//! use melted_orchestrator::engine::result::StatusReport;
//!
//! fn handle_report(report: StatusReport) {
//!     if report.is_success() {
//!         println!("ワークフロー成功: {}", report.definition);
//!     } else {
//!         println!("ステータス: {:?}", report.status);
//!     }
//!
//!     if let Ok(json) = report.to_json() {
//!         println!("JSON: {}", json);
//!     }
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::Payload;
use super::instance::{InstanceId, InstanceStatus, WorkflowInstance};
use crate::config::workflow::DefinitionRef;

/// ステップの結果タグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// 成功
    Ok,
    /// 再試行で解消しうる失敗
    RetryableError,
    /// 再試行しても解消しない失敗
    FatalError,
}

impl StepOutcome {
    /// すべての結果タグ（遷移テーブルの走査順）
    pub const ALL: &'static [StepOutcome] = &[
        StepOutcome::Ok,
        StepOutcome::RetryableError,
        StepOutcome::FatalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Ok => "ok",
            StepOutcome::RetryableError => "retryable_error",
            StepOutcome::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失敗の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// ワークフロー定義・エージェント解決の不備
    ConfigurationError,
    /// 必須入力の欠落
    InputError,
    /// 一時的なエージェント失敗（再試行を使い切った場合を含む）
    AgentTransientError,
    /// 恒久的なエージェント失敗（出力スキーマ不一致を含む）
    AgentPermanentError,
    /// 状態ストアへの保存の失敗（衝突以外）
    PersistenceError,
}

/// ステップ単位のエラー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: FailureKind,
    pub message: String,
}

/// ステップ実行結果
///
/// Step Executor が返し、エンジンが遷移テーブルの参照に使います。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub outcome: StepOutcome,
    /// 成功時の出力（失敗時は空）
    pub output: Payload,
    pub error: Option<StepError>,
}

impl StepResult {
    pub fn ok(step_id: impl Into<String>, output: Payload) -> Self {
        Self {
            step_id: step_id.into(),
            outcome: StepOutcome::Ok,
            output,
            error: None,
        }
    }

    pub fn retryable(step_id: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::failed(step_id, StepOutcome::RetryableError, kind, message)
    }

    pub fn fatal(step_id: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::failed(step_id, StepOutcome::FatalError, kind, message)
    }

    fn failed(
        step_id: impl Into<String>,
        outcome: StepOutcome,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            outcome,
            output: Payload::new(),
            error: Some(StepError {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == StepOutcome::Ok
    }

    /// 失敗詳細に変換（成功結果の場合は `None`）
    pub fn failure_detail(&self) -> Option<FailureDetail> {
        self.error.as_ref().map(|error| FailureDetail {
            kind: error.kind,
            step_id: Some(self.step_id.clone()),
            message: error.message.clone(),
        })
    }
}

/// インスタンスが失敗した理由
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    /// 失敗したステップ（ステップに紐づかない失敗は `None`）
    pub step_id: Option<String>,
    pub message: String,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, step_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            step_id,
            message: message.into(),
        }
    }
}

/// 終了済みインスタンスのサマリー
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalSummary {
    /// 出力を記録したステップ（辞書順）
    pub completed_steps: Vec<String>,
    /// ステップごとの試行回数の合計
    pub total_attempts: u32,
    pub failure: Option<FailureDetail>,
    pub finished_at: DateTime<Utc>,
}

/// ステータス照会の結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub instance_id: InstanceId,
    pub definition: DefinitionRef,
    pub status: InstanceStatus,
    pub current_step: Option<String>,
    /// 終了済みの場合のみ
    pub summary: Option<TerminalSummary>,
}

impl StatusReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn is_success(&self) -> bool {
        self.status == InstanceStatus::Succeeded
    }
}

impl From<&WorkflowInstance> for StatusReport {
    fn from(instance: &WorkflowInstance) -> Self {
        let summary = instance.status.is_terminal().then(|| TerminalSummary {
            completed_steps: instance.context.keys().map(str::to_string).collect(),
            total_attempts: instance.attempts.values().sum(),
            failure: instance.failure.clone(),
            finished_at: instance.updated_at,
        });
        Self {
            instance_id: instance.id,
            definition: instance.definition.clone(),
            status: instance.status,
            current_step: instance.current_step.clone(),
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> DefinitionRef {
        DefinitionRef {
            name: "bmi".to_string(),
            version: "1".to_string(),
        }
    }

    #[test]
    fn test_outcome_serialization() {
        assert_eq!(serde_json::to_value(StepOutcome::RetryableError).unwrap(), json!("retryable_error"));
        assert_eq!(StepOutcome::FatalError.to_string(), "fatal_error");
        assert_eq!(StepOutcome::ALL.len(), 3);
    }

    #[test]
    fn test_failure_kind_serialization() {
        assert_eq!(
            serde_json::to_value(FailureKind::AgentTransientError).unwrap(),
            json!("agent_transient_error")
        );
    }

    #[test]
    fn test_step_result_constructors() {
        let mut output = Payload::new();
        output.insert("x".to_string(), json!(1));

        let ok = StepResult::ok("a", output);
        assert!(ok.is_ok());
        assert!(ok.failure_detail().is_none());

        let fatal = StepResult::fatal("b", FailureKind::InputError, "missing a.x");
        assert_eq!(fatal.outcome, StepOutcome::FatalError);
        assert!(fatal.output.is_empty());

        let detail = fatal.failure_detail().unwrap();
        assert_eq!(detail.kind, FailureKind::InputError);
        assert_eq!(detail.step_id.as_deref(), Some("b"));
    }

    /// 実行中のインスタンスにはサマリーが付かない
    #[test]
    fn test_status_report_running_has_no_summary() {
        let mut instance = WorkflowInstance::new(definition(), Payload::new());
        instance.set_status(InstanceStatus::Running);
        instance.advance_to("calculate");

        let report = StatusReport::from(&instance);
        assert_eq!(report.status, InstanceStatus::Running);
        assert_eq!(report.current_step.as_deref(), Some("calculate"));
        assert!(report.summary.is_none());
        assert!(!report.is_success());
    }

    #[test]
    fn test_status_report_terminal_summary() {
        let mut instance = WorkflowInstance::new(definition(), Payload::new());
        instance.set_status(InstanceStatus::Running);
        instance.advance_to("calculate");
        instance.record_attempt("calculate");
        instance.record_attempt("calculate");
        instance.context.insert("calculate", Payload::new()).unwrap();
        instance.succeed();

        let report = StatusReport::from(&instance);
        let summary = report.summary.as_ref().unwrap();
        assert!(report.is_success());
        assert_eq!(summary.completed_steps, vec!["calculate"]);
        assert_eq!(summary.total_attempts, 2);
        assert!(report.to_json().unwrap().contains("\"succeeded\""));
    }
}
