//! TOML デシリアライズ用の DTO (Data Transfer Object)
//!
//! # 責務
//!
//! このモジュールは、TOML ファイルからのデータ読み込み専用の構造体を提供します。
//! DTO はバリデーション前の「生データ」を表現し、ドメインモデルとは分離されています。
//!
//! ## 変換フロー
//!
//! ```text
//! TOML ファイル
//!   ↓ (デシリアライズ)
//! WorkflowDto
//!   ↓ (TryFrom でバリデーション)
//! WorkflowDefinition (ドメインモデル)
//! ```

use serde::{Deserialize, Serialize};

use super::step::{FanOutMode, FieldType};

/// ワークフロー DTO
///
/// TOML の `[workflow]` セクションと `[[steps]]` 配列をデシリアライズ/シリアライズします。
///
/// **注**: この構造体は config モジュール内部の実装詳細です。
/// 外部からは [`WorkflowDefinition`](super::workflow::WorkflowDefinition) を使用してください。
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct WorkflowDto {
    /// ワークフローのメタデータ
    pub(super) workflow: WorkflowMetadataDto,
    /// ステップの配列
    #[serde(default)]
    pub(super) steps: Vec<WorkflowStepDto>,
}

/// ワークフローメタデータ DTO
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct WorkflowMetadataDto {
    pub(super) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) description: Option<String>,
    /// 最初に実行するステップ（省略時は先頭のステップ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) start: Option<String>,
    /// 初期入力として要求するフィールド
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(super) inputs: Vec<FieldSpecDto>,
}

/// ワークフローステップ DTO
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct WorkflowStepDto {
    pub(super) id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) description: Option<String>,
    pub(super) agents: Vec<String>,
    #[serde(default)]
    pub(super) mode: FanOutMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) timeout_secs: Option<u64>,
    #[serde(default)]
    pub(super) max_retries: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(super) inputs: Vec<InputBindingDto>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(super) outputs: Vec<FieldSpecDto>,
    #[serde(default)]
    pub(super) next: TransitionDto,
}

/// 入力マッピング DTO
///
/// `source` は `"<ステップID>.<フィールド名>"` 形式（初期入力は `"input.<フィールド名>"`）。
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct InputBindingDto {
    pub(super) name: String,
    pub(super) source: String,
    #[serde(default = "default_required")]
    pub(super) required: bool,
}

/// フィールド宣言 DTO
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct FieldSpecDto {
    pub(super) name: String,
    #[serde(rename = "type", default)]
    pub(super) field_type: FieldType,
}

/// 遷移ルール DTO
///
/// 各結果タグに対する次のステップ ID、または `"end"`。
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct TransitionDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) ok: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) retryable_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) fatal_error: Option<String>,
}

fn default_required() -> bool {
    true
}
