//! ワークフローステップの定義
//!
//! # 責務
//!
//! Workflowを構成するStepの定義体を提供するモジュール
//! アプリケーションに対して、[StepConfig] を提供する。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dto::{FieldSpecDto, InputBindingDto, TransitionDto, WorkflowStepDto};
use crate::error::ConfigError;

/// 初期入力を参照するための予約ソース名
pub const INPUT_SOURCE: &str = "input";

/// ワークフローステップ（ドメインモデル）
///
/// ワークフロー内の1つの処理単位を表します。
/// 各ステップは、1つ以上のエージェントを呼び出してタスクを実行します。
///
/// ## DTO との違い
///
/// - [`WorkflowStepDto`](super::dto::WorkflowStepDto): TOML デシリアライズ専用
/// - [`StepConfig`]: バリデーション済み、ドメインロジックを持つ
#[derive(Debug, Clone)]
pub struct StepConfig {
    id: String,
    description: Option<String>,
    agents: Vec<String>,
    mode: FanOutMode,
    timeout: Option<Duration>,
    max_retries: u32,
    inputs: Vec<InputBinding>,
    outputs: Vec<FieldSpec>,
}

impl StepConfig {
    /// ステップ ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// ステップの説明
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// 呼び出すエージェント ID の一覧
    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    /// ファンアウトモード
    pub fn mode(&self) -> FanOutMode {
        self.mode
    }

    /// エージェント呼び出しのタイムアウト（未指定時はエンジン既定値）
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// `retryable_error` 時のリトライ上限
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 入力マッピング
    pub fn inputs(&self) -> &[InputBinding] {
        &self.inputs
    }

    /// 出力スキーマ（必須フィールドと型）
    pub fn outputs(&self) -> &[FieldSpec] {
        &self.outputs
    }
}

/// 複数エージェントの呼び出し方
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    /// 単一エージェント
    #[default]
    Single,
    /// 全エージェントの完了を待って集約
    All,
    /// 最初の成功レスポンスを採用し、残りは破棄
    FirstSuccess,
}

/// 出力スキーマで使用するプリミティブ型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    /// 型を問わない（存在のみ検査）
    #[default]
    Any,
}

impl FieldType {
    /// 値がこの型に適合するか
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => !value.is_null(),
        }
    }
}

/// フィールド宣言（名前と型）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// 入力マッピング
///
/// コンテキスト内の `source_step` の出力から `field` を取り出し、
/// エージェント入力の `name` として渡します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub name: String,
    pub source_step: String,
    pub field: String,
    pub required: bool,
}

impl InputBinding {
    /// `"<ステップID>.<フィールド名>"` 形式のソース表記
    pub fn source(&self) -> String {
        format!("{}.{}", self.source_step, self.field)
    }

    fn parse(dto: InputBindingDto) -> Result<Self, ConfigError> {
        let (source_step, field) = dto
            .source
            .split_once('.')
            .filter(|(step, field)| !step.is_empty() && !field.is_empty())
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "入力 '{}' のソース '{}' は '<ステップID>.<フィールド名>' 形式である必要があります",
                    dto.name, dto.source
                ))
            })?;

        Ok(Self {
            source_step: source_step.to_string(),
            field: field.to_string(),
            name: dto.name,
            required: dto.required,
        })
    }
}

impl TryFrom<FieldSpecDto> for FieldSpec {
    type Error = ConfigError;

    fn try_from(dto: FieldSpecDto) -> Result<Self, Self::Error> {
        if dto.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "フィールド名が空です".to_string(),
            ));
        }
        Ok(FieldSpec::new(dto.name, dto.field_type))
    }
}

impl From<FieldSpec> for FieldSpecDto {
    fn from(spec: FieldSpec) -> Self {
        FieldSpecDto {
            name: spec.name,
            field_type: spec.field_type,
        }
    }
}

/// DTO からドメインモデルへの変換（読み込み方向）
///
/// バリデーションを実施し、不正なデータの場合は [`ConfigError::Validation`] を返します。
/// 遷移ルール (`next`) はワークフロー側で検証するため、ここでは扱いません。
impl TryFrom<WorkflowStepDto> for StepConfig {
    type Error = ConfigError;

    fn try_from(dto: WorkflowStepDto) -> Result<Self, Self::Error> {
        let id = dto.id.trim().to_string();
        if id.is_empty() {
            return Err(ConfigError::Validation("ステップ ID が空です".to_string()));
        }
        if id.contains('.') {
            return Err(ConfigError::Validation(format!(
                "ステップ ID '{id}' に '.' は使用できません"
            )));
        }

        if dto.agents.is_empty() {
            return Err(ConfigError::Validation(format!(
                "ステップ '{id}' にエージェントが指定されていません"
            )));
        }
        if dto.mode == FanOutMode::Single && dto.agents.len() != 1 {
            return Err(ConfigError::Validation(format!(
                "ステップ '{id}' は single モードですが、エージェントが {} 個指定されています",
                dto.agents.len()
            )));
        }
        for (i, agent) in dto.agents.iter().enumerate() {
            if agent.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "ステップ '{id}' に空のエージェント ID があります"
                )));
            }
            if dto.agents[..i].contains(agent) {
                return Err(ConfigError::Validation(format!(
                    "ステップ '{id}' でエージェント '{agent}' が重複しています"
                )));
            }
        }

        if dto.timeout_secs == Some(0) {
            return Err(ConfigError::Validation(format!(
                "ステップ '{id}' のタイムアウトは1秒以上である必要があります"
            )));
        }

        let inputs = dto
            .inputs
            .into_iter()
            .map(InputBinding::parse)
            .collect::<Result<Vec<_>, _>>()?;
        for (i, input) in inputs.iter().enumerate() {
            if inputs[..i].iter().any(|other| other.name == input.name) {
                return Err(ConfigError::Validation(format!(
                    "ステップ '{id}' で入力名 '{}' が重複しています",
                    input.name
                )));
            }
        }

        let outputs = dto
            .outputs
            .into_iter()
            .map(FieldSpec::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        for (i, output) in outputs.iter().enumerate() {
            if outputs[..i].iter().any(|other| other.name == output.name) {
                return Err(ConfigError::Validation(format!(
                    "ステップ '{id}' で出力フィールド '{}' が重複しています",
                    output.name
                )));
            }
        }

        Ok(StepConfig {
            id,
            description: dto.description,
            agents: dto.agents,
            mode: dto.mode,
            timeout: dto.timeout_secs.map(Duration::from_secs),
            max_retries: dto.max_retries,
            inputs,
            outputs,
        })
    }
}

/// ドメインモデルから DTO への変換（書き込み方向）
///
/// 遷移ルールは [`WorkflowDefinition`](super::workflow::WorkflowDefinition) 側で埋めます。
impl From<StepConfig> for WorkflowStepDto {
    fn from(step: StepConfig) -> Self {
        WorkflowStepDto {
            id: step.id,
            description: step.description,
            agents: step.agents,
            mode: step.mode,
            timeout_secs: step.timeout.map(|t| t.as_secs()),
            max_retries: step.max_retries,
            inputs: step
                .inputs
                .into_iter()
                .map(|input| InputBindingDto {
                    source: input.source(),
                    name: input.name,
                    required: input.required,
                })
                .collect(),
            outputs: step.outputs.into_iter().map(FieldSpecDto::from).collect(),
            next: TransitionDto::default(),
        }
    }
}
