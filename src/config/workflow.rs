//! Workflow 定義の読み込みと管理を行うモジュール
//!
//! # 責務
//!
//! このモジュールは、マルチエージェントのワークフローを TOML 形式で定義し、
//! それを Rust の型として扱うための機能を提供します。
//!
//! ## 主な機能
//!
//! - **TOML パース**: TOML ファイルを読み込み、[`WorkflowDefinition`] に変換
//! - **構造の検証**: ステップ ID の一意性、遷移先・入力ソースの存在、循環の検出
//! - **遷移テーブル**: 各ステップの `next` を [`TransitionTable`] に展開
//!
//! ## 使用例
//!
//! ```toml
//! [workflow]
//! name = "feature-implementation"
//! version = "1.0.0"
//! description = "新機能の実装ワークフロー"
//!
//! [[workflow.inputs]]
//! name = "task"
//! type = "string"
//!
//! [[steps]]
//! id = "plan"
//! agents = ["planner"]
//! max_retries = 2
//! inputs = [{ name = "task", source = "input.task" }]
//! outputs = [{ name = "plan", type = "string" }]
//! next = { ok = "implement" }
//!
//! [[steps]]
//! id = "implement"
//! agents = ["coder"]
//! inputs = [{ name = "plan", source = "plan.plan" }]
//! next = { ok = "end" }
//! ```
//!
//! ## 関連モジュール
//!
//! - [`crate::config::step`]: 各ステップの定義
//! - [`crate::engine::orchestrator`]: ワークフローの実行エンジン

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;

use super::dto::{TransitionDto, WorkflowDto, WorkflowMetadataDto, WorkflowStepDto};
use super::step::{FieldSpec, INPUT_SOURCE, StepConfig};
use super::transition::{END, Target, TransitionTable};
use crate::engine::result::StepOutcome;
use crate::error::ConfigError;

/// 定義のバージョン省略時の既定値
pub const DEFAULT_VERSION: &str = "1";

/// ワークフロー定義への参照（名前 + バージョン）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub struct DefinitionRef {
    pub name: String,
    pub version: String,
}

impl std::fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// ワークフロー定義（ドメインモデル）
///
/// バリデーション済みの状態を保証します。読み込み後は不変で、
/// エンジンからは `Arc<WorkflowDefinition>` として共有されます。
///
/// ## DTO との違い
///
/// - [`WorkflowDto`]: TOML デシリアライズ専用、バリデーション前の生データ
/// - [`WorkflowDefinition`]: バリデーション済み、ドメインロジックを持つ
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    name: String,
    version: String,
    description: Option<String>,
    start: String,
    inputs: Vec<FieldSpec>,
    steps: Vec<StepConfig>,
    index: HashMap<String, usize>,
    transitions: TransitionTable,
}

impl WorkflowDefinition {
    /// TOML ファイルからワークフローを読み込む
    ///
    /// # 処理フロー
    ///
    /// 1. ファイル読み込み
    /// 2. TOML デシリアライズ → [`WorkflowDto`]
    /// 3. バリデーション & 変換 → [`WorkflowDefinition`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// TOML 文字列からワークフローを読み込む
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let dto: WorkflowDto = toml::from_str(toml)?;
        Self::try_from(dto)
    }

    /// ワークフローを TOML 文字列に変換
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let dto = WorkflowDto::from(self.clone());
        Ok(toml::to_string(&dto)?)
    }

    /// ワークフローを TOML ファイルに保存
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// 定義への参照
    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    /// 最初に実行するステップ ID
    pub fn start(&self) -> &str {
        &self.start
    }

    /// 初期入力として要求されるフィールド
    pub fn inputs(&self) -> &[FieldSpec] {
        &self.inputs
    }

    /// 定義順のステップ一覧
    pub fn steps(&self) -> &[StepConfig] {
        &self.steps
    }

    /// ID からステップを引く
    pub fn step(&self, id: &str) -> Option<&StepConfig> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// ステップが定義に含まれるか
    pub fn contains_step(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }

    /// 定義内で参照される全エージェント ID（重複なし）
    pub fn agent_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .flat_map(|step| step.agents().iter().map(String::as_str))
            .filter(|agent| seen.insert(*agent))
            .collect()
    }

    /// 遷移グラフに循環が無いことを確認
    ///
    /// コンテキストは書き込み一回限りのため、同じステップを二度実行する定義は受け付けません。
    fn check_acyclic(&self) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Visiting,
            Done,
        }

        fn visit<'a>(
            def: &'a WorkflowDefinition,
            id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), ConfigError> {
            match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return Ok(()),
                Mark::Visiting => {
                    return Err(ConfigError::Validation(format!(
                        "ステップ '{id}' を含む遷移が循環しています"
                    )));
                }
                Mark::Unvisited => {}
            }
            marks.insert(id, Mark::Visiting);
            for next in def.transitions.successors(id) {
                visit(def, next, marks)?;
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for step in &self.steps {
            visit(self, step.id(), &mut marks)?;
        }
        Ok(())
    }

    /// 入力ソースのステップが遷移上の祖先（必ず先に実行されうるステップ）であることを検査
    fn check_input_order(&self) -> Result<(), ConfigError> {
        let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for next in self.transitions.successors(step.id()) {
                predecessors.entry(next).or_default().push(step.id());
            }
        }

        for step in &self.steps {
            let mut ancestors = HashSet::new();
            let mut pending = vec![step.id()];
            while let Some(id) = pending.pop() {
                for &prev in predecessors.get(id).into_iter().flatten() {
                    if ancestors.insert(prev) {
                        pending.push(prev);
                    }
                }
            }

            for input in step.inputs() {
                if input.source_step != INPUT_SOURCE
                    && !ancestors.contains(input.source_step.as_str())
                {
                    return Err(ConfigError::Validation(format!(
                        "ステップ '{}' の入力 '{}' のソース '{}' は先行するステップではありません",
                        step.id(),
                        input.name,
                        input.source()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl FromStr for WorkflowDefinition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_toml(s)
    }
}

/// DTO からドメインモデルへの変換（読み込み方向）
///
/// # 処理フロー
///
/// 1. メタデータのバリデーション
/// 2. ステップの変換（`WorkflowStepDto` → `StepConfig`）と ID の一意性検査
/// 3. 遷移テーブルの構築と遷移先の検査
/// 4. 入力ソースの検査と循環の検出
/// 5. 入力ソースが遷移上の先行ステップであることの検査
impl TryFrom<WorkflowDto> for WorkflowDefinition {
    type Error = ConfigError;

    fn try_from(dto: WorkflowDto) -> Result<Self, Self::Error> {
        let name = dto.workflow.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::Validation(
                "ワークフロー名が空です".to_string(),
            ));
        }
        if dto.steps.is_empty() {
            return Err(ConfigError::Validation(format!(
                "ワークフロー '{name}' にステップがありません"
            )));
        }

        let inputs = dto
            .workflow
            .inputs
            .into_iter()
            .map(FieldSpec::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut steps = Vec::with_capacity(dto.steps.len());
        let mut index = HashMap::new();
        let mut transitions = TransitionTable::new();

        for step_dto in dto.steps {
            let rules = [
                (StepOutcome::Ok, step_dto.next.ok.clone()),
                (StepOutcome::RetryableError, step_dto.next.retryable_error.clone()),
                (StepOutcome::FatalError, step_dto.next.fatal_error.clone()),
            ];

            let step = StepConfig::try_from(step_dto)?;
            if step.id() == INPUT_SOURCE || step.id() == END {
                return Err(ConfigError::Validation(format!(
                    "ステップ ID '{}' は予約されています",
                    step.id()
                )));
            }
            if index.insert(step.id().to_string(), steps.len()).is_some() {
                return Err(ConfigError::Validation(format!(
                    "ステップ ID '{}' が重複しています",
                    step.id()
                )));
            }

            for (outcome, target) in rules {
                if let Some(target) = target {
                    transitions.insert(step.id(), outcome, Target::parse(target.trim()));
                }
            }
            steps.push(step);
        }

        for (step_id, outcome, target) in transitions.iter() {
            if let Target::Step(next) = target {
                if !index.contains_key(next) {
                    return Err(ConfigError::Validation(format!(
                        "ステップ '{step_id}' の {outcome} 遷移先 '{next}' は定義されていません"
                    )));
                }
            }
        }

        for step in &steps {
            for input in step.inputs() {
                if input.source_step != INPUT_SOURCE && !index.contains_key(&input.source_step) {
                    return Err(ConfigError::Validation(format!(
                        "ステップ '{}' の入力 '{}' のソース '{}' は定義されていません",
                        step.id(),
                        input.name,
                        input.source()
                    )));
                }
            }
        }

        let start = match dto.workflow.start {
            Some(start) => start.trim().to_string(),
            None => steps[0].id().to_string(),
        };
        if !index.contains_key(&start) {
            return Err(ConfigError::Validation(format!(
                "開始ステップ '{start}' は定義されていません"
            )));
        }

        let definition = WorkflowDefinition {
            name,
            version: dto
                .workflow
                .version
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            description: dto.workflow.description,
            start,
            inputs,
            steps,
            index,
            transitions,
        };
        definition.check_acyclic()?;
        definition.check_input_order()?;

        Ok(definition)
    }
}

/// ドメインモデルから DTO への変換（書き込み方向）
///
/// バリデーション済みのドメインモデルから DTO を生成するため、
/// この変換は失敗しません（`From` トレイトを使用）。
impl From<WorkflowDefinition> for WorkflowDto {
    fn from(definition: WorkflowDefinition) -> Self {
        let transitions = definition.transitions;
        let rule = |step: &str, outcome| transitions.next(step, outcome).map(Target::to_string);

        let steps = definition
            .steps
            .into_iter()
            .map(|step| {
                let next = TransitionDto {
                    ok: rule(step.id(), StepOutcome::Ok),
                    retryable_error: rule(step.id(), StepOutcome::RetryableError),
                    fatal_error: rule(step.id(), StepOutcome::FatalError),
                };
                WorkflowStepDto {
                    next,
                    ..WorkflowStepDto::from(step)
                }
            })
            .collect();

        WorkflowDto {
            workflow: WorkflowMetadataDto {
                name: definition.name,
                version: Some(definition.version),
                description: definition.description,
                start: Some(definition.start),
                inputs: definition.inputs.into_iter().map(Into::into).collect(),
            },
            steps,
        }
    }
}
