//! 設定とワークフロー定義
//!
//! # モジュール構成
//!
//! - `dto` - TOML デシリアライズ用の内部構造体
//! - [`step`][]: ステップ定義（エージェント、入力マッピング、出力スキーマ）
//! - [`transition`][]: `(ステップID, 結果タグ) → 遷移先` の遷移テーブル
//! - [`workflow`][]: ワークフロー定義の読み込みと検証
//! - [`registry`][]: 名前とバージョンによる定義の管理
//! - [`settings`][]: エンジン・ログ・エージェントバインディングの設定

mod dto;
pub mod registry;
pub mod settings;
pub mod step;
pub mod transition;
pub mod workflow;

pub use registry::DefinitionRegistry;
pub use settings::{AgentBinding, EngineSettings, LogFormat, LoggingSettings, Settings};
pub use step::{FanOutMode, FieldSpec, FieldType, InputBinding, StepConfig};
pub use transition::{Target, TransitionTable};
pub use workflow::{DefinitionRef, WorkflowDefinition};
