//! Melted Orchestrator
//!
//! 専門エージェントを組み合わせたマルチステップのワークフローを実行する
//! オーケストレーションのコアです。
//!
//! - [`config`]: TOML のワークフロー定義・設定ファイル
//! - [`agent`]: エージェント呼び出し（コマンド / HTTP / クロージャ）
//! - [`engine`]: ワークフローエンジンとステップ実行
//! - [`store`]: インスタンス状態の永続化
//! - [`events`]: ライフサイクルイベントの通知
//! - [`logging`]: ログ出力の初期化

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod store;

pub use config::{DefinitionRegistry, Settings, WorkflowDefinition};
pub use engine::{CancelOutcome, InstanceId, InstanceStatus, WorkflowEngine, WorkflowInstance};
pub use error::{AgentError, ConfigError, EngineError, StoreError};
