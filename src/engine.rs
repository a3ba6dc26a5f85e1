//! ワークフロー実行エンジン
//!
//! # 責務
//!
//! - ワークフローインスタンスの作成・実行・キャンセル・状態照会
//! - 遷移テーブルに基づくステップの順序制御
//! - ステップ間のデータ受け渡し（共有コンテキスト）
//! - タイムアウトと再試行（指数バックオフ）の制御
//!
//! # モジュール構成
//!
//! - [`orchestrator`][]: ワークフローエンジン本体（インスタンスのライフサイクル）
//! - [`executor`][]: 1ステップの実行（入力解決・ファンアウト・結果の分類）
//! - [`instance`][]: インスタンスの状態モデル
//! - [`context`][]: ステップ出力のコンテキスト
//! - [`result`][]: ステップ結果・失敗分類・ステータスレポート
//! - [`retry`][]: 再試行間隔
//!
//! # 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use melted_orchestrator::agent::{AgentRequest, AgentResponse, FnAgent, StaticResolver};
//! use melted_orchestrator::config::WorkflowDefinition;
//! use melted_orchestrator::engine::WorkflowEngine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. 定義を読み込む
//!     let definition = WorkflowDefinition::from_file("workflows/example.toml")?;
//!
//!     // 2. エージェントを登録してエンジンを構築
//!     let resolver = StaticResolver::new().with(
//!         "calculator",
//!         FnAgent::shared(|req: AgentRequest| async move { Ok(AgentResponse::success(req.input)) }),
//!     );
//!     let engine = WorkflowEngine::builder().resolver(Arc::new(resolver)).build();
//!
//!     // 3. 実行して完了を待つ
//!     let id = engine.start(engine.register(definition), Default::default()).await?;
//!     let instance = engine.wait(id).await?;
//!
//!     // 4. 結果を出力
//!     println!("Status: {}", instance.status);
//!     for step_id in instance.context.keys() {
//!         println!("  Step {}: {:?}", step_id, instance.context.get(step_id));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod executor;
pub mod instance;
pub mod orchestrator;
pub mod result;
pub mod retry;

// 公開APIの再エクスポート
pub use context::{Context, Payload};
pub use executor::StepExecutor;
pub use instance::{InstanceId, InstanceStatus, WorkflowInstance};
pub use orchestrator::{CancelOutcome, EngineBuilder, WorkflowEngine};
pub use result::{FailureDetail, FailureKind, StatusReport, StepOutcome, StepResult};
pub use retry::BackoffPolicy;
