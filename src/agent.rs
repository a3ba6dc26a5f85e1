//! エージェント呼び出し層
//!
//! # 責務
//!
//! - 任意の専門エージェントを統一的に呼び出すインターフェースを提供
//! - エージェント ID から呼び出し先への解決（[`AgentResolver`]）
//! - 設定ファイルのバインディングから呼び出し先を生成するファクトリー機能
//!
//! # モジュール構成
//!
//! - `traits` - 共通インターフェース（[`AgentTarget`]トレイト等）
//! - `client` - タイムアウトを強制する呼び出しクライアント
//! - `wire` - コマンド/HTTP で共通の JSON エンベロープ
//! - `command` - 外部プロセスのエージェント
//! - `http` - HTTP エンドポイントのエージェント
//! - `function` - インプロセスのクロージャ
//!
//! # 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use melted_orchestrator::agent::{AgentClient, AgentRequest, StaticResolver};
//! use melted_orchestrator::agent::command::CommandAgent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resolver = StaticResolver::new()
//!         .with("calculator", Arc::new(CommandAgent::new("python3").with_args(["calculator.py"])));
//!     let client = AgentClient::new(Arc::new(resolver));
//!
//!     let request = AgentRequest {
//!         agent_id: "calculator".to_string(),
//!         correlation_id: "manual:bmi".to_string(),
//!         attempt: 1,
//!         input: Default::default(),
//!     };
//!     let response = client.invoke("calculator", request, Duration::from_secs(30)).await?;
//!     println!("success: {}", response.success);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod command;
pub mod function;
pub mod http;
pub mod traits;
pub mod wire;

// 公開APIの再エクスポート
pub use client::AgentClient;
pub use function::FnAgent;
pub use traits::{
    AgentErrorCode, AgentRequest, AgentResolver, AgentResponse, AgentTarget, StaticResolver,
};

use std::sync::Arc;

use crate::config::settings::AgentBinding;

/// バインディング設定から呼び出し先を生成するファクトリー関数
pub fn create_target(binding: &AgentBinding) -> Arc<dyn AgentTarget> {
    match binding {
        AgentBinding::Command {
            command, args, env, ..
        } => Arc::new(
            command::CommandAgent::new(command.clone())
                .with_args(args.iter().cloned())
                .with_env(env.clone()),
        ),
        AgentBinding::Http { url, headers, .. } => {
            Arc::new(http::HttpAgent::new(url.clone()).with_headers(headers.clone()))
        }
    }
}

impl StaticResolver {
    /// バインディング設定の一覧からリゾルバーを構築
    pub fn from_bindings(bindings: &[AgentBinding]) -> Self {
        bindings.iter().fold(StaticResolver::new(), |resolver, binding| {
            resolver.with(binding.id(), create_target(binding))
        })
    }
}
