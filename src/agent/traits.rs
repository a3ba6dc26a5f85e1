//! エージェント呼び出しの共通インターフェース定義
//!
//! # 責務
//!
//! - 呼び出し先の共通トレイト [`AgentTarget`] を定義
//! - エージェント ID から呼び出し先を解決する [`AgentResolver`] を定義
//! - トランスポート非依存のリクエスト/レスポンス型を提供
//!
//! # 実装パターン
//!
//! バインディングの方式（関数呼び出し、プロセス起動、HTTP）は [`AgentTarget`]
//! の実装側で決まり、オーケストレーター本体はそれを知りません。
//!
//! ```rust,ignore
//! #[async_trait]
//! impl AgentTarget for MyAgent {
//!     async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
//!         let output = do_work(&request.input).await?;
//!         Ok(AgentResponse::success(output))
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::context::Payload;
use crate::error::AgentError;

/// エージェントの呼び出し先
///
/// # 実装要件
///
/// - `Send + Sync`: 複数インスタンスから同時に呼び出される
/// - 業務的な失敗は `Ok(AgentResponse::failure(..))` で返し、
///   `Err` はプロトコルレベルの失敗に限る
#[async_trait]
pub trait AgentTarget: Send + Sync {
    /// リクエストを処理してレスポンスを返す
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// エージェント ID から呼び出し先を解決する
pub trait AgentResolver: Send + Sync {
    fn resolve(&self, agent_id: &str) -> Option<Arc<dyn AgentTarget>>;
}

/// エージェントへのリクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// 呼び出すエージェント ID
    pub agent_id: String,

    /// トレース用の相関 ID（`<インスタンスID>:<ステップID>`）
    pub correlation_id: String,

    /// 同一ステップ内での試行回数（1始まり）
    pub attempt: u32,

    /// 入力ペイロード
    pub input: Payload,
}

/// エージェント側のエラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorCode {
    /// 一時的な失敗（再試行で解消しうる）
    Transient,
    /// 恒久的な失敗（入力検証エラー等）
    Permanent,
    /// 呼び出し側のタイムアウト
    Timeout,
}

impl AgentErrorCode {
    /// 再試行対象か
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentErrorCode::Transient | AgentErrorCode::Timeout)
    }
}

/// エージェントからのレスポンス
///
/// 呼び出し先固有の形式を共通の型に変換したもの。
/// ペイロードの中身は解釈しません。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResponse {
    /// 成功フラグ
    pub success: bool,

    /// 出力ペイロード（失敗時は空）
    pub output: Payload,

    /// エラー内容（失敗時のみ）
    pub error: Option<String>,

    /// エラーコード（失敗時のみ、エージェントが返さない場合は `None`）
    pub error_code: Option<AgentErrorCode>,

    /// エージェントが報告したレイテンシ
    pub latency: Duration,
}

impl AgentResponse {
    /// 成功レスポンス
    pub fn success(output: Payload) -> Self {
        Self {
            success: true,
            output,
            error: None,
            error_code: None,
            latency: Duration::ZERO,
        }
    }

    /// 失敗レスポンス
    pub fn failure(code: Option<AgentErrorCode>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Payload::new(),
            error: Some(error.into()),
            error_code: code,
            latency: Duration::ZERO,
        }
    }

    /// タイムアウトを表す合成レスポンス
    pub fn timeout(after: Duration) -> Self {
        Self {
            latency: after,
            ..Self::failure(
                Some(AgentErrorCode::Timeout),
                format!("{}ms 以内に応答がありませんでした", after.as_millis()),
            )
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// エージェント ID と呼び出し先の静的な対応表
#[derive(Default, Clone)]
pub struct StaticResolver {
    targets: HashMap<String, Arc<dyn AgentTarget>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 呼び出し先を登録（同じ ID は上書き）
    pub fn register(&mut self, agent_id: impl Into<String>, target: Arc<dyn AgentTarget>) {
        self.targets.insert(agent_id.into(), target);
    }

    /// ビルダー形式での登録
    pub fn with(mut self, agent_id: impl Into<String>, target: Arc<dyn AgentTarget>) -> Self {
        self.register(agent_id, target);
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl AgentResolver for StaticResolver {
    fn resolve(&self, agent_id: &str) -> Option<Arc<dyn AgentTarget>> {
        self.targets.get(agent_id).cloned()
    }
}

impl std::fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut agents: Vec<&String> = self.targets.keys().collect();
        agents.sort();
        f.debug_struct("StaticResolver").field("agents", &agents).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl AgentTarget for Echo {
        async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
            Ok(AgentResponse::success(request.input.clone()))
        }
    }

    #[test]
    fn test_error_code_retryable() {
        assert!(AgentErrorCode::Transient.is_retryable());
        assert!(AgentErrorCode::Timeout.is_retryable());
        assert!(!AgentErrorCode::Permanent.is_retryable());
    }

    #[test]
    fn test_timeout_response() {
        let response = AgentResponse::timeout(Duration::from_millis(1500));

        assert!(!response.success);
        assert_eq!(response.error_code, Some(AgentErrorCode::Timeout));
        assert_eq!(response.latency, Duration::from_millis(1500));
        assert!(response.output.is_empty());
    }

    #[test]
    fn test_static_resolver() {
        let resolver = StaticResolver::new().with("echo", Arc::new(Echo));

        assert_eq!(resolver.len(), 1);
        assert!(resolver.resolve("echo").is_some());
        assert!(resolver.resolve("missing").is_none());
    }
}
