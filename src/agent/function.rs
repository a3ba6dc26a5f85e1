//! クロージャによるインプロセスのエージェント
//!
//! 同じプロセス内の非同期関数をエージェントとして登録します。
//! 組み込み用途とテストで使用します。

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::traits::{AgentRequest, AgentResponse, AgentTarget};
use crate::error::AgentError;

/// 非同期クロージャをラップした呼び出し先
pub struct FnAgent<F> {
    f: F,
}

impl<F, Fut> FnAgent<F>
where
    F: Fn(AgentRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentResponse, AgentError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// リゾルバーに登録できる形で生成
    pub fn shared(f: F) -> Arc<dyn AgentTarget> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> AgentTarget for FnAgent<F>
where
    F: Fn(AgentRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentResponse, AgentError>> + Send + 'static,
{
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        (self.f)(request.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::Payload;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_agent_receives_request() {
        let agent = FnAgent::new(|req: AgentRequest| async move {
            let mut output = Payload::new();
            output.insert("seen".to_string(), json!(req.correlation_id));
            Ok(AgentResponse::success(output))
        });

        let response = agent
            .invoke(&AgentRequest {
                agent_id: "echo".to_string(),
                correlation_id: "abc:step".to_string(),
                attempt: 1,
                input: Payload::new(),
            })
            .await
            .unwrap();

        assert_eq!(response.output["seen"], json!("abc:step"));
    }
}
