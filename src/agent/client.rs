//! エージェント呼び出しクライアント
//!
//! # 責務
//!
//! - エージェント ID を [`AgentResolver`] で呼び出し先に解決
//! - 呼び出し側が指定したタイムアウトの強制（超過時は合成 `timeout` レスポンス）
//! - プロトコルレベルの失敗をレスポンスとして表面化
//!
//! ペイロードの業務的な中身は解釈しません。

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::traits::{AgentErrorCode, AgentRequest, AgentResolver, AgentResponse};
use crate::error::AgentError;

/// エージェント呼び出しクライアント
#[derive(Clone)]
pub struct AgentClient {
    resolver: Arc<dyn AgentResolver>,
}

impl AgentClient {
    pub fn new(resolver: Arc<dyn AgentResolver>) -> Self {
        Self { resolver }
    }

    /// エージェント ID が解決可能か
    pub fn resolves(&self, agent_id: &str) -> bool {
        self.resolver.resolve(agent_id).is_some()
    }

    /// エージェントを呼び出す
    ///
    /// # 戻り値
    ///
    /// - `Ok(AgentResponse)`: 成功・失敗を問わずエージェントの応答（タイムアウトは合成レスポンス）
    /// - `Err(AgentError::UnknownAgent)`: エージェント ID を解決できない場合のみ
    pub async fn invoke(
        &self,
        agent_id: &str,
        request: AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, AgentError> {
        let target = self
            .resolver
            .resolve(agent_id)
            .ok_or_else(|| AgentError::UnknownAgent(agent_id.to_string()))?;

        tracing::debug!(
            agent_id,
            correlation_id = %request.correlation_id,
            attempt = request.attempt,
            "invoking agent"
        );

        let started = Instant::now();
        let response = match tokio::time::timeout(timeout, target.invoke(&request)).await {
            Ok(Ok(response)) if response.latency.is_zero() => {
                response.with_latency(started.elapsed())
            }
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let code = if err.is_transient() {
                    AgentErrorCode::Transient
                } else {
                    AgentErrorCode::Permanent
                };
                tracing::warn!(
                    agent_id,
                    correlation_id = %request.correlation_id,
                    error = %err,
                    "agent invocation failed"
                );
                AgentResponse::failure(Some(code), err.to_string()).with_latency(started.elapsed())
            }
            Err(_) => {
                tracing::warn!(
                    agent_id,
                    correlation_id = %request.correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "agent invocation timed out"
                );
                AgentResponse::timeout(timeout)
            }
        };

        tracing::debug!(
            agent_id,
            correlation_id = %request.correlation_id,
            success = response.success,
            latency_ms = response.latency.as_millis() as u64,
            "agent responded"
        );
        Ok(response)
    }
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::function::FnAgent;
    use crate::agent::traits::StaticResolver;
    use crate::engine::context::Payload;
    use serde_json::json;

    fn request(agent_id: &str) -> AgentRequest {
        AgentRequest {
            agent_id: agent_id.to_string(),
            correlation_id: "instance:step".to_string(),
            attempt: 1,
            input: Payload::new(),
        }
    }

    fn client() -> AgentClient {
        let resolver = StaticResolver::new()
            .with(
                "fast",
                FnAgent::shared(|_req: AgentRequest| async {
                    let mut output = Payload::new();
                    output.insert("answer".to_string(), json!(42));
                    Ok(AgentResponse::success(output))
                }),
            )
            .with(
                "slow",
                FnAgent::shared(|_req: AgentRequest| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(AgentResponse::success(Payload::new()))
                }),
            )
            .with(
                "broken",
                FnAgent::shared(|_req: AgentRequest| async {
                    Err(AgentError::InvalidResponse("garbage".to_string()))
                }),
            );
        AgentClient::new(Arc::new(resolver))
    }

    #[tokio::test]
    async fn test_invoke_success_measures_latency() {
        let response = client()
            .invoke("fast", request("fast"), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.output["answer"], json!(42));
    }

    #[tokio::test]
    async fn test_invoke_timeout_is_synthetic_response() {
        let response = client()
            .invoke("slow", request("slow"), Duration::from_millis(20))
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.error_code, Some(AgentErrorCode::Timeout));
    }

    #[tokio::test]
    async fn test_invoke_protocol_error_becomes_failure() {
        let response = client()
            .invoke("broken", request("broken"), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.error_code, Some(AgentErrorCode::Permanent));
    }

    #[tokio::test]
    async fn test_invoke_unknown_agent() {
        let result = client()
            .invoke("ghost", request("ghost"), Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(AgentError::UnknownAgent(id)) if id == "ghost"));
        assert!(!client().resolves("ghost"));
        assert!(client().resolves("fast"));
    }
}
