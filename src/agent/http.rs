//! HTTP エンドポイントとして公開されたエージェント
//!
//! [`AgentRequest`] を JSON で POST し、レスポンスボディをエンベロープとして解釈します。
//!
//! | ステータス        | 扱い                                 |
//! |-------------------|--------------------------------------|
//! | 2xx               | ボディをエンベロープとして解析       |
//! | 429 / 5xx         | `transient` の失敗レスポンス         |
//! | その他 4xx        | `permanent` の失敗レスポンス         |

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;

use super::traits::{AgentErrorCode, AgentRequest, AgentResponse, AgentTarget};
use super::wire::parse_envelope;
use crate::error::AgentError;

/// HTTP エージェント
#[derive(Debug, Clone)]
pub struct HttpAgent {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl HttpAgent {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    /// 既存の `reqwest::Client` を共有して生成
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn classify_status(status: StatusCode) -> AgentErrorCode {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            AgentErrorCode::Transient
        } else {
            AgentErrorCode::Permanent
        }
    }
}

#[async_trait]
impl AgentTarget for HttpAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| AgentError::InvalidResponse(format!("リクエストのシリアライズに失敗: {e}")))?;

        let mut builder = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header("x-correlation-id", &request.correlation_id);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let response = builder.body(body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let measured = started.elapsed();

        if status.is_success() {
            return parse_envelope(&bytes, measured);
        }

        tracing::warn!(
            url = %self.url,
            status = status.as_u16(),
            correlation_id = %request.correlation_id,
            "agent endpoint returned error status"
        );

        let detail = match parse_envelope(&bytes, measured) {
            Ok(AgentResponse { error: Some(error), .. }) => error,
            _ => String::from_utf8_lossy(&bytes).into_owned(),
        };
        Ok(
            AgentResponse::failure(Some(Self::classify_status(status)), format!("HTTP {status}: {detail}"))
                .with_latency(measured),
        )
    }
}
