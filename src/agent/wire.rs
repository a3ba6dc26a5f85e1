//! エージェントとの JSON ワイヤー形式
//!
//! コマンド/HTTP バインディングで共通に使うレスポンスエンベロープです。
//!
//! ```json
//! {"status": "success", "output": {"bmi": 22.4}, "latency_ms": 812}
//! {"status": "error", "error": "upstream overloaded", "error_code": "transient"}
//! ```
//!
//! `output` を持たず `response` にテキストだけを返すエージェントの場合、
//! 出力は `{"response": "..."}` として扱います。

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::traits::{AgentErrorCode, AgentResponse};
use crate::engine::context::Payload;
use crate::error::AgentError;

/// レスポンスの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EnvelopeStatus {
    Success,
    Error,
}

/// エージェントが返すレスポンスエンベロープ
#[derive(Debug, Deserialize)]
struct AgentEnvelope {
    status: EnvelopeStatus,
    #[serde(default)]
    output: Option<Payload>,
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<AgentErrorCode>,
    #[serde(default)]
    latency_ms: Option<u64>,
}

impl AgentEnvelope {
    fn into_response(self, measured: Duration) -> AgentResponse {
        let latency = self
            .latency_ms
            .map(Duration::from_millis)
            .unwrap_or(measured);

        let response = match self.status {
            EnvelopeStatus::Success => {
                let output = match (self.output, self.response) {
                    (Some(output), _) => output,
                    (None, Some(response)) => {
                        let mut output = Payload::new();
                        output.insert("response".to_string(), response);
                        output
                    }
                    (None, None) => Payload::new(),
                };
                AgentResponse::success(output)
            }
            EnvelopeStatus::Error => AgentResponse::failure(
                self.error_code,
                self.error
                    .unwrap_or_else(|| "エージェントがエラーを返しました".to_string()),
            ),
        };
        response.with_latency(latency)
    }
}

/// バイト列をエンベロープとして解釈する
///
/// # エラー
///
/// - [`AgentError::InvalidResponse`] - JSON として不正、またはエンベロープ形式でない
pub fn parse_envelope(bytes: &[u8], measured: Duration) -> Result<AgentResponse, AgentError> {
    let envelope: AgentEnvelope = serde_json::from_slice(bytes).map_err(|e| {
        AgentError::InvalidResponse(format!(
            "レスポンスの JSON 解析に失敗しました: {}. 出力: {}",
            e,
            String::from_utf8_lossy(bytes)
        ))
    })?;
    Ok(envelope.into_response(measured))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_success_with_output() {
        let bytes = br#"{"status": "success", "output": {"bmi": 22.4}, "latency_ms": 812}"#;
        let response = parse_envelope(bytes, Duration::from_secs(1)).unwrap();

        assert!(response.success);
        assert_eq!(response.output["bmi"], json!(22.4));
        assert_eq!(response.latency, Duration::from_millis(812));
    }

    #[test]
    fn test_parse_success_with_text_response() {
        let bytes = br#"{"status": "success", "response": "BMI is 22.4"}"#;
        let response = parse_envelope(bytes, Duration::from_millis(30)).unwrap();

        assert!(response.success);
        assert_eq!(response.output["response"], json!("BMI is 22.4"));
        assert_eq!(response.latency, Duration::from_millis(30));
    }

    #[test]
    fn test_parse_error_with_code() {
        let bytes = br#"{"status": "error", "error": "overloaded", "error_code": "transient"}"#;
        let response = parse_envelope(bytes, Duration::ZERO).unwrap();

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("overloaded"));
        assert_eq!(response.error_code, Some(AgentErrorCode::Transient));
    }

    #[test]
    fn test_parse_error_without_code() {
        let bytes = br#"{"status": "error"}"#;
        let response = parse_envelope(bytes, Duration::ZERO).unwrap();

        assert!(!response.success);
        assert!(response.error_code.is_none());
    }

    #[test]
    fn test_parse_invalid_json() {
        let result = parse_envelope(b"not json", Duration::ZERO);
        assert!(matches!(result, Err(AgentError::InvalidResponse(_))));
    }
}
