//! 外部コマンドとして起動するエージェント
//!
//! # 責務
//!
//! - 設定されたコマンドをエージェントごとにプロセスとして起動
//! - [`AgentRequest`] を JSON で標準入力に書き込む
//! - 標準出力のエンベロープ（[`wire`](super::wire) 参照）を [`AgentResponse`] に変換
//!
//! # プロセスの扱い
//!
//! - 呼び出しがキャンセル・タイムアウトされた場合、子プロセスは破棄時に kill されます
//! - 非0の終了コードでも、標準出力がエンベロープとして読めればそれを採用します
//! - 読めない場合は標準エラー出力から失敗の種類を推定します
//!
//! # 使用例
//!
//! ```rust,no_run
//! use melted_orchestrator::agent::command::CommandAgent;
//!
//! let agent = CommandAgent::new("python3").with_args(["agents/calculator.py"]);
//! ```

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::traits::{AgentErrorCode, AgentRequest, AgentResponse, AgentTarget};
use super::wire::parse_envelope;
use crate::error::AgentError;

/// 外部コマンドのエージェント
#[derive(Debug, Clone)]
pub struct CommandAgent {
    /// 起動するコマンド
    command: String,
    /// コマンド引数
    args: Vec<String>,
    /// 追加の環境変数
    env: BTreeMap<String, String>,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// 標準エラー出力から失敗の種類を推定
    fn classify_stderr(stderr: &str) -> AgentErrorCode {
        let lower = stderr.to_lowercase();
        if lower.contains("rate limit")
            || lower.contains("429")
            || lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("temporarily unavailable")
        {
            AgentErrorCode::Transient
        } else {
            AgentErrorCode::Permanent
        }
    }
}

#[async_trait]
impl AgentTarget for CommandAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| AgentError::InvalidResponse(format!("リクエストのシリアライズに失敗: {e}")))?;

        let started = Instant::now();
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .env("MELTED_AGENT_ID", &request.agent_id)
            .env("MELTED_CORRELATION_ID", &request.correlation_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AgentError::CommandNotFound(self.command.clone()),
                _ => AgentError::Io(e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = match stdin.write_all(&payload).await {
                Ok(()) => stdin.shutdown().await,
                Err(err) => Err(err),
            };
            match written {
                Ok(()) => {}
                // 標準入力を読まずに終了したエージェントも出力は採用する
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    tracing::debug!(command = %self.command, "agent closed stdin before reading the request");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let output = child.wait_with_output().await?;
        let measured = started.elapsed();

        if output.status.success() {
            return parse_envelope(&output.stdout, measured);
        }

        // 非0終了でもエンベロープを返していればそれを優先
        if let Ok(response) = parse_envelope(&output.stdout, measured) {
            if !response.success {
                return Ok(response);
            }
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = Self::classify_stderr(&stderr);
        tracing::warn!(
            command = %self.command,
            exit_code = output.status.code().unwrap_or(-1),
            stderr = %stderr.trim(),
            "agent process exited with failure"
        );
        Ok(AgentResponse::failure(
            Some(code),
            format!(
                "コマンドが終了コード {} で失敗しました: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        )
        .with_latency(measured))
    }
}
