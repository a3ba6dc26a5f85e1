//! オーケストレーター全体の設定
//!
//! # 責務
//!
//! - エンジン設定（バックオフ、既定タイムアウト、イベントキュー容量）
//! - ログ設定（レベル、形式、出力先ディレクトリ）
//! - エージェントのバインディング（コマンド / HTTP）
//!
//! すべての項目に既定値があるため、空の TOML でも読み込めます。
//!
//! ```toml
//! [engine]
//! backoff_base_ms = 200
//! backoff_cap_ms = 10000
//! default_timeout_secs = 120
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! directory = "logs"
//!
//! [[agents]]
//! kind = "command"
//! id = "planner"
//! command = "python3"
//! args = ["agents/planner.py"]
//!
//! [[agents]]
//! kind = "http"
//! id = "reviewer"
//! url = "http://localhost:8080/invocations"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::retry::BackoffPolicy;
use crate::error::ConfigError;

/// 設定ファイル全体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
    pub agents: Vec<AgentBinding>,
}

impl Settings {
    /// TOML ファイルから読み込む
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// TOML 文字列から読み込む
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(toml)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.backoff_cap_ms < self.engine.backoff_base_ms {
            return Err(ConfigError::Validation(format!(
                "backoff_cap_ms ({}) は backoff_base_ms ({}) 以上である必要があります",
                self.engine.backoff_cap_ms, self.engine.backoff_base_ms
            )));
        }
        if self.engine.default_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "default_timeout_secs は1以上である必要があります".to_string(),
            ));
        }
        if self.engine.event_buffer == 0 {
            return Err(ConfigError::Validation(
                "event_buffer は1以上である必要があります".to_string(),
            ));
        }
        for (i, agent) in self.agents.iter().enumerate() {
            if self.agents[..i].iter().any(|other| other.id() == agent.id()) {
                return Err(ConfigError::Validation(format!(
                    "エージェント '{}' のバインディングが重複しています",
                    agent.id()
                )));
            }
        }
        Ok(())
    }
}

/// エンジン設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// リトライ間隔の基準値（ミリ秒）
    pub backoff_base_ms: u64,
    /// リトライ間隔の上限（ミリ秒）
    pub backoff_cap_ms: u64,
    /// ステップにタイムアウト指定が無い場合の既定値（秒）
    pub default_timeout_secs: u64,
    /// イベントキューの容量
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            default_timeout_secs: 300,
            event_buffer: 1024,
        }
    }
}

impl EngineSettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// ログ出力形式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `RUST_LOG` が未設定の場合に使うフィルタ
    pub level: String,
    pub format: LogFormat,
    /// 指定時は日次ローテーションのファイルにも出力
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            directory: None,
            file_prefix: "melted-orchestrator.log".to_string(),
        }
    }
}

/// エージェント ID と呼び出し先の対応
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentBinding {
    /// 外部プロセスとして起動し、標準入出力で JSON をやり取りする
    Command {
        id: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// HTTP エンドポイントに JSON を POST する
    Http {
        id: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl AgentBinding {
    pub fn id(&self) -> &str {
        match self {
            AgentBinding::Command { id, .. } | AgentBinding::Http { id, .. } => id,
        }
    }
}
