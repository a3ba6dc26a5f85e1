//! エラー型の定義
//!
//! このモジュールは、Melted Orchestrator 全体で使用されるエラー型を定義します。
//!
//! - [`ConfigError`]: ワークフロー定義・設定ファイルの読み込みとバリデーション
//! - [`AgentError`]: エージェント呼び出しのプロトコルレベルの失敗
//! - [`StoreError`]: 状態ストアの操作失敗（楽観的ロックの衝突を含む）
//! - [`EngineError`]: 呼び出し側に返すワークフローエンジンのエラー
//! - [`EventError`]: イベントシンクへの配信失敗
//! - [`LoggingError`]: ログ出力の初期化失敗

use thiserror::Error;

use crate::engine::instance::InstanceId;

/// 設定関連のエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    /// ファイルの読み込みに失敗
    #[error("設定ファイルの読み込みに失敗しました: {0}")]
    FileRead(#[from] std::io::Error),

    /// TOML のデシリアライズに失敗
    #[error("TOML のデシリアライズに失敗しました: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    /// TOML のシリアライズに失敗
    #[error("TOML のシリアライズに失敗しました: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// バリデーションエラー
    #[error("設定のバリデーションに失敗しました: {0}")]
    Validation(String),
}

/// エージェント呼び出しのエラー
///
/// ここに含まれるのはプロトコルレベルの失敗のみです。
/// エージェントが業務的に返したエラーは [`AgentResponse`](crate::agent::AgentResponse)
/// の失敗レスポンスとして表現されます。
#[derive(Debug, Error)]
pub enum AgentError {
    /// リゾルバーに登録されていないエージェント
    #[error("エージェント '{0}' が見つかりません")]
    UnknownAgent(String),

    /// コマンドが見つからない
    #[error("コマンド '{0}' が見つかりません")]
    CommandNotFound(String),

    /// プロセス実行エラー
    #[error("エージェントプロセスの実行に失敗しました: {0}")]
    ProcessFailed(String),

    /// 入出力エラー
    #[error("入出力エラー: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP 通信エラー
    #[error("HTTP 通信に失敗しました: {0}")]
    Http(#[from] reqwest::Error),

    /// 不正なレスポンス
    #[error("不正なレスポンス: {0}")]
    InvalidResponse(String),
}

impl AgentError {
    /// 再試行で解消しうる失敗かどうか
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Io(_) | AgentError::ProcessFailed(_) => true,
            AgentError::Http(err) => err.is_timeout() || err.is_connect(),
            AgentError::UnknownAgent(_)
            | AgentError::CommandNotFound(_)
            | AgentError::InvalidResponse(_) => false,
        }
    }
}

/// 状態ストアのエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// インスタンスが存在しない
    #[error("インスタンス {0} が見つかりません")]
    NotFound(InstanceId),

    /// 同じ ID のインスタンスが既に存在する
    #[error("インスタンス {0} は既に存在します")]
    AlreadyExists(InstanceId),

    /// 楽観的ロックの衝突
    #[error("インスタンス {id} の更新が衝突しました（期待バージョン {expected}, 保存済みバージョン {actual}）")]
    Conflict {
        /// 対象インスタンス
        id: InstanceId,
        /// 書き込み側が前提としたバージョン
        expected: u64,
        /// ストアに保存されているバージョン
        actual: u64,
    },

    /// 入出力エラー
    #[error("状態ファイルの入出力に失敗しました: {0}")]
    Io(#[from] std::io::Error),

    /// シリアライズエラー
    #[error("状態のシリアライズに失敗しました: {0}")]
    Serde(#[from] serde_json::Error),
}

/// ワークフローエンジンが呼び出し側に返すエラー
///
/// 楽観的ロックの衝突 (`conflict`) はエンジン内部で回復されるため、
/// ここには現れません。
#[derive(Debug, Error)]
pub enum EngineError {
    /// 登録されていないワークフロー定義
    #[error("ワークフロー定義 '{0}' が見つかりません")]
    UnknownDefinition(String),

    /// 初期入力が定義の要求を満たさない
    #[error("初期入力が不正です: {0}")]
    InvalidInitialPayload(String),

    /// ワークフロー定義の不備
    #[error("ワークフロー定義のエラー: {0}")]
    Configuration(#[from] ConfigError),

    /// インスタンスが存在しない
    #[error("インスタンス {0} が見つかりません")]
    NotFound(InstanceId),

    /// インスタンスが既に終了している
    #[error("インスタンス {0} は既に終了しています")]
    AlreadyTerminal(InstanceId),

    /// 別の実行ドライバーがインスタンスを保持している
    #[error("インスタンス {0} は別の実行ドライバーが処理中です")]
    Busy(InstanceId),

    /// 状態ストアの失敗
    #[error("状態ストアのエラー: {0}")]
    Store(StoreError),

    /// 実行ドライバーが `failed` すら保存できずに停止した
    #[error("インスタンス {id} の実行ドライバーが停止しました: {message}")]
    Aborted { id: InstanceId, message: String },
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Store(other),
        }
    }
}

/// イベント配信のエラー
#[derive(Debug, Error)]
pub enum EventError {
    /// シンクへの配信に失敗
    #[error("イベントの配信に失敗しました: {0}")]
    Delivery(String),

    /// シリアライズエラー
    #[error("イベントのシリアライズに失敗しました: {0}")]
    Serde(#[from] serde_json::Error),
}

/// ログ初期化のエラー
#[derive(Debug, Error)]
pub enum LoggingError {
    /// ログレベル指定の解析に失敗
    #[error("ログフィルタの解析に失敗しました: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    /// グローバルなサブスクライバーが既に設定されている
    #[error("ログの初期化に失敗しました: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}
