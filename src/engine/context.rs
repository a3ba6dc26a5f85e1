//! ステップ間で共有するコンテキストの管理
//!
//! # 責務
//!
//! - 完了したステップの出力をステップ ID ごとに保持
//! - 後続ステップの入力マッピング（`<ステップID>.<フィールド名>`）の解決
//! - 書き込みは1キーにつき1回限り（再書き込みは拒否）
//!
//! # 主要な型
//!
//! - [`Payload`][]: エージェントとやり取りする JSON オブジェクト
//! - [`Context`][]: ステップ ID → 出力ペイロードのマップ
//!
//! # 使用例
//!
//! ```rust
//! use melted_orchestrator::engine::context::{Context, Payload};
//! use serde_json::json;
//!
//! let mut ctx = Context::new();
//!
//! let mut output = Payload::new();
//! output.insert("bmi".to_string(), json!(22.4));
//! ctx.insert("calculate", output).unwrap();
//!
//! assert_eq!(ctx.field("calculate", "bmi"), Some(&json!(22.4)));
//! assert!(ctx.insert("calculate", Payload::new()).is_err());
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// エージェントとやり取りする JSON オブジェクト
pub type Payload = serde_json::Map<String, Value>;

/// コンテキスト操作のエラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    /// 同じステップの出力が既に記録されている
    #[error("ステップ '{0}' の出力は既に記録されています")]
    AlreadyRecorded(String),
}

/// ステップ出力のコンテキスト
///
/// キーの順序を安定させるため `BTreeMap` で保持します（永続化時の差分が読みやすい）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    entries: BTreeMap<String, Payload>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// ステップの出力を記録
    ///
    /// # エラー
    ///
    /// - [`ContextError::AlreadyRecorded`] - 同じキーへの2回目の書き込み
    pub fn insert(&mut self, step_id: impl Into<String>, output: Payload) -> Result<(), ContextError> {
        let step_id = step_id.into();
        if self.entries.contains_key(&step_id) {
            return Err(ContextError::AlreadyRecorded(step_id));
        }
        self.entries.insert(step_id, output);
        Ok(())
    }

    pub fn get(&self, step_id: &str) -> Option<&Payload> {
        self.entries.get(step_id)
    }

    /// ステップ出力の特定フィールドを取得
    pub fn field(&self, step_id: &str, field: &str) -> Option<&Value> {
        self.entries.get(step_id)?.get(field)
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.entries.contains_key(step_id)
    }

    /// 記録済みのステップ ID（辞書順）
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
