//! ステップ間の遷移テーブル
//!
//! 「次にどのステップを実行するか」を暗黙の制御フローではなく、
//! `(ステップID, 結果タグ) → 遷移先` の明示的なテーブルとして保持します。

use std::collections::HashMap;
use std::fmt;

use crate::engine::result::StepOutcome;

/// 終了を表す遷移先の予約名
pub const END: &str = "end";

/// 遷移先
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// 次のステップ
    Step(String),
    /// ワークフロー終了（成功）
    End,
}

impl Target {
    /// TOML 表記から遷移先を生成
    pub fn parse(raw: &str) -> Self {
        if raw == END {
            Target::End
        } else {
            Target::Step(raw.to_string())
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Step(id) => f.write_str(id),
            Target::End => f.write_str(END),
        }
    }
}

/// 遷移テーブル
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    rules: HashMap<(String, StepOutcome), Target>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// ルールを追加（同じキーは上書き）
    pub fn insert(&mut self, step_id: impl Into<String>, outcome: StepOutcome, target: Target) {
        self.rules.insert((step_id.into(), outcome), target);
    }

    /// 遷移先を引く
    ///
    /// ルールが無い場合は `None` を返します。
    /// 呼び出し側は `ok` に対するルール欠落を設定エラーとして扱います。
    pub fn next(&self, step_id: &str, outcome: StepOutcome) -> Option<&Target> {
        self.rules.get(&(step_id.to_string(), outcome))
    }

    /// 指定ステップから出る遷移先（ステップのみ）
    pub fn successors<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        StepOutcome::ALL
            .iter()
            .filter_map(move |outcome| match self.next(step_id, *outcome) {
                Some(Target::Step(next)) => Some(next.as_str()),
                _ => None,
            })
    }

    /// 全ルールを走査
    pub fn iter(&self) -> impl Iterator<Item = (&str, StepOutcome, &Target)> {
        self.rules
            .iter()
            .map(|((step, outcome), target)| (step.as_str(), *outcome, target))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
