//! ライフサイクルイベントの通知
//!
//! # 責務
//!
//! - インスタンスとステップの状態遷移を [`WorkflowEvent`] として外部に通知
//! - 遷移を止めない非同期配信（キューに積んで専用タスクが順に配信）
//! - シンクの失敗・キューあふれは `tracing` に記録するのみ
//!
//! # 配信順序
//!
//! すべてのイベントは1本の FIFO キューを通るため、同じインスタンスのイベントは
//! 遷移した順にシンクへ届きます。
//!
//! # 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use melted_orchestrator::events::{BroadcastSink, EventNotifier, EventSink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let broadcast = Arc::new(BroadcastSink::new(256));
//!     let mut rx = broadcast.subscribe();
//!     let sinks: Vec<Arc<dyn EventSink>> = vec![broadcast];
//!     let notifier = EventNotifier::spawn(sinks, 1024);
//!
//!     // エンジンに notifier を渡すと、以降のイベントが rx に届く
//!     # drop(notifier);
//!     while let Ok(event) = rx.recv().await {
//!         println!("{} {:?}", event.instance_id, event.kind);
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::engine::context::Payload;
use crate::engine::instance::InstanceId;
use crate::error::EventError;

/// イベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    StepStarted,
    StepCompleted,
    Retrying,
    Failed,
    Succeeded,
    Cancelled,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Started => "started",
            EventKind::StepStarted => "step_started",
            EventKind::StepCompleted => "step_completed",
            EventKind::Retrying => "retrying",
            EventKind::Failed => "failed",
            EventKind::Succeeded => "succeeded",
            EventKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// ライフサイクルイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub instance_id: InstanceId,
    pub step_id: Option<String>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// 試行回数・失敗理由などの小さな付帯情報
    #[serde(default)]
    pub metadata: Payload,
}

impl WorkflowEvent {
    pub fn new(instance_id: InstanceId, kind: EventKind) -> Self {
        Self {
            instance_id,
            step_id: None,
            kind,
            timestamp: Utc::now(),
            metadata: Payload::new(),
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// 付帯情報を設定（オブジェクト以外の値は無視）
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        if let Value::Object(map) = metadata {
            self.metadata = map;
        }
        self
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// イベントの配信先
///
/// # 実装要件
///
/// - 失敗は `Err` で返す（ディスパッチャーがログに記録して次のシンクへ進む）
/// - 配信は1件ずつ順に呼ばれる
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &WorkflowEvent) -> Result<(), EventError>;
}

/// イベント通知のハンドル
///
/// `publish` はブロックせず、キューが満杯の場合はイベントを捨てて警告を出します。
#[derive(Debug, Clone)]
pub struct EventNotifier {
    tx: Option<mpsc::Sender<WorkflowEvent>>,
}

impl EventNotifier {
    /// ディスパッチャータスクを起動する
    ///
    /// Tokio ランタイム内で呼び出す必要があります。
    /// すべてのハンドルが破棄されるとディスパッチャーは残りを配信して終了します。
    pub fn spawn(sinks: Vec<Arc<dyn EventSink>>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WorkflowEvent>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    if let Err(err) = sink.publish(&event).await {
                        tracing::warn!(
                            instance_id = %event.instance_id,
                            kind = %event.kind,
                            error = %err,
                            "event sink failed"
                        );
                    }
                }
            }
            tracing::debug!("event dispatcher stopped");
        });

        Self { tx: Some(tx) }
    }

    /// 何も配信しない通知ハンドル
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    instance_id = %event.instance_id,
                    kind = %event.kind,
                    "event queue is full; dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(
                    instance_id = %event.instance_id,
                    kind = %event.kind,
                    "event dispatcher is gone; dropping event"
                );
            }
        }
    }
}

/// `tokio::sync::broadcast` で購読者に配るシンク
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: &WorkflowEvent) -> Result<(), EventError> {
        // 購読者がいない場合の送信失敗は正常
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// イベントを構造化ログとして出力するシンク
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, event: &WorkflowEvent) -> Result<(), EventError> {
        let metadata = serde_json::to_string(&event.metadata)?;
        tracing::info!(
            target: "melted_orchestrator::events",
            instance_id = %event.instance_id,
            step_id = event.step_id.as_deref().unwrap_or("-"),
            kind = %event.kind,
            %metadata,
            "workflow event"
        );
        Ok(())
    }
}
