//! ワークフローエンジン（インスタンスのライフサイクル管理）
//!
//! # 責務
//!
//! - 定義と初期入力からインスタンスを作成し、実行ドライバーを起動
//! - ステップ結果を遷移テーブルに照らして次の状態を決定
//! - 再試行（指数バックオフ）とキャンセルの制御
//! - 状態の永続化（楽観的ロックの衝突は内部で再読み込みして回復）
//! - ライフサイクルイベントの通知
//!
//! # 実行フロー
//!
//! 1. `create_instance`: 検証して `pending` で保存
//! 2. `launch`: リースを取得し `running` に遷移、`started` を通知してドライバーを起動
//! 3. ドライバー: ステップを順に実行し、結果ごとに遷移を決めて保存
//!    - `ok` → 次のステップ、または `end` で `succeeded`
//!    - `retryable_error` → 上限まで同じステップを再試行、使い切ったら `failed`
//!    - `fatal_error` → 即座に `failed`
//!    - エラー結果に明示的な遷移がある場合はそのステップへ進む
//! 4. `cancel`: `cancelled` で保存し、ドライバーのキャンセルトークンを発火
//!
//! # 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use melted_orchestrator::agent::StaticResolver;
//! use melted_orchestrator::config::WorkflowDefinition;
//! use melted_orchestrator::engine::WorkflowEngine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let definition = WorkflowDefinition::from_file("workflows/example.toml")?;
//!     let engine = WorkflowEngine::builder()
//!         .resolver(Arc::new(StaticResolver::new()))
//!         .build();
//!
//!     let definition = engine.register(definition);
//!     let id = engine.start(definition, Default::default()).await?;
//!     let finished = engine.wait(id).await?;
//!     println!("{}: {}", id, finished.status);
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::context::Payload;
use super::executor::StepExecutor;
use super::instance::{InstanceId, InstanceStatus, WorkflowInstance};
use super::result::{FailureDetail, FailureKind, StatusReport, StepOutcome, StepResult};
use super::retry::BackoffPolicy;
use crate::agent::{AgentClient, AgentResolver, StaticResolver};
use crate::config::registry::DefinitionRegistry;
use crate::config::settings::EngineSettings;
use crate::config::step::StepConfig;
use crate::config::transition::Target;
use crate::config::workflow::WorkflowDefinition;
use crate::error::{ConfigError, EngineError, StoreError};
use crate::events::{EventKind, EventNotifier, EventSink, WorkflowEvent};
use crate::store::{InMemoryStateStore, LockOutcome, StateStore};

/// 衝突時の再読み込みの上限
const MAX_COMMIT_ATTEMPTS: usize = 16;

/// `cancel` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
    NotFound,
}

/// ステップ結果から決まる次の状態
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Advance(String),
    Succeed,
    Retry { retry: u32, delay: Duration },
    Fail(FailureDetail),
}

/// 実行ドライバーの終了状態
#[derive(Debug, Clone, PartialEq, Eq)]
enum DriverExit {
    Running,
    Finished,
    /// `failed` の保存にも失敗して停止した
    Aborted(String),
}

/// 実行中（または起動待ち）のインスタンスの管理情報
struct RunHandle {
    definition: Arc<WorkflowDefinition>,
    cancel: CancellationToken,
    finished: Option<watch::Receiver<DriverExit>>,
}

impl RunHandle {
    /// ドライバーが起動済みで、まだ停止していない
    fn is_active(&self) -> bool {
        self.finished
            .as_ref()
            .is_some_and(|finished| *finished.borrow() == DriverExit::Running)
    }
}

struct EngineInner {
    registry: RwLock<DefinitionRegistry>,
    store: Arc<dyn StateStore>,
    client: AgentClient,
    executor: StepExecutor,
    notifier: EventNotifier,
    backoff: BackoffPolicy,
    runs: Mutex<HashMap<InstanceId, RunHandle>>,
}

/// ワークフローエンジン
///
/// `Clone` は同じエンジンへのハンドルを複製します。
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

/// [`WorkflowEngine`] のビルダー
pub struct EngineBuilder {
    resolver: Option<Arc<dyn AgentResolver>>,
    store: Option<Arc<dyn StateStore>>,
    sinks: Vec<Arc<dyn EventSink>>,
    settings: EngineSettings,
    backoff: Option<BackoffPolicy>,
    registry: DefinitionRegistry,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            resolver: None,
            store: None,
            sinks: Vec::new(),
            settings: EngineSettings::default(),
            backoff: None,
            registry: DefinitionRegistry::new(),
        }
    }

    pub fn resolver(mut self, resolver: Arc<dyn AgentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// 状態ストア（既定はプロセス内ストア）
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 設定ファイルの値より優先するバックオフ
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn registry(mut self, registry: DefinitionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// エンジンを構築する
    ///
    /// イベントシンクがある場合はディスパッチャータスクを起動するため、
    /// Tokio ランタイム内で呼び出す必要があります。
    pub fn build(self) -> WorkflowEngine {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(StaticResolver::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()));
        let notifier = if self.sinks.is_empty() {
            EventNotifier::disabled()
        } else {
            EventNotifier::spawn(self.sinks, self.settings.event_buffer)
        };
        let client = AgentClient::new(resolver);
        let executor = StepExecutor::new(client.clone(), self.settings.default_timeout());

        WorkflowEngine {
            inner: Arc::new(EngineInner {
                registry: RwLock::new(self.registry),
                store,
                client,
                executor,
                notifier,
                backoff: self.backoff.unwrap_or_else(|| self.settings.backoff()),
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl WorkflowEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// 定義をレジストリに登録
    pub fn register(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(definition)
    }

    /// 定義を登録済みの名前（と任意のバージョン）で開始
    pub async fn start_by_name(
        &self,
        name: &str,
        version: Option<&str>,
        input: Payload,
    ) -> Result<InstanceId, EngineError> {
        let definition = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name, version)
            .ok_or_else(|| match version {
                Some(version) => EngineError::UnknownDefinition(format!("{name}@{version}")),
                None => EngineError::UnknownDefinition(name.to_string()),
            })?;
        self.start(definition, input).await
    }

    /// インスタンスを作成して実行を開始
    ///
    /// # エラー
    ///
    /// - [`EngineError::Configuration`] - 解決できないエージェントがある
    /// - [`EngineError::InvalidInitialPayload`] - 宣言された入力を満たさない
    pub async fn start(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: Payload,
    ) -> Result<InstanceId, EngineError> {
        let id = self.create_instance(definition, input).await?;
        self.launch(id).await?;
        Ok(id)
    }

    /// 検証して `pending` のインスタンスを作成する（ステップはまだ実行しない）
    pub async fn create_instance(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: Payload,
    ) -> Result<InstanceId, EngineError> {
        self.validate_agents(&definition)?;
        validate_input(&definition, &input)?;

        let instance = WorkflowInstance::new(definition.reference(), input);
        let id = instance.id;
        self.inner.store.create(&instance).await?;
        self.runs().insert(
            id,
            RunHandle {
                definition: Arc::clone(&definition),
                cancel: CancellationToken::new(),
                finished: None,
            },
        );

        tracing::info!(
            instance_id = %id,
            workflow = %definition.reference(),
            "workflow instance created"
        );
        Ok(id)
    }

    /// `pending` のインスタンスの実行ドライバーを起動する
    ///
    /// 起動済みのインスタンスに対しては何もしません。このエンジンで作成していない
    /// インスタンスは、登録済みの定義から再開します。
    pub async fn launch(&self, id: InstanceId) -> Result<(), EngineError> {
        let stopped = match self.runs().get(&id) {
            Some(handle) if handle.is_active() => return Ok(()),
            Some(handle) => handle.finished.is_some(),
            None => false,
        };
        // 停止したドライバーの管理情報は作り直す
        if stopped {
            self.runs().remove(&id);
        }
        let (definition, cancel) = self.run_handle(id).await?;

        let lease = match self.inner.store.try_lock(id).await? {
            LockOutcome::Acquired(lease) => lease,
            LockOutcome::Busy => return Err(EngineError::Busy(id)),
        };

        let instance = self.inner.store.load(id).await?;
        if instance.is_terminal() {
            self.runs().remove(&id);
            return Err(EngineError::AlreadyTerminal(id));
        }

        let start = definition.start().to_string();
        let instance = if instance.status == InstanceStatus::Pending {
            let Some(instance) = self
                .commit(instance, |i| {
                    i.set_status(InstanceStatus::Running);
                    i.advance_to(start.as_str());
                })
                .await?
            else {
                self.runs().remove(&id);
                return Err(EngineError::AlreadyTerminal(id));
            };
            self.publish(
                WorkflowEvent::new(id, EventKind::Started).with_metadata(json!({
                    "workflow": definition.name(),
                    "version": definition.version(),
                })),
            );
            instance
        } else {
            instance
        };

        let (done_tx, done_rx) = watch::channel(DriverExit::Running);
        {
            let mut runs = self.runs();
            // 起動中にキャンセルされると管理情報は破棄済み
            let Some(handle) = runs.get_mut(&id) else {
                return Err(EngineError::AlreadyTerminal(id));
            };
            if handle.finished.is_some() {
                return Ok(());
            }
            handle.finished = Some(done_rx);
        }

        let engine = self.clone();
        let span = tracing::info_span!(
            "workflow",
            instance_id = %id,
            workflow = %definition.reference()
        );
        tokio::spawn(
            async move {
                let exit = match engine.drive(instance, definition, cancel).await {
                    Ok(()) => DriverExit::Finished,
                    Err(err) => engine.abort(id, err).await,
                };
                drop(lease);
                // 停止理由を `wait` で返せるよう、異常停止時は管理情報を残す
                if exit == DriverExit::Finished {
                    engine.runs().remove(&id);
                }
                let _ = done_tx.send(exit);
            }
            .instrument(span),
        );
        Ok(())
    }

    /// インスタンスのスナップショット
    pub async fn get_status(&self, id: InstanceId) -> Result<WorkflowInstance, EngineError> {
        Ok(self.inner.store.load(id).await?)
    }

    /// 状態・現在ステップ・終了サマリー
    pub async fn status_report(&self, id: InstanceId) -> Result<StatusReport, EngineError> {
        let instance = self.get_status(id).await?;
        Ok(StatusReport::from(&instance))
    }

    /// インスタンスをキャンセルする
    ///
    /// `pending` / `running` / `waiting_on_agent` で有効です。
    /// 実行中のエージェント呼び出しの結果は破棄されます。
    pub async fn cancel(&self, id: InstanceId) -> Result<CancelOutcome, EngineError> {
        let mut attempts = 0;
        let previous = loop {
            let mut instance = match self.inner.store.load(id).await {
                Ok(instance) => instance,
                Err(StoreError::NotFound(_)) => return Ok(CancelOutcome::NotFound),
                Err(err) => return Err(err.into()),
            };
            if instance.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal);
            }

            let previous = instance.status;
            let step = instance.current_step.clone();
            instance.cancel();
            match self.inner.store.save(&mut instance).await {
                Ok(()) => break (previous, step),
                Err(StoreError::Conflict { .. }) if attempts < MAX_COMMIT_ATTEMPTS => {
                    attempts += 1;
                    tracing::debug!(instance_id = %id, "cancel conflicted; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        };

        let handle = self.runs().get(&id).map(|h| (h.cancel.clone(), h.finished.is_some()));
        match handle {
            Some((cancel, true)) => cancel.cancel(),
            // 起動されていないインスタンスは管理情報ごと破棄
            Some((_, false)) => {
                self.runs().remove(&id);
            }
            None => {}
        }

        let (previous_status, step) = previous;
        tracing::info!(instance_id = %id, previous_status = %previous_status, "workflow instance cancelled");
        let mut event = WorkflowEvent::new(id, EventKind::Cancelled)
            .with_metadata(json!({ "previous_status": previous_status.to_string() }));
        if let Some(step) = step {
            event = event.with_step(step);
        }
        self.publish(event);
        Ok(CancelOutcome::Cancelled)
    }

    /// ドライバーの終了を待ち、最終スナップショットを返す
    ///
    /// 起動されていないインスタンスは現在のスナップショットをそのまま返します。
    ///
    /// # エラー
    ///
    /// - [`EngineError::Aborted`] - 状態を保存できずにドライバーが停止した
    pub async fn wait(&self, id: InstanceId) -> Result<WorkflowInstance, EngineError> {
        let finished = self.runs().get(&id).and_then(|h| h.finished.clone());
        if let Some(mut finished) = finished {
            // 送信側の破棄（ドライバーのパニック）も終了とみなす
            let exit = finished
                .wait_for(|exit| *exit != DriverExit::Running)
                .await
                .map(|exit| (*exit).clone());
            if let Ok(DriverExit::Aborted(message)) = exit {
                return Err(EngineError::Aborted { id, message });
            }
        }
        self.get_status(id).await
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<InstanceId, RunHandle>> {
        self.inner.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: WorkflowEvent) {
        self.inner.notifier.publish(event);
    }

    /// 管理情報を取得（無ければレジストリの定義から作る）
    async fn run_handle(
        &self,
        id: InstanceId,
    ) -> Result<(Arc<WorkflowDefinition>, CancellationToken), EngineError> {
        if let Some(handle) = self.runs().get(&id) {
            return Ok((Arc::clone(&handle.definition), handle.cancel.clone()));
        }

        let instance = self.inner.store.load(id).await?;
        if instance.is_terminal() {
            return Err(EngineError::AlreadyTerminal(id));
        }
        let reference = &instance.definition;
        let definition = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reference.name, Some(&reference.version))
            .ok_or_else(|| EngineError::UnknownDefinition(reference.to_string()))?;
        self.validate_agents(&definition)?;

        let cancel = CancellationToken::new();
        let mut runs = self.runs();
        let handle = runs.entry(id).or_insert_with(|| RunHandle {
            definition,
            cancel,
            finished: None,
        });
        Ok((Arc::clone(&handle.definition), handle.cancel.clone()))
    }

    fn validate_agents(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        let unresolved = definition
            .agent_ids()
            .into_iter()
            .filter(|agent_id| !self.inner.client.resolves(agent_id))
            .collect::<Vec<_>>();
        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Configuration(ConfigError::Validation(format!(
                "ワークフロー '{}' のエージェントを解決できません: {}",
                definition.reference(),
                unresolved.join(", ")
            ))))
        }
    }

    /// 実行ドライバー本体
    async fn drive(
        &self,
        mut instance: WorkflowInstance,
        definition: Arc<WorkflowDefinition>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let id = instance.id;
        loop {
            if instance.is_terminal() || cancel.is_cancelled() {
                return Ok(());
            }

            let Some(step_id) = instance.current_step.clone() else {
                self.finish_failed(
                    instance,
                    FailureDetail::new(
                        FailureKind::ConfigurationError,
                        None,
                        "実行中のインスタンスに現在ステップがありません",
                    ),
                )
                .await?;
                return Ok(());
            };
            let Some(step) = definition.step(&step_id) else {
                self.finish_failed(
                    instance,
                    FailureDetail::new(
                        FailureKind::ConfigurationError,
                        Some(step_id.clone()),
                        format!("ステップ '{step_id}' は定義に存在しません"),
                    ),
                )
                .await?;
                return Ok(());
            };

            let Some(started) = self
                .commit(instance, |i| {
                    i.record_attempt(&step_id);
                    i.set_status(InstanceStatus::WaitingOnAgent);
                })
                .await?
            else {
                return Ok(());
            };
            instance = started;
            let attempt = instance.attempts_for(&step_id);

            tracing::info!(step_id = %step_id, attempt, "step started");
            self.publish(
                WorkflowEvent::new(id, EventKind::StepStarted)
                    .with_step(step_id.as_str())
                    .with_metadata(json!({ "attempt": attempt })),
            );

            let Some(result) = self.inner.executor.run_step(&instance, step, &cancel).await else {
                return Ok(());
            };
            if cancel.is_cancelled() {
                tracing::debug!(step_id = %step_id, "discarding result of cancelled instance");
                return Ok(());
            }

            let decision = decide(&definition, step, &result, attempt, &self.inner.backoff);
            match self.apply(instance, step, result, decision, &cancel).await? {
                Some(next) => instance = next,
                None => return Ok(()),
            }
        }
    }

    /// 決定を永続化してイベントを通知する
    ///
    /// ドライバーを止める場合は `None` を返します。
    async fn apply(
        &self,
        instance: WorkflowInstance,
        step: &StepConfig,
        result: StepResult,
        decision: Decision,
        cancel: &CancellationToken,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let id = instance.id;
        let step_id = step.id();
        let output = result.output;

        match decision {
            Decision::Retry { retry, delay } => {
                let Some(instance) = self
                    .commit(instance, |i| i.set_status(InstanceStatus::Running))
                    .await?
                else {
                    return Ok(None);
                };
                let message = result.error.map(|e| e.message).unwrap_or_default();
                tracing::warn!(
                    step_id,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "step failed with retryable error; retrying"
                );
                self.publish(
                    WorkflowEvent::new(id, EventKind::Retrying)
                        .with_step(step_id)
                        .with_metadata(json!({
                            "retry": retry,
                            "max_retries": step.max_retries(),
                            "delay_ms": delay.as_millis() as u64,
                            "error": message,
                        })),
                );

                Ok(tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    _ = tokio::time::sleep(delay) => Some(instance),
                })
            }
            Decision::Advance(next) => {
                let recorded = result.outcome == StepOutcome::Ok;
                let Some(instance) = self
                    .commit(instance, |i| {
                        if recorded {
                            if let Err(err) = i.context.insert(step_id, output.clone()) {
                                i.fail(FailureDetail::new(
                                    FailureKind::ConfigurationError,
                                    Some(step_id.to_string()),
                                    err.to_string(),
                                ));
                                return;
                            }
                        }
                        i.advance_to(next.as_str());
                        i.set_status(InstanceStatus::Running);
                    })
                    .await?
                else {
                    return Ok(None);
                };
                tracing::info!(step_id, outcome = %result.outcome, next = %next, "step completed");
                self.publish_completed(id, step_id, result.outcome, &next);
                self.publish_terminal(&instance);
                Ok(Some(instance))
            }
            Decision::Succeed => {
                let Some(instance) = self
                    .commit(instance, |i| {
                        if let Err(err) = i.context.insert(step_id, output.clone()) {
                            i.fail(FailureDetail::new(
                                FailureKind::ConfigurationError,
                                Some(step_id.to_string()),
                                err.to_string(),
                            ));
                            return;
                        }
                        i.succeed();
                    })
                    .await?
                else {
                    return Ok(None);
                };
                tracing::info!(step_id, outcome = %result.outcome, "step completed");
                self.publish_completed(id, step_id, result.outcome, &Target::End.to_string());
                self.publish_terminal(&instance);
                Ok(Some(instance))
            }
            Decision::Fail(failure) => {
                tracing::warn!(
                    step_id,
                    outcome = %result.outcome,
                    kind = ?failure.kind,
                    error = %failure.message,
                    "step failed"
                );
                let Some(instance) = self.commit(instance, |i| i.fail(failure.clone())).await? else {
                    return Ok(None);
                };
                self.publish_completed(id, step_id, result.outcome, "-");
                self.publish_terminal(&instance);
                Ok(Some(instance))
            }
        }
    }

    async fn finish_failed(
        &self,
        instance: WorkflowInstance,
        failure: FailureDetail,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let Some(instance) = self.commit(instance, |i| i.fail(failure.clone())).await? else {
            return Ok(None);
        };
        self.publish_terminal(&instance);
        Ok(Some(instance))
    }

    /// 保存に失敗して止まったドライバーの後始末
    ///
    /// 最新の状態を読み直し、`failed` の保存を1回だけ試みます。
    async fn abort(&self, id: InstanceId, err: StoreError) -> DriverExit {
        tracing::error!(error = %err, "failed to persist instance; failing workflow");
        let mut instance = match self.inner.store.load(id).await {
            Ok(instance) if instance.is_terminal() => return DriverExit::Finished,
            Ok(instance) => instance,
            Err(reload) => {
                tracing::error!(error = %reload, "failed to reload instance");
                return DriverExit::Aborted(format!("{err}（再読み込みにも失敗: {reload}）"));
            }
        };

        let step_id = instance.current_step.clone();
        instance.fail(FailureDetail::new(
            FailureKind::PersistenceError,
            step_id,
            format!("状態の保存に失敗しました: {err}"),
        ));
        match self.inner.store.save(&mut instance).await {
            Ok(()) => {
                self.publish_terminal(&instance);
                DriverExit::Finished
            }
            Err(save) => {
                tracing::error!(error = %save, "failed to persist failed status");
                DriverExit::Aborted(format!("{err}（失敗状態の保存にも失敗: {save}）"))
            }
        }
    }

    fn publish_completed(&self, id: InstanceId, step_id: &str, outcome: StepOutcome, next: &str) {
        self.publish(
            WorkflowEvent::new(id, EventKind::StepCompleted)
                .with_step(step_id)
                .with_metadata(json!({ "outcome": outcome, "next": next })),
        );
    }

    /// 終了状態になっていれば `succeeded` / `failed` を通知
    fn publish_terminal(&self, instance: &WorkflowInstance) {
        match instance.status {
            InstanceStatus::Succeeded => {
                tracing::info!(steps = instance.context.len(), "workflow succeeded");
                self.publish(WorkflowEvent::new(instance.id, EventKind::Succeeded));
            }
            InstanceStatus::Failed => {
                let metadata = instance
                    .failure
                    .as_ref()
                    .map(|f| json!({ "kind": f.kind, "message": f.message }))
                    .unwrap_or(Value::Null);
                let mut event = WorkflowEvent::new(instance.id, EventKind::Failed).with_metadata(metadata);
                if let Some(step_id) = instance.failure.as_ref().and_then(|f| f.step_id.clone()) {
                    event = event.with_step(step_id);
                }
                tracing::warn!("workflow failed");
                self.publish(event);
            }
            _ => {}
        }
    }

    /// 変更を適用して保存する
    ///
    /// 衝突した場合は再読み込みして同じ変更を適用し直します。再読み込みした
    /// インスタンスが終了状態（キャンセル等）の場合は変更を破棄して `Ok(None)` を返します。
    /// 衝突以外の失敗と、衝突が上限まで続いた場合はエラーを返します。
    async fn commit<F>(
        &self,
        instance: WorkflowInstance,
        mut mutate: F,
    ) -> Result<Option<WorkflowInstance>, StoreError>
    where
        F: FnMut(&mut WorkflowInstance),
    {
        let id = instance.id;
        let mut base = instance;
        let mut attempts = 0;
        loop {
            let mut next = base.clone();
            mutate(&mut next);
            match self.inner.store.save(&mut next).await {
                Ok(()) => return Ok(Some(next)),
                Err(err @ StoreError::Conflict { .. }) => {
                    attempts += 1;
                    if attempts >= MAX_COMMIT_ATTEMPTS {
                        tracing::error!("gave up persisting instance after repeated conflicts");
                        return Err(err);
                    }
                    tracing::debug!(error = %err, "state conflict; reloading");
                    let reloaded = self.inner.store.load(id).await?;
                    if reloaded.is_terminal() {
                        tracing::info!(
                            status = %reloaded.status,
                            "instance already terminal; discarding pending update"
                        );
                        return Ok(None);
                    }
                    base = reloaded;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("backoff", &self.inner.backoff)
            .finish_non_exhaustive()
    }
}

/// 宣言された入力フィールドの存在と型を検証
fn validate_input(definition: &WorkflowDefinition, input: &Payload) -> Result<(), EngineError> {
    for spec in definition.inputs() {
        match input.get(&spec.name) {
            None => {
                return Err(EngineError::InvalidInitialPayload(format!(
                    "入力 '{}' がありません",
                    spec.name
                )));
            }
            Some(value) if !spec.field_type.matches(value) => {
                return Err(EngineError::InvalidInitialPayload(format!(
                    "入力 '{}' の型が {:?} ではありません",
                    spec.name, spec.field_type
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// ステップ結果と遷移テーブルから次の状態を決める
fn decide(
    definition: &WorkflowDefinition,
    step: &StepConfig,
    result: &StepResult,
    attempt: u32,
    backoff: &BackoffPolicy,
) -> Decision {
    let transitions = definition.transitions();
    let failure = || {
        result.failure_detail().unwrap_or_else(|| {
            FailureDetail::new(
                FailureKind::AgentPermanentError,
                Some(step.id().to_string()),
                "ステップが失敗しました",
            )
        })
    };

    match result.outcome {
        StepOutcome::Ok => match transitions.next(step.id(), StepOutcome::Ok) {
            Some(Target::Step(next)) => Decision::Advance(next.clone()),
            Some(Target::End) => Decision::Succeed,
            None => Decision::Fail(FailureDetail::new(
                FailureKind::ConfigurationError,
                Some(step.id().to_string()),
                format!("ステップ '{}' に ok の遷移が定義されていません", step.id()),
            )),
        },
        StepOutcome::RetryableError if attempt <= step.max_retries() => Decision::Retry {
            retry: attempt,
            delay: backoff.delay(attempt),
        },
        outcome => match transitions.next(step.id(), outcome) {
            Some(Target::Step(recovery)) => Decision::Advance(recovery.clone()),
            // エラー結果の `end` は失敗として終了
            Some(Target::End) | None => Decision::Fail(failure()),
        },
    }
}
