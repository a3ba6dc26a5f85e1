//! ステップ実行（Step Executor）
//!
//! # 責務
//!
//! 1つのステップを1回試行し、その結果を [`StepResult`] として返します。
//! 次にどこへ進むか・再試行するかはエンジン側が遷移テーブルで決めます。
//!
//! # 実行フロー
//!
//! 1. 入力マッピングをコンテキスト（または開始時入力）から解決
//! 2. ステップのモードに従ってエージェントを呼び出す
//!    - `single`: 1エージェント
//!    - `all`: 全エージェントを並行に呼び出し、全員の完了を待つ
//!    - `first_success`: 並行に呼び出し、最初に成功した結果を採用して残りを破棄
//!      （先に fatal が返った場合はその時点でステップ全体を `fatal_error` とする）
//! 3. 出力スキーマを検証
//! 4. 結果を `ok` / `retryable_error` / `fatal_error` に分類
//!
//! # 分類
//!
//! | 状況                                   | 結果               | 失敗の分類                 |
//! |----------------------------------------|--------------------|----------------------------|
//! | 必須入力の欠落                         | `fatal_error`      | `input_error`              |
//! | エージェントを解決できない             | `fatal_error`      | `configuration_error`      |
//! | タイムアウト / `transient`             | `retryable_error`  | `agent_transient_error`    |
//! | `permanent` / コードなし / スキーマ不一致 | `fatal_error`   | `agent_permanent_error`    |

use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::Payload;
use super::instance::WorkflowInstance;
use super::result::{FailureKind, StepResult};
use crate::agent::{AgentClient, AgentRequest, AgentResponse};
use crate::config::step::{FanOutMode, INPUT_SOURCE, StepConfig};
use crate::error::AgentError;

/// エージェント1件分の呼び出し結果
#[derive(Debug)]
enum AgentOutcome {
    Ok(Payload),
    Retryable(String),
    Fatal(FailureKind, String),
}

/// ステップ実行エンジン
#[derive(Debug, Clone)]
pub struct StepExecutor {
    client: AgentClient,
    default_timeout: Duration,
}

impl StepExecutor {
    /// # 引数
    ///
    /// - `client`: エージェント呼び出しクライアント
    /// - `default_timeout`: ステップに `timeout_secs` が無い場合のタイムアウト
    pub fn new(client: AgentClient, default_timeout: Duration) -> Self {
        Self {
            client,
            default_timeout,
        }
    }

    /// ステップを1回試行する
    ///
    /// 試行回数は呼び出し前にインスタンスへ記録されている前提です
    /// （[`WorkflowInstance::attempts_for`]）。
    ///
    /// # 戻り値
    ///
    /// - `Some(StepResult)`: 試行の結果
    /// - `None`: `cancel` によって中断された（進行中の呼び出しは破棄済み）
    pub async fn run_step(
        &self,
        instance: &WorkflowInstance,
        step: &StepConfig,
        cancel: &CancellationToken,
    ) -> Option<StepResult> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(
                    instance_id = %instance.id,
                    step_id = step.id(),
                    "step cancelled; discarding in-flight agent calls"
                );
                None
            }
            result = self.execute(instance, step) => Some(result),
        }
    }

    async fn execute(&self, instance: &WorkflowInstance, step: &StepConfig) -> StepResult {
        let input = match resolve_inputs(instance, step) {
            Ok(input) => input,
            Err(message) => return StepResult::fatal(step.id(), FailureKind::InputError, message),
        };

        let attempt = instance.attempts_for(step.id()).max(1);
        let correlation_id = format!("{}:{}", instance.id, step.id());
        let timeout = step.timeout().unwrap_or(self.default_timeout);

        tracing::debug!(
            instance_id = %instance.id,
            step_id = step.id(),
            attempt,
            mode = ?step.mode(),
            agents = step.agents().len(),
            "executing step"
        );

        let request = |agent_id: &str| AgentRequest {
            agent_id: agent_id.to_string(),
            correlation_id: correlation_id.clone(),
            attempt,
            input: input.clone(),
        };

        match step.mode() {
            FanOutMode::Single => {
                let agent_id = &step.agents()[0];
                let outcome = self.call(step, agent_id, request(agent_id), timeout).await;
                into_step_result(step.id(), outcome)
            }
            FanOutMode::All => {
                let calls = step.agents().iter().map(|agent_id| async move {
                    let outcome = self.call(step, agent_id, request(agent_id), timeout).await;
                    (agent_id.as_str(), outcome)
                });
                aggregate_all(step.id(), join_all(calls).await)
            }
            FanOutMode::FirstSuccess => {
                let mut calls = step
                    .agents()
                    .iter()
                    .map(|agent_id| self.call(step, agent_id, request(agent_id), timeout))
                    .collect::<FuturesUnordered<_>>();

                let mut failures = Vec::new();
                while let Some(outcome) = calls.next().await {
                    match outcome {
                        AgentOutcome::Ok(output) => return StepResult::ok(step.id(), output),
                        // fatal はステップ全体の fatal。残りの呼び出しは破棄
                        AgentOutcome::Fatal(kind, message) => {
                            return StepResult::fatal(step.id(), kind, message);
                        }
                        retryable => failures.push(retryable),
                    }
                }
                aggregate_failures(step.id(), failures)
            }
        }
    }

    /// エージェントを1件呼び出して分類する
    async fn call(
        &self,
        step: &StepConfig,
        agent_id: &str,
        request: AgentRequest,
        timeout: Duration,
    ) -> AgentOutcome {
        match self.client.invoke(agent_id, request, timeout).await {
            Ok(response) => classify_response(step, agent_id, response),
            Err(AgentError::UnknownAgent(id)) => AgentOutcome::Fatal(
                FailureKind::ConfigurationError,
                format!("エージェント '{id}' を解決できません"),
            ),
            Err(err) if err.is_transient() => AgentOutcome::Retryable(err.to_string()),
            Err(err) => AgentOutcome::Fatal(FailureKind::AgentPermanentError, err.to_string()),
        }
    }
}

/// 入力マッピングを解決してエージェント入力を組み立てる
fn resolve_inputs(instance: &WorkflowInstance, step: &StepConfig) -> Result<Payload, String> {
    let mut input = Payload::new();
    for binding in step.inputs() {
        let value = if binding.source_step == INPUT_SOURCE {
            instance.input.get(&binding.field)
        } else {
            instance.context.field(&binding.source_step, &binding.field)
        };

        match value {
            Some(value) => {
                input.insert(binding.name.clone(), value.clone());
            }
            None if binding.required => {
                return Err(format!(
                    "必須入力 '{}' のソース '{}' がコンテキストにありません",
                    binding.name,
                    binding.source()
                ));
            }
            None => {}
        }
    }
    Ok(input)
}

fn classify_response(step: &StepConfig, agent_id: &str, response: AgentResponse) -> AgentOutcome {
    if response.success {
        return match check_schema(step, &response.output) {
            Ok(()) => AgentOutcome::Ok(response.output),
            Err(message) => AgentOutcome::Fatal(
                FailureKind::AgentPermanentError,
                format!("エージェント '{agent_id}' の出力が不正です: {message}"),
            ),
        };
    }

    let message = format!(
        "エージェント '{agent_id}' が失敗しました: {}",
        response.error.as_deref().unwrap_or("詳細なし")
    );
    match response.error_code {
        Some(code) if code.is_retryable() => AgentOutcome::Retryable(message),
        _ => AgentOutcome::Fatal(FailureKind::AgentPermanentError, message),
    }
}

/// 宣言された出力フィールドの存在と型を検証
fn check_schema(step: &StepConfig, output: &Payload) -> Result<(), String> {
    for spec in step.outputs() {
        match output.get(&spec.name) {
            None => return Err(format!("必須フィールド '{}' がありません", spec.name)),
            Some(value) if !spec.field_type.matches(value) => {
                return Err(format!(
                    "フィールド '{}' の型が {:?} ではありません",
                    spec.name, spec.field_type
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn into_step_result(step_id: &str, outcome: AgentOutcome) -> StepResult {
    match outcome {
        AgentOutcome::Ok(output) => StepResult::ok(step_id, output),
        AgentOutcome::Retryable(message) => {
            StepResult::retryable(step_id, FailureKind::AgentTransientError, message)
        }
        AgentOutcome::Fatal(kind, message) => StepResult::fatal(step_id, kind, message),
    }
}

/// `all` モードの集約: 全員成功なら `{エージェントID: 出力}`
fn aggregate_all(step_id: &str, outcomes: Vec<(&str, AgentOutcome)>) -> StepResult {
    let mut merged = Payload::new();
    let mut failures = Vec::new();
    for (agent_id, outcome) in outcomes {
        match outcome {
            AgentOutcome::Ok(output) => {
                merged.insert(agent_id.to_string(), Value::Object(output));
            }
            failure => failures.push(failure),
        }
    }

    if failures.is_empty() {
        StepResult::ok(step_id, merged)
    } else {
        aggregate_failures(step_id, failures)
    }
}

/// 失敗の集約: 1件でも fatal があれば fatal、それ以外は retryable
fn aggregate_failures(step_id: &str, failures: Vec<AgentOutcome>) -> StepResult {
    let mut fatal_kind = None;
    let mut messages = Vec::with_capacity(failures.len());
    for failure in failures {
        match failure {
            AgentOutcome::Fatal(kind, message) => {
                // 設定不備を優先して報告
                if fatal_kind.is_none() || kind == FailureKind::ConfigurationError {
                    fatal_kind = Some(kind);
                }
                messages.push(message);
            }
            AgentOutcome::Retryable(message) => messages.push(message),
            AgentOutcome::Ok(_) => {}
        }
    }

    let message = messages.join("; ");
    match fatal_kind {
        Some(kind) => StepResult::fatal(step_id, kind, message),
        None => StepResult::retryable(step_id, FailureKind::AgentTransientError, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use crate::agent::{AgentErrorCode, FnAgent, StaticResolver};
    use crate::config::workflow::WorkflowDefinition;
    use crate::engine::result::StepOutcome;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    fn ok_agent(output: Value) -> Arc<dyn crate::agent::AgentTarget> {
        FnAgent::shared(move |_req: AgentRequest| {
            let output = payload(output.clone());
            async move { Ok(AgentResponse::success(output)) }
        })
    }

    fn failing_agent(code: Option<AgentErrorCode>) -> Arc<dyn crate::agent::AgentTarget> {
        FnAgent::shared(move |_req: AgentRequest| async move {
            Ok(AgentResponse::failure(code, "boom"))
        })
    }

    fn executor(resolver: StaticResolver) -> StepExecutor {
        StepExecutor::new(AgentClient::new(Arc::new(resolver)), Duration::from_secs(5))
    }

    fn definition(step_toml: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_toml(&format!(
            r#"
            [workflow]
            name = "test"

            [[steps]]
            id = "a"
            agents = ["producer"]
            next = {{ ok = "b" }}

            {step_toml}
            "#
        ))
        .unwrap()
    }

    /// A の出力を記録済みのインスタンス
    fn instance_after_a(definition: &WorkflowDefinition, a_output: Value) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new(definition.reference(), payload(json!({"task": "t"})));
        instance.context.insert("a", payload(a_output)).unwrap();
        instance.advance_to("b");
        instance.record_attempt("b");
        instance
    }

    #[tokio::test]
    async fn test_single_ok_maps_inputs() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_in_agent = seen.clone();
        let resolver = StaticResolver::new().with(
            "consumer",
            FnAgent::shared(move |req: AgentRequest| {
                *seen_in_agent.lock().unwrap() = Some(req.clone());
                async { Ok(AgentResponse::success(payload(json!({"y": 2})))) }
            }),
        );
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["consumer"]
            inputs = [{ name = "x", source = "a.x" }, { name = "task", source = "input.task" }]
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({"x": 1}));

        let result = executor(resolver)
            .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::Ok);
        assert_eq!(result.output["y"], json!(2));

        let request = seen.lock().unwrap().clone().unwrap();
        assert_eq!(request.input, payload(json!({"x": 1, "task": "t"})));
        assert_eq!(request.correlation_id, format!("{}:b", instance.id));
        assert_eq!(request.attempt, 1);
    }

    /// 必須入力の欠落は呼び出し前に fatal（input_error）
    #[tokio::test]
    async fn test_missing_required_input_is_fatal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let resolver = StaticResolver::new().with(
            "consumer",
            FnAgent::shared(move |_req: AgentRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(AgentResponse::success(Payload::new())) }
            }),
        );
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["consumer"]
            inputs = [{ name = "x", source = "a.missing" }]
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({"x": 1}));

        let result = executor(resolver)
            .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::FatalError);
        assert_eq!(result.error.unwrap().kind, FailureKind::InputError);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_optional_missing_input_is_omitted() {
        let resolver = StaticResolver::new().with(
            "consumer",
            FnAgent::shared(|req: AgentRequest| async move {
                Ok(AgentResponse::success(req.input))
            }),
        );
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["consumer"]
            inputs = [{ name = "hint", source = "a.hint", required = false }]
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({"x": 1}));

        let result = executor(resolver)
            .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_ok());
        assert!(result.output.is_empty());
    }

    #[tokio::test]
    async fn test_error_code_classification() {
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["consumer"]
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));
        let step = def.step("b").unwrap();

        let cases = [
            (Some(AgentErrorCode::Transient), StepOutcome::RetryableError, FailureKind::AgentTransientError),
            (Some(AgentErrorCode::Timeout), StepOutcome::RetryableError, FailureKind::AgentTransientError),
            (Some(AgentErrorCode::Permanent), StepOutcome::FatalError, FailureKind::AgentPermanentError),
            (None, StepOutcome::FatalError, FailureKind::AgentPermanentError),
        ];
        for (code, outcome, kind) in cases {
            let resolver = StaticResolver::new().with("consumer", failing_agent(code));
            let result = executor(resolver)
                .run_step(&instance, step, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(result.outcome, outcome, "code {code:?}");
            assert_eq!(result.error.unwrap().kind, kind, "code {code:?}");
        }
    }

    #[tokio::test]
    async fn test_unknown_agent_is_configuration_error() {
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["ghost"]
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));

        let result = executor(StaticResolver::new())
            .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::FatalError);
        assert_eq!(result.error.unwrap().kind, FailureKind::ConfigurationError);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let resolver = StaticResolver::new().with(
            "consumer",
            FnAgent::shared(|_req: AgentRequest| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(AgentResponse::success(Payload::new()))
            }),
        );
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["consumer"]
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));
        let executor = StepExecutor::new(AgentClient::new(Arc::new(resolver)), Duration::from_millis(20));

        let result = executor
            .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::RetryableError);
    }

    /// 出力スキーマの不一致は fatal（agent_permanent_error）
    #[tokio::test]
    async fn test_output_schema_mismatch_is_fatal() {
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["consumer"]
            outputs = [{ name = "score", type = "number" }]
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));

        for output in [json!({"score": "high"}), json!({"other": 1})] {
            let resolver = StaticResolver::new().with("consumer", ok_agent(output));
            let result = executor(resolver)
                .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(result.outcome, StepOutcome::FatalError);
            assert_eq!(result.error.unwrap().kind, FailureKind::AgentPermanentError);
        }
    }

    #[tokio::test]
    async fn test_all_mode_merges_outputs() {
        let resolver = StaticResolver::new()
            .with("left", ok_agent(json!({"v": 1})))
            .with("right", ok_agent(json!({"v": 2})));
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["left", "right"]
            mode = "all"
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));

        let result = executor(resolver)
            .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(Value::Object(result.output), json!({"left": {"v": 1}, "right": {"v": 2}}));
    }

    /// `all` モード: fatal が1件でもあれば fatal、そうでなければ retryable
    #[tokio::test]
    async fn test_all_mode_failure_aggregation() {
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["left", "right", "third"]
            mode = "all"
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));
        let step = def.step("b").unwrap();

        let resolver = StaticResolver::new()
            .with("left", ok_agent(json!({})))
            .with("right", failing_agent(Some(AgentErrorCode::Transient)))
            .with("third", failing_agent(Some(AgentErrorCode::Permanent)));
        let result = executor(resolver)
            .run_step(&instance, step, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.outcome, StepOutcome::FatalError);
        assert!(result.output.is_empty());

        let resolver = StaticResolver::new()
            .with("left", ok_agent(json!({})))
            .with("right", failing_agent(Some(AgentErrorCode::Transient)))
            .with("third", failing_agent(Some(AgentErrorCode::Timeout)));
        let result = executor(resolver)
            .run_step(&instance, step, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.outcome, StepOutcome::RetryableError);
    }

    #[tokio::test]
    async fn test_first_success_takes_fastest_ok() {
        let resolver = StaticResolver::new()
            .with(
                "slow",
                FnAgent::shared(|_req: AgentRequest| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok(AgentResponse::success(payload(json!({"by": "slow"}))))
                }),
            )
            .with("flaky", failing_agent(Some(AgentErrorCode::Transient)))
            .with("fast", ok_agent(json!({"by": "fast"})));
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["slow", "flaky", "fast"]
            mode = "first_success"
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));

        let started = std::time::Instant::now();
        let result = executor(resolver)
            .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(result.output["by"], json!("fast"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_first_success_fatal_sibling_fails_step() {
        let resolver = StaticResolver::new()
            .with("broken", failing_agent(Some(AgentErrorCode::Permanent)))
            .with(
                "slow_ok",
                FnAgent::shared(|_req: AgentRequest| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(AgentResponse::success(payload(json!({"by": "slow_ok"}))))
                }),
            );
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["broken", "slow_ok"]
            mode = "first_success"
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));

        let result = executor(resolver)
            .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::FatalError);
        let error = result.error.unwrap();
        assert_eq!(error.kind, FailureKind::AgentPermanentError);
        assert!(error.message.contains("broken"));
    }

    #[tokio::test]
    async fn test_first_success_all_failed() {
        let resolver = StaticResolver::new()
            .with("one", failing_agent(Some(AgentErrorCode::Transient)))
            .with("two", failing_agent(Some(AgentErrorCode::Timeout)));
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["one", "two"]
            mode = "first_success"
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));

        let result = executor(resolver)
            .run_step(&instance, def.step("b").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::RetryableError);
        assert!(result.error.unwrap().message.contains("; "));
    }

    #[tokio::test]
    async fn test_cancelled_step_returns_none() {
        let resolver = StaticResolver::new().with(
            "consumer",
            FnAgent::shared(|_req: AgentRequest| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(AgentResponse::success(Payload::new()))
            }),
        );
        let def = definition(
            r#"
            [[steps]]
            id = "b"
            agents = ["consumer"]
            next = { ok = "end" }
            "#,
        );
        let instance = instance_after_a(&def, json!({}));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = executor(resolver)
            .run_step(&instance, def.step("b").unwrap(), &cancel)
            .await;

        assert!(result.is_none());
    }
}
