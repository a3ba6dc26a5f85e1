//! melted-orchestrator のコマンドラインインターフェース

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use melted_orchestrator::agent::StaticResolver;
use melted_orchestrator::engine::{InstanceStatus, Payload};
use melted_orchestrator::events::TracingSink;
use melted_orchestrator::store::{FileStateStore, InMemoryStateStore, StateStore};
use melted_orchestrator::{InstanceId, Settings, WorkflowDefinition, WorkflowEngine, logging};

#[derive(Parser, Debug)]
#[command(name = "melted-orchestrator")]
#[command(about = "マルチエージェントのワークフローを実行します", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// ワークフローを最後まで実行し、最終状態を JSON で出力
    Run {
        /// ワークフロー定義（TOML）
        #[arg(short, long)]
        workflow: PathBuf,

        /// 設定ファイル（TOML）
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// 状態を保存するディレクトリ（省略時はメモリ上のみ）
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// 入力フィールド `key=value`（値は JSON として解釈し、失敗したら文字列）
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// 入力全体を JSON オブジェクトで指定
        #[arg(long)]
        input_json: Option<String>,
    },

    /// ワークフロー定義を検証してステップの概要を出力
    Validate {
        #[arg(short, long)]
        workflow: PathBuf,
    },

    /// 保存済みインスタンスの状態を出力
    Status {
        #[arg(long)]
        state_dir: PathBuf,

        #[arg(long)]
        instance: InstanceId,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            workflow,
            settings,
            state_dir,
            inputs,
            input_json,
        } => {
            let settings = match settings {
                Some(path) => Settings::from_file(path)?,
                None => Settings::default(),
            };
            let _guard = logging::init(&settings.logging)?;

            let input = parse_input(&inputs, input_json.as_deref())?;
            let status = run(&workflow, settings, state_dir.as_deref(), input).await?;
            if status != InstanceStatus::Succeeded {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Validate { workflow } => {
            let definition = WorkflowDefinition::from_file(&workflow)?;
            println!("{} (開始: {})", definition.reference(), definition.start());
            for step in definition.steps() {
                println!(
                    "  - {} [{:?}] agents={} max_retries={}",
                    step.id(),
                    step.mode(),
                    step.agents().join(","),
                    step.max_retries()
                );
            }
        }
        Command::Status {
            state_dir,
            instance,
        } => {
            let store = FileStateStore::open(state_dir).await?;
            let instance = store.load(instance).await?;
            println!("{}", serde_json::to_string_pretty(&instance)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run(
    workflow: &Path,
    settings: Settings,
    state_dir: Option<&Path>,
    input: Payload,
) -> Result<InstanceStatus, Box<dyn std::error::Error>> {
    let definition = WorkflowDefinition::from_file(workflow)?;
    let store: Arc<dyn StateStore> = match state_dir {
        Some(dir) => Arc::new(FileStateStore::open(dir).await?),
        None => Arc::new(InMemoryStateStore::new()),
    };

    let engine = WorkflowEngine::builder()
        .resolver(Arc::new(StaticResolver::from_bindings(&settings.agents)))
        .store(store)
        .sink(Arc::new(TracingSink))
        .settings(settings.engine)
        .build();

    let definition = engine.register(definition);
    let id = engine.start(definition, input).await?;

    let finished = tokio::select! {
        finished = engine.wait(id) => finished?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(instance_id = %id, "interrupted; cancelling instance");
            engine.cancel(id).await?;
            engine.wait(id).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&finished)?);
    Ok(finished.status)
}

/// `--input` と `--input-json` から初期入力を組み立てる
fn parse_input(pairs: &[String], json: Option<&str>) -> Result<Payload, Box<dyn std::error::Error>> {
    let mut input = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err("--input-json は JSON オブジェクトである必要があります".into()),
        },
        None => Payload::new(),
    };

    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("--input '{pair}' は KEY=VALUE 形式である必要があります"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        input.insert(key.to_string(), value);
    }
    Ok(input)
}
