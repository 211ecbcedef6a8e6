use doc_architect::analyzer::EmptyVectorStore;
use doc_architect::architect::ArchitectureDesign;
use doc_architect::cli::{Args, Commands};
use doc_architect::config::{ConfigDiscovery, PipelineConfig};
use doc_architect::kv::{KvStoreExt, Namespace};
use doc_architect::llm::HttpLlmClient;
use doc_architect::model::ExecutionMode;
use doc_architect::{DashMapKvStore, LlmClient, SessionBinder, StageOrchestrator, TaskRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("doc_architect=info")
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => ConfigDiscovery::discover()?,
    };

    let kv = DashMapKvStore::new(Duration::from_secs(config.kv.sweep_interval_secs));
    let binder = Arc::new(SessionBinder::new(Duration::from_secs(5)));
    let ttl = Duration::from_secs(config.kv.default_ttl_secs);
    let registry = Arc::new(TaskRegistry::new(kv.clone(), binder, ttl));
    let llm = build_llm_client(&config)?;
    let vector_store = Arc::new(EmptyVectorStore);
    let orchestrator = StageOrchestrator::new(registry.clone(), kv.clone(), llm, vector_store, config);

    match args.command {
        Commands::Analyze { file, mode } => run_analyze(&registry, &orchestrator, file, mode.into()).await,
        Commands::Advance { task_id } => run_advance(&registry, &orchestrator, &task_id).await,
        Commands::Status { task_id } => run_status(&registry, &task_id).await,
        Commands::Result { task_id } => run_result(&*kv, &task_id).await,
    }
}

fn build_llm_client(config: &PipelineConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    let base_url = config
        .llm
        .base_url
        .as_deref()
        .context("no LLM endpoint configured; set [llm] base_url and api_key in the config file")?;
    let api_key = config.llm.api_key.clone().unwrap_or_default();
    Ok(Arc::new(HttpLlmClient::with_config(base_url, api_key, &config.llm)?))
}

async fn run_analyze(
    registry: &Arc<TaskRegistry>,
    orchestrator: &StageOrchestrator,
    file: PathBuf,
    mode: ExecutionMode,
) -> anyhow::Result<()> {
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("input file has no usable name")?
        .to_string();
    let file_size = std::fs::metadata(&file)?.len();
    let file_type = file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let task_id = uuid::Uuid::new_v4().to_string();
    let storage_path = doc_architect::env::upload_file_path(&std::env::current_dir()?, &task_id, &file_name);
    if let Some(parent) = storage_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&file, &storage_path)?;

    registry
        .create_task(task_id.clone(), file_name.clone(), file_size, file_type, storage_path.display().to_string(), mode)
        .await?;

    info!(task_id, "task created");
    println!("task_id: {task_id}");

    match mode {
        ExecutionMode::Automatic => {
            orchestrator.run_all(&task_id, storage_path, file_name).await?;
            run_status(registry, &task_id).await
        }
        ExecutionMode::Manual => {
            println!("manual mode: run `doc-architect advance {task_id}` to run the next stage");
            Ok(())
        }
    }
}

async fn run_advance(
    registry: &Arc<TaskRegistry>,
    orchestrator: &StageOrchestrator,
    task_id: &str,
) -> anyhow::Result<()> {
    let task = registry.get(task_id).await.context("unknown task_id")?;
    let Some(stage) = task.current_stage else {
        println!("task {task_id} has no pending stage (status: {:?})", task.overall_status);
        return Ok(());
    };
    let storage_path = PathBuf::from(&task.storage_path);
    let response = orchestrator.run_stage(task_id, stage, &storage_path, &task.file_name).await?;
    if !response.accepted {
        error!(task_id, reason = ?response.reason, "stage not accepted");
    }
    run_status(registry, task_id).await
}

async fn run_status(registry: &Arc<TaskRegistry>, task_id: &str) -> anyhow::Result<()> {
    let task = registry.get(task_id).await.context("unknown task_id")?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

async fn run_result(kv: &dyn doc_architect::KvStore, task_id: &str) -> anyhow::Result<()> {
    let design: Option<ArchitectureDesign> = kv.get_typed(Namespace::AssembledResult, task_id, "result").await?;
    match design {
        Some(design) => println!("{}", serde_json::to_string_pretty(&design)?),
        None => println!("no assembled result yet for task {task_id}"),
    }
    Ok(())
}
