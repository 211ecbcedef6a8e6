//! End-to-end scenario tests exercising the pipeline through its public API: upload a file,
//! drive it through the orchestrator, and observe task state, progress events, and results.

use doc_architect::analyzer::EmptyVectorStore;
use doc_architect::binder::SessionBinder;
use doc_architect::config::PipelineConfig;
use doc_architect::error::LlmError;
use doc_architect::kv::{KvStoreExt, Namespace};
use doc_architect::llm::mock::ScriptedLlmClient;
use doc_architect::model::{ExecutionMode, OverallStatus, StageName};
use doc_architect::{DashMapKvStore, LlmClient, StageOrchestrator, TaskRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Union of every required key across all seven architect steps plus the fields a chunk's
/// `ChangeAnalysis` response needs. Satisfies every LLM call the pipeline makes regardless of
/// which step or chunk is asking.
fn universal_llm_response() -> String {
    serde_json::json!({
        "functional_requirements": ["Add login API"],
        "non_functional_requirements": ["Must be fast"],
        "business_entities": ["User"],
        "user_stories": ["As a user I can log in"],
        "complexity_assessment": "medium",
        "api_specification": {"paths": ["/login"]},
        "interfaces": ["LoginService"],
        "data_models": ["User"],
        "data_flow_diagram": "client -> api -> db",
        "frontend_architecture": "SPA",
        "backend_architecture": "REST service",
        "authentication": "JWT",
        "authorization": "RBAC",
        "data_protection": "TLS in transit",
        "mq_configuration": "none",
        "scheduler_design": "none",
        "database_schema": {"users": ["id", "email"]},
        "init_sql": "CREATE TABLE users (id INT);",
        "components": ["planner"],
        "tools": ["retriever"],
        "execution_flow": "retrieve -> plan -> assemble",
        "change_type": "新增",
        "change_reason": "new endpoint",
        "change_items": ["login"],
        "version": ["v1"]
    })
    .to_string()
}

fn write_temp_doc(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

async fn new_harness(llm: Arc<dyn LlmClient>) -> (Arc<TaskRegistry>, StageOrchestrator) {
    let kv = DashMapKvStore::new(Duration::from_secs(60));
    let binder = Arc::new(SessionBinder::new(Duration::from_secs(3600)));
    let registry = Arc::new(TaskRegistry::new(kv.clone(), binder, Duration::from_secs(60)));
    let vector_store = Arc::new(EmptyVectorStore);
    let orchestrator = StageOrchestrator::new(registry.clone(), kv, llm, vector_store, PipelineConfig::default());
    (registry, orchestrator)
}

#[tokio::test]
async fn happy_path_automatic_reaches_full_completion() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_temp_doc(&dir, "spec.md", "# Title\nAdd login API.\n");

    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::always(universal_llm_response()));
    let (registry, orchestrator) = new_harness(llm).await;

    registry
        .create_task(
            "task-1".to_string(),
            "spec.md".to_string(),
            file.metadata().unwrap().len(),
            "md".to_string(),
            file.display().to_string(),
            ExecutionMode::Automatic,
        )
        .await
        .unwrap();

    orchestrator.run_all("task-1", file, "spec.md".to_string()).await.unwrap();

    let task = registry.get("task-1").await.unwrap();
    assert_eq!(task.overall_status, OverallStatus::Completed);
    assert_eq!(task.overall_progress, 100);
    assert!(task.current_stage.is_none());
}

#[tokio::test]
async fn manual_mode_rejects_stage_started_out_of_order() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_temp_doc(&dir, "spec.md", "# Title\nBody text.\n");

    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::always(universal_llm_response()));
    let (registry, orchestrator) = new_harness(llm).await;

    registry
        .create_task(
            "task-2".to_string(),
            "spec.md".to_string(),
            file.metadata().unwrap().len(),
            "md".to_string(),
            file.display().to_string(),
            ExecutionMode::Manual,
        )
        .await
        .unwrap();

    let response = orchestrator
        .run_stage("task-2", StageName::ContentAnalysis, &file, "spec.md")
        .await
        .unwrap();

    assert!(!response.accepted);
    assert_eq!(response.reason.as_deref(), Some("prerequisite_not_completed"));

    let task = registry.get("task-2").await.unwrap();
    assert_eq!(task.overall_status, OverallStatus::Pending);
}

#[tokio::test]
async fn reconnect_rebinds_subsequent_events_to_new_channel_only() {
    let binder = SessionBinder::new(Duration::from_secs(3600));
    let mut rx_a = binder.register_channel("A".to_string());
    let mut rx_b = binder.register_channel("B".to_string());

    binder.bind("T", "A".to_string()).await;
    let event = doc_architect::registry::ProgressEvent {
        event_type: doc_architect::registry::EventType::AnalysisProgress,
        task_id: "T".to_string(),
        stage: Some(StageName::DocumentParsing),
        stage_progress: Some(50),
        overall_progress: 10,
        status: OverallStatus::Running,
        message: None,
        timestamp: chrono::Utc::now(),
    };
    binder.route(&event).await;
    binder.rebind("T", "B".to_string()).await;
    binder.route(&event).await;

    assert!(rx_a.try_recv().is_ok());
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_ok());
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn transient_llm_failure_recovers_within_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_temp_doc(&dir, "spec.md", "# Title\nAdd login API.\n");

    let script = vec![
        Err(LlmError::Network("connection reset".to_string())),
        Err(LlmError::Network("connection reset".to_string())),
        Ok(universal_llm_response()),
    ];
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::new(script));
    let (registry, orchestrator) = new_harness(llm).await;

    registry
        .create_task(
            "task-4".to_string(),
            "spec.md".to_string(),
            file.metadata().unwrap().len(),
            "md".to_string(),
            file.display().to_string(),
            ExecutionMode::Automatic,
        )
        .await
        .unwrap();

    orchestrator.run_all("task-4", file, "spec.md".to_string()).await.unwrap();

    let task = registry.get("task-4").await.unwrap();
    assert_eq!(task.overall_status, OverallStatus::Completed);
}

#[tokio::test]
async fn unsupported_file_type_fails_stage_one_with_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_temp_doc(&dir, "archive.zip", "not really a zip");

    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::always(universal_llm_response()));
    let (registry, orchestrator) = new_harness(llm).await;

    registry
        .create_task(
            "task-6".to_string(),
            "archive.zip".to_string(),
            file.metadata().unwrap().len(),
            "zip".to_string(),
            file.display().to_string(),
            ExecutionMode::Automatic,
        )
        .await
        .unwrap();

    orchestrator.run_all("task-6", file, "archive.zip".to_string()).await.unwrap();

    let task = registry.get("task-6").await.unwrap();
    assert_eq!(task.overall_status, OverallStatus::Failed);
    let stage = task.stage(StageName::DocumentParsing);
    assert_eq!(stage.error.as_ref().unwrap().kind, "validation_error");
}

#[tokio::test]
async fn result_query_after_completion_returns_assembled_design() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_temp_doc(&dir, "spec.md", "# Title\nAdd login API.\n");

    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::always(universal_llm_response()));
    let kv = DashMapKvStore::new(Duration::from_secs(60));
    let binder = Arc::new(SessionBinder::new(Duration::from_secs(3600)));
    let registry = Arc::new(TaskRegistry::new(kv.clone(), binder, Duration::from_secs(60)));
    let vector_store = Arc::new(EmptyVectorStore);
    let orchestrator = StageOrchestrator::new(registry.clone(), kv.clone(), llm, vector_store, PipelineConfig::default());

    registry
        .create_task(
            "task-7".to_string(),
            "spec.md".to_string(),
            file.metadata().unwrap().len(),
            "md".to_string(),
            file.display().to_string(),
            ExecutionMode::Automatic,
        )
        .await
        .unwrap();

    orchestrator.run_all("task-7", file, "spec.md".to_string()).await.unwrap();

    let design: Option<doc_architect::architect::ArchitectureDesign> = kv
        .get_typed(Namespace::AssembledResult, "task-7", "result")
        .await
        .unwrap();
    let design = design.expect("assembled result should be present");
    assert!(design.api_design.get("interfaces").is_some());
    assert!(design.business_analysis.get("functional_requirements").is_some());
}
