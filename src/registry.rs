//! Task Registry & Progress Hub (C7).
//!
//! Creates tasks, exposes read/write operations on their state, and fans out progress events.
//! The in-process `tasks` map is the registry's fast path (no concurrent writers per task, so a
//! per-task mutex is enough); every mutation is mirrored into the [`KvStore`] so the latest
//! snapshot survives process-local state being discarded and stays queryable for pull recovery.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::binder::SessionBinder;
use crate::error::{KvError, PipelineError};
use crate::kv::{KvStore, KvStoreExt, Namespace};
use crate::model::{ExecutionMode, OverallStatus, ProgressSink, StageError, StageName, StageStatus, Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AnalysisProgress,
    StageCompleted,
    AnalysisCompleted,
    AnalysisFailed,
}

/// `{task_id, stage, stage_progress, overall_progress, status, message, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub task_id: TaskId,
    pub stage: Option<StageName>,
    pub stage_progress: Option<u8>,
    pub overall_progress: u8,
    pub status: OverallStatus,
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Process-local observer of every event, regardless of subscriber binding. Plays the role a
/// synchronous task-event handler list plays for logging and metrics.
pub trait ProgressEventHandler: Send + Sync {
    fn handle_event(&self, event: &ProgressEvent) -> anyhow::Result<()>;
}

pub struct LoggingProgressHandler;

impl ProgressEventHandler for LoggingProgressHandler {
    fn handle_event(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        info!(
            task_id = %event.task_id,
            event_type = ?event.event_type,
            overall_progress = event.overall_progress,
            "progress event"
        );
        Ok(())
    }
}

pub struct TaskRegistry {
    kv: Arc<dyn KvStore>,
    binder: Arc<SessionBinder>,
    tasks: DashMap<TaskId, Arc<Mutex<Task>>>,
    handlers: Vec<Box<dyn ProgressEventHandler>>,
    ttl: Duration,
}

impl TaskRegistry {
    pub fn new(kv: Arc<dyn KvStore>, binder: Arc<SessionBinder>, ttl: Duration) -> Self {
        Self {
            kv,
            binder,
            tasks: DashMap::new(),
            handlers: vec![Box::new(LoggingProgressHandler)],
            ttl,
        }
    }

    pub fn add_event_handler(&mut self, handler: Box<dyn ProgressEventHandler>) {
        self.handlers.push(handler);
    }

    pub async fn create_task(
        &self,
        task_id: TaskId,
        file_name: String,
        file_size: u64,
        file_type: String,
        storage_path: String,
        execution_mode: ExecutionMode,
    ) -> Result<Task, KvError> {
        let task = Task::new(task_id.clone(), file_name, file_size, file_type, storage_path, execution_mode);
        self.persist(&task).await?;
        self.tasks.insert(task_id, Arc::new(Mutex::new(task.clone())));
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        if let Some(entry) = self.tasks.get(task_id) {
            return Some(entry.lock().await.clone());
        }
        self.kv
            .get_typed::<Task>(Namespace::BasicInfo, task_id, "task")
            .await
            .ok()
            .flatten()
    }

    pub async fn list(&self, limit: usize) -> Vec<Task> {
        let mut tasks: Vec<Task> = Vec::new();
        for entry in self.tasks.iter() {
            tasks.push(entry.value().lock().await.clone());
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        tasks
    }

    /// May only start if the predecessor stage is completed (or this is the first stage).
    pub async fn try_start_stage(&self, task_id: &str, stage: StageName) -> Result<bool, PipelineError> {
        let Some(entry) = self.tasks.get(task_id) else {
            return Ok(false);
        };
        let entry = entry.clone();
        let mut task = entry.lock().await;

        if let Some(predecessor) = stage.predecessor() {
            if task.stage(predecessor).status != StageStatus::Completed {
                return Ok(false);
            }
        }

        let stage_state = task.stage_mut(stage);
        stage_state.status = StageStatus::Running;
        stage_state.progress = 1;
        stage_state.started_at = Some(Utc::now());
        task.overall_status = OverallStatus::Running;
        task.recompute_current_stage();
        task.recompute_overall_progress();
        task.updated_at = Utc::now();

        let snapshot = task.clone();
        drop(task);
        self.persist(&snapshot).await.map_err(|e| PipelineError::Internal(e.into()))?;
        self.emit(EventType::AnalysisProgress, &snapshot, Some(stage), None).await;
        Ok(true)
    }

    pub async fn update_stage_progress(&self, task_id: &str, stage: StageName, progress: u8) -> Result<(), PipelineError> {
        let Some(entry) = self.tasks.get(task_id).map(|e| e.clone()) else {
            return Ok(());
        };
        let mut task = entry.lock().await;
        task.stage_mut(stage).progress = progress.min(99);
        task.recompute_overall_progress();
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        drop(task);
        self.persist(&snapshot).await.map_err(|e| PipelineError::Internal(e.into()))?;
        self.emit(EventType::AnalysisProgress, &snapshot, Some(stage), Some(progress)).await;
        Ok(())
    }

    /// The caller must have already written the `StageResult` before calling this.
    pub async fn complete_stage(&self, task_id: &str, stage: StageName) -> Result<(), PipelineError> {
        let Some(entry) = self.tasks.get(task_id).map(|e| e.clone()) else {
            return Ok(());
        };
        let mut task = entry.lock().await;
        let stage_state = task.stage_mut(stage);
        stage_state.status = StageStatus::Completed;
        stage_state.progress = 100;
        stage_state.finished_at = Some(Utc::now());
        task.recompute_current_stage();
        task.recompute_overall_progress();

        let all_done = task.current_stage.is_none();
        if all_done {
            task.overall_status = OverallStatus::Completed;
        }
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        drop(task);

        self.persist(&snapshot).await.map_err(|e| PipelineError::Internal(e.into()))?;
        self.emit(EventType::StageCompleted, &snapshot, Some(stage), Some(100)).await;
        if all_done {
            self.emit(EventType::AnalysisCompleted, &snapshot, None, None).await;
            self.binder.unbind(task_id).await;
        }
        Ok(())
    }

    pub async fn fail_stage(&self, task_id: &str, stage: StageName, error: PipelineError) -> Result<(), PipelineError> {
        let Some(entry) = self.tasks.get(task_id).map(|e| e.clone()) else {
            return Ok(());
        };
        let mut task = entry.lock().await;
        task.stage_mut(stage).status = StageStatus::Failed;
        task.stage_mut(stage).finished_at = Some(Utc::now());
        task.stage_mut(stage).error = Some(StageError {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        task.overall_status = OverallStatus::Failed;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        drop(task);

        self.persist(&snapshot).await.map_err(|e| PipelineError::Internal(e.into()))?;
        warn!(task_id, stage = ?stage, error = %error, "stage failed");
        self.emit(EventType::AnalysisFailed, &snapshot, Some(stage), None).await;
        self.binder.unbind(task_id).await;
        Ok(())
    }

    pub async fn cancel(&self, task_id: &str) -> Result<(), PipelineError> {
        if let Some(stage) = self.get(task_id).await.and_then(|t| t.current_stage) {
            self.fail_stage(task_id, stage, PipelineError::Cancelled).await?;
        }
        Ok(())
    }

    async fn persist(&self, task: &Task) -> Result<(), KvError> {
        self.kv
            .put_typed(Namespace::BasicInfo, &task.task_id, "task", task, self.ttl)
            .await
    }

    async fn emit(&self, event_type: EventType, task: &Task, stage: Option<StageName>, stage_progress: Option<u8>) {
        let event = ProgressEvent {
            event_type,
            task_id: task.task_id.clone(),
            stage,
            stage_progress,
            overall_progress: task.overall_progress,
            status: task.overall_status,
            message: None,
            timestamp: Utc::now(),
        };
        for handler in &self.handlers {
            if let Err(e) = handler.handle_event(&event) {
                warn!(error = %e, "progress event handler failed");
            }
        }
        self.binder.route(&event).await;
    }
}

/// Streams a single stage's milestones straight to the registry as they're reported, so a
/// long-running async stage's progress is observable before it returns.
pub struct RegistryProgressSink<'a> {
    registry: &'a TaskRegistry,
    task_id: &'a str,
    stage: StageName,
}

impl<'a> RegistryProgressSink<'a> {
    pub fn new(registry: &'a TaskRegistry, task_id: &'a str, stage: StageName) -> Self {
        Self { registry, task_id, stage }
    }
}

#[async_trait]
impl<'a> ProgressSink for RegistryProgressSink<'a> {
    async fn report(&self, progress: u8) {
        if let Err(e) = self.registry.update_stage_progress(self.task_id, self.stage, progress).await {
            warn!(task_id = self.task_id, stage = ?self.stage, error = %e, "failed to record stage progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::DashMapKvStore;

    async fn registry() -> TaskRegistry {
        let kv = DashMapKvStore::new(Duration::from_secs(60));
        let binder = Arc::new(SessionBinder::new(Duration::from_secs(5)));
        TaskRegistry::new(kv, binder, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn overall_progress_is_weighted_sum_of_stages() {
        let registry = registry().await;
        let task = registry
            .create_task(
                "t1".to_string(),
                "spec.md".to_string(),
                100,
                "md".to_string(),
                "/tmp/spec.md".to_string(),
                ExecutionMode::Automatic,
            )
            .await
            .unwrap();
        assert_eq!(task.overall_progress, 0);

        registry.try_start_stage("t1", StageName::DocumentParsing).await.unwrap();
        registry.update_stage_progress("t1", StageName::DocumentParsing, 100).await.unwrap();
        registry.complete_stage("t1", StageName::DocumentParsing).await.unwrap();

        let task = registry.get("t1").await.unwrap();
        assert_eq!(task.overall_progress, 25);
        assert_eq!(task.current_stage, Some(StageName::ContentAnalysis));
    }

    #[tokio::test]
    async fn manual_mode_rejects_out_of_order_stage_start() {
        let registry = registry().await;
        registry
            .create_task(
                "t2".to_string(),
                "spec.md".to_string(),
                100,
                "md".to_string(),
                "/tmp/spec.md".to_string(),
                ExecutionMode::Manual,
            )
            .await
            .unwrap();
        let accepted = registry.try_start_stage("t2", StageName::ContentAnalysis).await.unwrap();
        assert!(!accepted);
    }
}
