//! Core data model: [`Task`], [`StageState`], and the small enums that thread through every
//! component. A task is the root entity created at upload acceptance and mutated only by the
//! stage currently holding it; no concurrent writers per task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque unique identifier for a task.
pub type TaskId = String;

/// Receives a stage's progress milestones as they occur, rather than after the stage's `run()`
/// call returns. Implemented by the orchestrator against the live registry so progress is
/// visible while a stage is still inside its timeout budget.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: u8);
}

/// No-op sink for call sites (tests, tooling) that don't care about progress milestones.
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn report(&self, _progress: u8) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The three stages, in their fixed execution order. `current_stage()` on [`Task`] is defined
/// as the earliest stage whose [`StageState::status`] is not `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    DocumentParsing,
    ContentAnalysis,
    AiAnalysis,
}

impl StageName {
    pub const ORDER: [StageName; 3] = [
        StageName::DocumentParsing,
        StageName::ContentAnalysis,
        StageName::AiAnalysis,
    ];

    /// The fixed weight this stage contributes to `overall_progress`.
    pub fn weight(self) -> f64 {
        match self {
            StageName::DocumentParsing => 0.25,
            StageName::ContentAnalysis => 0.35,
            StageName::AiAnalysis => 0.40,
        }
    }

    pub fn predecessor(self) -> Option<StageName> {
        let idx = Self::ORDER.iter().position(|s| *s == self)?;
        if idx == 0 { None } else { Some(Self::ORDER[idx - 1]) }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageName::DocumentParsing => "document_parsing",
            StageName::ContentAnalysis => "content_analysis",
            StageName::AiAnalysis => "ai_analysis",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One per stage per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub stage_name: StageName,
    pub status: StageStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<StageError>,
}

impl StageState {
    pub fn pending(stage_name: StageName) -> Self {
        Self {
            stage_name,
            status: StageStatus::Pending,
            progress: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Completion implies progress = 100.
    pub fn is_complete(&self) -> bool {
        self.status == StageStatus::Completed && self.progress == 100
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub kind: String,
    pub message: String,
}

/// The root entity. `overall_progress` and `current_stage` are derived fields recomputed by
/// the progress hub from the three `StageState`s rather than stored independently, so they
/// cannot drift out of sync with the underlying stage states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub execution_mode: ExecutionMode,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub storage_path: String,
    pub overall_status: OverallStatus,
    pub overall_progress: u8,
    pub current_stage: Option<StageName>,
    pub stages: [StageState; 3],
}

impl Task {
    pub fn new(
        task_id: TaskId,
        file_name: String,
        file_size: u64,
        file_type: String,
        storage_path: String,
        execution_mode: ExecutionMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            created_at: now,
            updated_at: now,
            execution_mode,
            file_name,
            file_size,
            file_type,
            storage_path,
            overall_status: OverallStatus::Pending,
            overall_progress: 0,
            current_stage: Some(StageName::DocumentParsing),
            stages: [
                StageState::pending(StageName::DocumentParsing),
                StageState::pending(StageName::ContentAnalysis),
                StageState::pending(StageName::AiAnalysis),
            ],
        }
    }

    pub fn stage(&self, name: StageName) -> &StageState {
        self.stages
            .iter()
            .find(|s| s.stage_name == name)
            .expect("all three stages are always present")
    }

    pub fn stage_mut(&mut self, name: StageName) -> &mut StageState {
        self.stages
            .iter_mut()
            .find(|s| s.stage_name == name)
            .expect("all three stages are always present")
    }

    /// The earliest non-completed stage, or `None` if all are completed.
    pub fn recompute_current_stage(&mut self) {
        self.current_stage = StageName::ORDER
            .into_iter()
            .find(|s| self.stage(*s).status != StageStatus::Completed);
    }

    /// Fixed-weight sum over stage progresses.
    pub fn recompute_overall_progress(&mut self) {
        let weighted: f64 = StageName::ORDER
            .into_iter()
            .map(|s| s.weight() * self.stage(s).progress as f64)
            .sum();
        self.overall_progress = weighted.round() as u8;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.overall_status, OverallStatus::Completed | OverallStatus::Failed)
    }
}
