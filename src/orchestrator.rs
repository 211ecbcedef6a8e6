//! Stage Orchestrator (C6). Drives the three stages for one task, enforcing prerequisite
//! gating and stage-result ordering, categorizing failures into the registry before
//! propagating them to the caller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::analyzer::{ContentAnalyzerStage, VectorStore};
use crate::architect::AiArchitectPlanner;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::kv::{KvStore, KvStoreExt, Namespace};
use crate::llm::LlmClient;
use crate::model::StageName;
use crate::parser::DocumentParserStage;
use crate::registry::{RegistryProgressSink, TaskRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartStageResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}

pub struct StageOrchestrator {
    registry: Arc<TaskRegistry>,
    kv: Arc<dyn KvStore>,
    llm: Arc<dyn LlmClient>,
    vector_store: Arc<dyn VectorStore>,
    parser: DocumentParserStage,
    config: PipelineConfig,
}

impl StageOrchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        kv: Arc<dyn KvStore>,
        llm: Arc<dyn LlmClient>,
        vector_store: Arc<dyn VectorStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            kv,
            llm,
            vector_store,
            parser: DocumentParserStage::default(),
            config,
        }
    }

    /// Automatic mode: chains document_parsing -> content_analysis -> ai_analysis, stopping at
    /// the first stage that fails.
    #[instrument(skip(self))]
    pub async fn run_all(&self, task_id: &str, storage_path: PathBuf, file_name: String) -> Result<(), PipelineError> {
        for stage in StageName::ORDER {
            let response = self.run_stage(task_id, stage, &storage_path, &file_name).await?;
            if !response.accepted {
                return Err(PipelineError::Internal(anyhow::anyhow!(
                    "stage {stage} rejected in automatic mode: {:?}",
                    response.reason
                )));
            }
            if self.registry.get(task_id).await.map(|t| t.overall_status) == Some(crate::model::OverallStatus::Failed) {
                break;
            }
        }
        Ok(())
    }

    /// Manual mode entry point: verifies the prerequisite stage is complete before starting,
    /// returning `{accepted, reason}` without starting the stage when rejected.
    #[instrument(skip(self))]
    pub async fn run_stage(
        &self,
        task_id: &str,
        stage: StageName,
        storage_path: &PathBuf,
        file_name: &str,
    ) -> Result<StartStageResponse, PipelineError> {
        let accepted = self.registry.try_start_stage(task_id, stage).await?;
        if !accepted {
            return Ok(StartStageResponse {
                accepted: false,
                reason: Some("prerequisite_not_completed".to_string()),
            });
        }

        let timeout = self.stage_timeout(stage);
        let outcome = tokio::time::timeout(timeout, self.execute(task_id, stage, storage_path, file_name)).await;

        match outcome {
            Ok(Ok(())) => {
                self.registry.complete_stage(task_id, stage).await?;
                Ok(StartStageResponse {
                    accepted: true,
                    reason: None,
                })
            }
            Ok(Err(err)) => {
                self.registry.fail_stage(task_id, stage, err).await?;
                Ok(StartStageResponse {
                    accepted: true,
                    reason: None,
                })
            }
            Err(_elapsed) => {
                let err = PipelineError::StageTimeout { stage };
                self.registry.fail_stage(task_id, stage, err).await?;
                Ok(StartStageResponse {
                    accepted: true,
                    reason: None,
                })
            }
        }
    }

    fn stage_timeout(&self, stage: StageName) -> Duration {
        let t = &self.config.timeouts;
        Duration::from_secs(match stage {
            StageName::DocumentParsing => t.document_parsing_secs,
            StageName::ContentAnalysis => t.content_analysis_secs,
            StageName::AiAnalysis => t.ai_analysis_secs,
        })
    }

    async fn execute(
        &self,
        task_id: &str,
        stage: StageName,
        storage_path: &PathBuf,
        file_name: &str,
    ) -> Result<(), PipelineError> {
        match stage {
            StageName::DocumentParsing => self.run_document_parsing(task_id, storage_path, file_name).await,
            StageName::ContentAnalysis => self.run_content_analysis(task_id).await,
            StageName::AiAnalysis => self.run_ai_analysis(task_id).await,
        }
    }

    async fn run_document_parsing(&self, task_id: &str, storage_path: &PathBuf, file_name: &str) -> Result<(), PipelineError> {
        // `DocumentParserStage::run` is synchronous CPU work, so progress milestones are
        // collected in order and reported afterward rather than via a callback that would need
        // to block on async registry writes mid-extraction.
        let mut milestones = Vec::new();
        let result = self.parser.run(storage_path, file_name, |progress| milestones.push(progress))?;
        for progress in milestones {
            self.registry.update_stage_progress(task_id, StageName::DocumentParsing, progress).await?;
        }

        self.kv
            .put_typed(
                Namespace::StageResult(StageName::DocumentParsing),
                task_id,
                "result",
                &result,
                Duration::from_secs(self.config.kv.default_ttl_secs),
            )
            .await
            .map_err(|e| PipelineError::Internal(e.into()))?;
        info!(task_id, "document parsing stage result written");
        Ok(())
    }

    async fn run_content_analysis(&self, task_id: &str) -> Result<(), PipelineError> {
        let parse_result: crate::parser::DocumentParseResult = self
            .kv
            .get_typed::<crate::parser::DocumentParseStageResult>(
                Namespace::StageResult(StageName::DocumentParsing),
                task_id,
                "result",
            )
            .await
            .map_err(|e| PipelineError::Internal(e.into()))?
            .ok_or_else(|| PipelineError::Internal(anyhow::anyhow!("missing document parsing result")))?
            .parse;

        let stage = ContentAnalyzerStage::new(self.llm.as_ref(), self.vector_store.clone(), self.config.analyzer.clone());
        let sink = RegistryProgressSink::new(self.registry.as_ref(), task_id, StageName::ContentAnalysis);
        let result = stage.run(&parse_result, &sink).await?;

        self.kv
            .put_typed(
                Namespace::StageResult(StageName::ContentAnalysis),
                task_id,
                "result",
                &result,
                Duration::from_secs(self.config.kv.default_ttl_secs),
            )
            .await
            .map_err(|e| PipelineError::Internal(e.into()))?;
        Ok(())
    }

    async fn run_ai_analysis(&self, task_id: &str) -> Result<(), PipelineError> {
        let analysis = self
            .kv
            .get_typed::<crate::analyzer::ContentAnalysisResult>(
                Namespace::StageResult(StageName::ContentAnalysis),
                task_id,
                "result",
            )
            .await
            .map_err(|e| PipelineError::Internal(e.into()))?
            .ok_or_else(|| PipelineError::Internal(anyhow::anyhow!("missing content analysis result")))?;

        let planner = AiArchitectPlanner::new(self.llm.as_ref(), self.config.architect.clone());
        let sink = RegistryProgressSink::new(self.registry.as_ref(), task_id, StageName::AiAnalysis);
        let design = planner.run(&analysis, &sink).await?;

        self.kv
            .put_typed(
                Namespace::AssembledResult,
                task_id,
                "result",
                &design,
                Duration::from_secs(self.config.kv.default_ttl_secs),
            )
            .await
            .map_err(|e| PipelineError::Internal(e.into()))?;
        Ok(())
    }
}
