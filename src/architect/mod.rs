//! AI Architect Planner (C5), the heart of the system. Seven sequenced LLM calls that
//! transform the Content Analyzer's output into a structured architecture design.

use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::analyzer::ContentAnalysisResult;
use crate::config::ArchitectConfig;
use crate::error::PipelineError;
use crate::llm::LlmClient;
use crate::llm::retry::backoff_delay;
use crate::model::ProgressSink;

/// One of the seven planning steps plus the final assembly, in their fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Requirements,
    ApiAndDataFlow,
    FrontendAndBackend,
    Security,
    MqAndScheduler,
    Database,
    LlmIntegration,
}

impl Step {
    pub const ORDER: [Step; 7] = [
        Step::Requirements,
        Step::ApiAndDataFlow,
        Step::FrontendAndBackend,
        Step::Security,
        Step::MqAndScheduler,
        Step::Database,
        Step::LlmIntegration,
    ];

    /// Progress milestone reached once this step's output is recorded.
    pub fn progress_after(self) -> u8 {
        match self {
            Step::Requirements => 10,
            Step::ApiAndDataFlow => 25,
            Step::FrontendAndBackend => 40,
            Step::Security => 55,
            Step::MqAndScheduler => 70,
            Step::Database => 85,
            Step::LlmIntegration => 95,
        }
    }

    fn memory_key(self) -> &'static str {
        match self {
            Step::Requirements => "requirements",
            Step::ApiAndDataFlow => "api_and_data_flow",
            Step::FrontendAndBackend => "frontend_and_backend",
            Step::Security => "security",
            Step::MqAndScheduler => "mq_and_scheduler",
            Step::Database => "database",
            Step::LlmIntegration => "llm_integration",
        }
    }

    /// Which prior steps' outputs this step's prompt is built from. Kept bounded rather than
    /// accumulating every prior step verbatim.
    fn context_steps(self) -> &'static [Step] {
        match self {
            Step::Requirements => &[],
            Step::ApiAndDataFlow => &[Step::Requirements],
            Step::FrontendAndBackend => &[Step::Requirements, Step::ApiAndDataFlow],
            Step::Security => &[Step::Requirements, Step::ApiAndDataFlow],
            Step::MqAndScheduler => &[Step::Requirements, Step::FrontendAndBackend],
            Step::Database => &[Step::Requirements, Step::ApiAndDataFlow, Step::FrontendAndBackend],
            Step::LlmIntegration => &[Step::Requirements, Step::ApiAndDataFlow, Step::Database],
        }
    }

    /// Required top-level keys the step's JSON output must carry. Schema validation is strict
    /// on these, tolerant of any additional fields the LLM includes.
    fn required_keys(self) -> &'static [&'static str] {
        match self {
            Step::Requirements => &[
                "functional_requirements",
                "non_functional_requirements",
                "business_entities",
                "user_stories",
                "complexity_assessment",
            ],
            Step::ApiAndDataFlow => &["api_specification", "interfaces", "data_models", "data_flow_diagram"],
            Step::FrontendAndBackend => &["frontend_architecture", "backend_architecture"],
            Step::Security => &["authentication", "authorization", "data_protection"],
            Step::MqAndScheduler => &["mq_configuration", "scheduler_design"],
            Step::Database => &["database_schema", "init_sql"],
            Step::LlmIntegration => &["components", "tools", "execution_flow"],
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            Step::Requirements => "You decompose a document's change analysis into functional and non-functional requirements.",
            Step::ApiAndDataFlow => "You design an API specification and a data-flow diagram consistent with the stated requirements.",
            Step::FrontendAndBackend => "You design frontend and backend architectures implementing the given API.",
            Step::Security => "You design authentication, authorization, and data protection for the given architecture.",
            Step::MqAndScheduler => "You design message-queue configuration and scheduled job design for the given architecture.",
            Step::Database => "You design a database schema and its initialization SQL for the given architecture.",
            Step::LlmIntegration => "You design the LLM-integration components, tools, and execution flow for the given architecture.",
        }
    }
}

/// Per-task in-process record: accumulated step outputs, a frozen input snapshot, and
/// per-step timestamps. Never shared across tasks.
#[derive(Debug, Clone, Default)]
pub struct PlannerMemory {
    outputs: std::collections::HashMap<&'static str, Value>,
    pub step_timestamps: Vec<(&'static str, chrono::DateTime<chrono::Utc>)>,
}

impl PlannerMemory {
    fn record(&mut self, step: Step, output: Value) {
        self.outputs.insert(step.memory_key(), output);
        self.step_timestamps.push((step.memory_key(), chrono::Utc::now()));
    }

    fn context_for(&self, step: Step) -> Value {
        let mut ctx = serde_json::Map::new();
        for dep in step.context_steps() {
            if let Some(v) = self.outputs.get(dep.memory_key()) {
                ctx.insert(dep.memory_key().to_string(), v.clone());
            }
        }
        Value::Object(ctx)
    }
}

/// Extracts JSON from free-form LLM text, tolerating markdown code fences: direct parse, then
/// a ```json fence, then a bare ``` fence, then the substring spanning the first `{` to the
/// last `}`.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }
    if let Some(v) = extract_fenced(text, "```json") {
        return Some(v);
    }
    if let Some(v) = extract_fenced(text, "```") {
        return Some(v);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        serde_json::from_str(&text[start..=end]).ok()
    } else {
        None
    }
}

fn extract_fenced(text: &str, marker: &str) -> Option<Value> {
    let start = text.find(marker)? + marker.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    serde_json::from_str(rest[..end].trim()).ok()
}

fn validate(step: Step, value: &Value) -> Result<(), String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "expected a JSON object".to_string())?;
    for key in step.required_keys() {
        if !obj.contains_key(*key) {
            return Err(format!("missing required field `{key}`"));
        }
    }
    Ok(())
}

/// Composite output of all seven steps plus assembly metadata.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ArchitectureDesign {
    pub business_analysis: Value,
    pub api_design: Value,
    pub system_architecture: Value,
    pub security_design: Value,
    pub infrastructure_design: Value,
    pub implementation_plan: Value,
    pub langchain_integration: Value,
    pub metadata: ArchitectureMetadata,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ArchitectureMetadata {
    pub analysis_method: String,
    pub framework: String,
    pub tech_stack: Vec<String>,
    pub compliance: Vec<String>,
    pub design_principles: Vec<String>,
}

pub struct AiArchitectPlanner<'a> {
    llm: &'a dyn LlmClient,
    config: ArchitectConfig,
}

impl<'a> AiArchitectPlanner<'a> {
    pub fn new(llm: &'a dyn LlmClient, config: ArchitectConfig) -> Self {
        Self { llm, config }
    }

    /// Runs all seven steps plus assembly, reporting progress via `on_progress` after each
    /// milestone. Returns `ArchitectureDesign` on success or a `PipelineError` (stage marked
    /// failed, assembly skipped) on the first unrecoverable step failure.
    #[instrument(skip(self, analysis, on_progress))]
    pub async fn run(
        &self,
        analysis: &ContentAnalysisResult,
        on_progress: &dyn ProgressSink,
    ) -> Result<ArchitectureDesign, PipelineError> {
        let mut memory = PlannerMemory::default();
        let snapshot = serde_json::to_value(analysis)
            .map_err(|e| PipelineError::Internal(anyhow::anyhow!(e)))?;
        memory.outputs.insert("c4_snapshot", snapshot);

        for step in Step::ORDER {
            let output = self.run_step(step, &memory).await?;
            memory.record(step, output);
            on_progress.report(step.progress_after()).await;
        }

        let design = self.assemble(&memory)?;
        on_progress.report(100).await;
        Ok(design)
    }

    async fn run_step(&self, step: Step, memory: &PlannerMemory) -> Result<Value, PipelineError> {
        let context = memory.context_for(step);
        let user_prompt = format!(
            "Context:\n{}\n\nProduce a JSON object with exactly these top-level fields: {:?}",
            context, step.required_keys()
        );

        let mut last_error = String::new();
        for attempt in 0..=1 {
            let prompt = if attempt == 0 {
                user_prompt.clone()
            } else {
                format!(
                    "{user_prompt}\n\nYour previous response failed validation with: {last_error}. Respond again with corrected JSON."
                )
            };

            let text = self
                .call_with_retry(step.system_prompt(), &prompt)
                .await
                .map_err(PipelineError::from)?;

            let Some(value) = extract_json(&text) else {
                last_error = "response did not contain parseable JSON".to_string();
                warn!(step = ?step, attempt, "LLM response was not parseable JSON");
                continue;
            };

            match validate(step, &value) {
                Ok(()) => return Ok(value),
                Err(e) => {
                    last_error = e;
                    warn!(step = ?step, attempt, error = %last_error, "LLM output failed schema validation");
                }
            }
        }

        Err(PipelineError::LlmSchema(format!(
            "step {step:?} failed validation after re-prompt: {last_error}"
        )))
    }

    async fn call_with_retry(&self, system_prompt: &str, user_prompt: &str) -> Result<String, crate::error::LlmError> {
        let max_retries = self.config.max_step_retries;
        let max_tokens = self.config.max_tokens_per_step;
        let mut attempt = 0;
        loop {
            let result = self
                .llm
                .call(system_prompt, user_prompt, max_tokens, Duration::from_secs(90))
                .await;
            match result {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retriable() && attempt < max_retries => {
                    let delay = backoff_delay(attempt, 2, 8);
                    info!(attempt, ?delay, "retrying architect planner LLM call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn assemble(&self, memory: &PlannerMemory) -> Result<ArchitectureDesign, PipelineError> {
        let get = |step: Step| {
            memory
                .outputs
                .get(step.memory_key())
                .cloned()
                .unwrap_or(Value::Null)
        };
        Ok(ArchitectureDesign {
            business_analysis: get(Step::Requirements),
            api_design: get(Step::ApiAndDataFlow),
            system_architecture: get(Step::FrontendAndBackend),
            security_design: get(Step::Security),
            infrastructure_design: get(Step::MqAndScheduler),
            implementation_plan: get(Step::Database),
            langchain_integration: get(Step::LlmIntegration),
            metadata: ArchitectureMetadata {
                analysis_method: "seven_step_llm_synthesis".to_string(),
                framework: "doc_architect".to_string(),
                tech_stack: vec![],
                compliance: vec![],
                design_principles: vec![],
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_handles_fenced_code_blocks() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(extract_json(text), Some(json!({"a": 1})));
    }

    #[test]
    fn extract_json_handles_bare_fence() {
        let text = "```\n{\"a\": 2}\n```";
        assert_eq!(extract_json(text), Some(json!({"a": 2})));
    }

    #[test]
    fn extract_json_handles_surrounding_prose() {
        let text = "sure, {\"a\": 3} is the result";
        assert_eq!(extract_json(text), Some(json!({"a": 3})));
    }

    #[test]
    fn extract_json_returns_none_for_malformed_text() {
        assert_eq!(extract_json("not json at all"), None);
    }

    #[test]
    fn validate_tolerates_additive_fields() {
        let value = json!({
            "functional_requirements": [],
            "non_functional_requirements": [],
            "business_entities": [],
            "user_stories": [],
            "complexity_assessment": "low",
            "extra_field_from_the_future": true,
        });
        assert!(validate(Step::Requirements, &value).is_ok());
    }

    #[test]
    fn validate_rejects_missing_required_field() {
        let value = json!({"functional_requirements": []});
        assert!(validate(Step::Requirements, &value).is_err());
    }

    #[tokio::test]
    async fn malformed_json_fails_after_exactly_one_reprompt() {
        use crate::llm::mock::ScriptedLlmClient;
        let client = ScriptedLlmClient::always("not json, ever".to_string());
        let planner = AiArchitectPlanner::new(&client, ArchitectConfig::default());
        let memory = PlannerMemory::default();
        let err = planner.run_step(Step::Requirements, &memory).await.unwrap_err();
        assert!(matches!(err, PipelineError::LlmSchema(_)));
    }
}
