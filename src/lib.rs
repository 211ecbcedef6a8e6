//! # Document Analysis & Architecture Design Pipeline
//!
//! A three-stage resumable pipeline that takes an uploaded document, extracts and
//! summarizes its content, analyzes changes and business intent chunk by chunk, and
//! finally drives an LLM through a fixed sequence of architecture-planning steps to
//! produce a structured design document.
//!
//! ## Architecture Overview
//!
//! - **[`extract`]**: Pluggable text/structure extraction from uploaded files (C2)
//! - **[`parser`]**: Document Parser stage: keyword extraction, clustering, summarization (C3)
//! - **[`analyzer`]**: Content Analyzer stage: chunked change/CRUD/business analysis (C4)
//! - **[`architect`]**: AI Architect Planner stage: multi-step LLM-driven design synthesis (C5)
//! - **[`orchestrator`]**: Stage Orchestrator: sequencing, timeouts, resumability (C6)
//! - **[`kv`]**: KV Store Adapter used for all cross-stage persistence (C1)
//! - **[`registry`]**: Task Registry & Progress Hub (C7)
//! - **[`binder`]**: Session Binder routing progress events to live subscribers (C8)
//! - **[`llm`]**: Provider-agnostic LLM client with retry/backoff/circuit-breaking
//! - **[`model`]**: Task and stage state types shared across every component
//! - **[`config`]**: Layered runtime configuration and discovery
//! - **[`error`]**: Crate-wide error taxonomy

pub mod analyzer;
pub mod architect;
pub mod binder;
pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod extract;
pub mod kv;
pub mod llm;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod registry;

pub use binder::SessionBinder;
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use kv::{DashMapKvStore, KvStore};
pub use llm::{HttpLlmClient, LlmClient};
pub use model::{ExecutionMode, OverallStatus, StageName, Task};
pub use orchestrator::StageOrchestrator;
pub use registry::TaskRegistry;
