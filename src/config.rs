//! Layered configuration.
//!
//! Discovery order: an explicit `--config` override, then `./doc-architect.toml`, then
//! `~/.doc-architect/config.toml`, then built-in defaults. Every sub-config implements
//! `Default` so a zero-config run gets sensible values without a config file anywhere.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Top-level configuration for one pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub architect: ArchitectConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Default TTL for a task's keys, refreshed on every write. Seconds.
    pub default_ttl_secs: u64,
    /// Interval between expiry sweeps of the in-process store.
    pub sweep_interval_secs: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Bounded worker pool size for concurrent chunk analysis.
    pub chunk_concurrency: usize,
    /// Number of retrieved chunks per analyzed chunk.
    pub top_k: usize,
    /// Per-chunk retry budget.
    pub max_chunk_retries: u32,
    /// Fraction of chunks that may fail before the stage itself fails.
    pub max_chunk_failure_ratio: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            chunk_concurrency: 4,
            top_k: 5,
            max_chunk_retries: 3,
            max_chunk_failure_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectConfig {
    /// Retry budget per LLM-backed planning step.
    pub max_step_retries: u32,
    /// Maximum tokens requested per step.
    pub max_tokens_per_step: u32,
}

impl Default for ArchitectConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 3,
            max_tokens_per_step: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Global concurrency cap across all in-flight LLM calls.
    pub max_concurrent_calls: usize,
    /// Per-call timeout, seconds.
    pub call_timeout_secs: u64,
    /// Exponential backoff base, seconds.
    pub backoff_base_secs: u64,
    /// Exponential backoff cap, seconds.
    pub backoff_cap_secs: u64,
    /// Base URL for the default HTTP LLM client. Unset disables `HttpLlmClient`.
    pub base_url: Option<String>,
    /// Bearer token for the default HTTP LLM client.
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 16,
            call_timeout_secs: 90,
            backoff_base_secs: 2,
            backoff_cap_secs: 8,
            base_url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub document_parsing_secs: u64,
    pub content_analysis_secs: u64,
    pub ai_analysis_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            document_parsing_secs: 120,
            content_analysis_secs: 600,
            ai_analysis_secs: 900,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Discovers a config file using the documented hierarchy, falling back to defaults.
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    pub fn discover() -> anyhow::Result<PipelineConfig> {
        if let Some(path) = Self::find_config_file() {
            info!("loading configuration from {:?}", path);
            return PipelineConfig::from_toml_file(path);
        }
        info!("no configuration file found, using defaults");
        Ok(PipelineConfig::default())
    }

    fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::candidates() {
            debug!("checking for config file: {:?}", candidate);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    fn candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join("doc-architect.toml"));
        }
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".doc-architect/config.toml"));
        }
        candidates
    }
}
