//! Provider-agnostic LLM client.
//!
//! The contract is deliberately narrow: `call(system_prompt, user_prompt, max_tokens, timeout)
//! -> text`, so the rest of the pipeline never depends on a specific provider. [`HttpLlmClient`]
//! is the one concrete implementation this crate ships; anything else (a CLI-subprocess-backed
//! provider, a direct SDK integration) only needs to implement [`LlmClient`].

pub mod retry;

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::retry::{CircuitBreaker, ConcurrencyLimiter};

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Object-safe client trait, implemented by anything capable of turning a prompt into text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, LlmError>;
}

/// Default implementation: a single HTTP POST against a configured endpoint, guarded by a
/// global concurrency cap and a circuit breaker shared across every call this client makes.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: url::Url,
    api_key: String,
    limiter: ConcurrencyLimiter,
    breaker: CircuitBreaker,
}

#[derive(serde::Serialize)]
struct HttpLlmRequestBody<'a> {
    system_prompt: &'a str,
    user_prompt: &'a str,
    max_tokens: u32,
}

#[derive(serde::Deserialize)]
struct HttpLlmResponseBody {
    text: String,
}

impl HttpLlmClient {
    pub fn new(base_url: &str, api_key: String) -> Result<Self, LlmError> {
        Self::with_config(base_url, api_key, &LlmConfig::default())
    }

    pub fn with_config(base_url: &str, api_key: String, config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url =
            url::Url::parse(base_url).map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            limiter: ConcurrencyLimiter::new(config.max_concurrent_calls),
            breaker: CircuitBreaker::new(5, Duration::from_secs(config.backoff_cap_secs * 4)),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        if !self.breaker.can_proceed(now_epoch_ms()) {
            return Err(LlmError::ProviderUnavailable(
                "circuit breaker open after repeated failures".to_string(),
            ));
        }
        let _permit = self.limiter.acquire().await;

        let result = self.call_once(system_prompt, user_prompt, max_tokens, timeout).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.is_retriable() => {
                self.breaker.record_failure(now_epoch_ms());
                warn!(error = %e, "LLM call failed");
            }
            Err(_) => {}
        }
        result
    }
}

impl HttpLlmClient {
    async fn call_once(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let body = HttpLlmRequestBody {
            system_prompt,
            user_prompt,
            max_tokens,
        };
        let response = self
            .http
            .post(self.base_url.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(timeout.as_secs())
                } else {
                    LlmError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimit {
                message: "provider returned 429".to_string(),
                retry_after_secs: 8,
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(LlmError::Authentication(format!("provider returned {status}")));
        }
        if !status.is_success() {
            return Err(LlmError::ProviderUnavailable(format!(
                "provider returned {status}"
            )));
        }

        let parsed: HttpLlmResponseBody = response
            .json()
            .await
            .map_err(|e| LlmError::ProviderUnavailable(e.to_string()))?;
        Ok(parsed.text)
    }
}

/// Deterministic test double: returns a scripted sequence of responses per call, cycling
/// through failures before succeeding.
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    pub struct ScriptedLlmClient {
        script: Mutex<Vec<Result<String, LlmError>>>,
    }

    impl ScriptedLlmClient {
        pub fn new(script: Vec<Result<String, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }

        pub fn always(text: impl Into<String>) -> Self {
            Self::new(vec![Ok(text.into())])
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlmClient {
        async fn call(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _max_tokens: u32,
            _timeout: Duration,
        ) -> Result<String, LlmError> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }
}
