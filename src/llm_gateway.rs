//! Model selection, transport, caching, and per-endpoint concurrency
//! control. Endpoints are reached through a provider-agnostic
//! `LlmEndpoint` trait and gated by a per-endpoint `Semaphore`; responses
//! are cached by request fingerprint with a time-based expiry.

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub no_cache: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            no_cache: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub reasoning: Option<String>,
    pub tokens: TokenUsage,
    pub latency_ms: u64,
    pub server_id: String,
}

#[derive(Debug, Clone)]
pub enum LlmError {
    NoModelAvailable,
    TransportFailed(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::NoModelAvailable => write!(f, "no healthy model available"),
            LlmError::TransportFailed(msg) => write!(f, "llm transport failed: {msg}"),
        }
    }
}

impl std::error::Error for LlmError {}

/// A reachable LLM endpoint. One concrete implementation (`HttpEndpoint`)
/// is provided; callers may supply their own for tests or alternate
/// transports.
#[async_trait]
pub trait LlmEndpoint: Send + Sync {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        history: &[(String, String)],
        options: &GenerateOptions,
    ) -> Result<GenerateResponse, LlmError>;

    async fn health_check(&self) -> bool;

    fn server_id(&self) -> &str;
}

/// Default transport: POSTs a JSON payload to a local LLM HTTP endpoint.
pub struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
    model: String,
    server_id: String,
}

impl HttpEndpoint {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            client: reqwest::Client::new(),
            server_id: url.clone(),
            url,
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct HttpGenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    user: &'a str,
    history: &'a [(String, String)],
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct HttpGenerateResponse {
    text: String,
    reasoning: Option<String>,
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl LlmEndpoint for HttpEndpoint {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        history: &[(String, String)],
        options: &GenerateOptions,
    ) -> Result<GenerateResponse, LlmError> {
        let start = Instant::now();
        let payload = HttpGenerateRequest {
            model: &self.model,
            system,
            user,
            history,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::TransportFailed(e.to_string()))?;

        let parsed: HttpGenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::TransportFailed(e.to_string()))?;

        Ok(GenerateResponse {
            text: parsed.text,
            reasoning: parsed.reasoning,
            tokens: TokenUsage {
                prompt_tokens: parsed.prompt_tokens,
                completion_tokens: parsed.completion_tokens,
            },
            latency_ms: start.elapsed().as_millis() as u64,
            server_id: self.server_id.clone(),
        })
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(&self.url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

struct CacheEntry {
    response: GenerateResponse,
    inserted_at: Instant,
}

struct TrackedEndpoint {
    endpoint: Arc<dyn LlmEndpoint>,
    semaphore: Arc<Semaphore>,
    healthy: Mutex<bool>,
}

/// Selects an endpoint, transports the prompt, and records metrics.
/// Caches read-through (non-mutating) calls by fingerprint with a TTL, and
/// caps per-endpoint concurrency with a fair FIFO semaphore.
pub struct LlmGateway {
    endpoints: Vec<TrackedEndpoint>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
}

impl LlmGateway {
    pub fn new(endpoints: Vec<(Arc<dyn LlmEndpoint>, usize)>, cache_ttl: Duration) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|(endpoint, max_concurrent)| TrackedEndpoint {
                endpoint,
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                healthy: Mutex::new(true),
            })
            .collect();
        Self {
            endpoints,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Run health checks against every endpoint, updating the healthy flag
    /// used by `generate`'s endpoint-skip logic. Intended to run once before
    /// first use and on an N-minute timer.
    pub async fn refresh_health(&self) {
        for tracked in &self.endpoints {
            let healthy = tracked.endpoint.health_check().await;
            *tracked.healthy.lock().await = healthy;
            if !healthy {
                warn!("endpoint {} failed health check", tracked.endpoint.server_id());
            }
        }
    }

    fn fingerprint(model_ref: &str, system: &str, user: &str, history: &[(String, String)]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model_ref.as_bytes());
        hasher.update(system.as_bytes());
        hasher.update(user.as_bytes());
        for (role, content) in history {
            hasher.update(role.as_bytes());
            hasher.update(content.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Transport the prompt to the first healthy endpoint, trying
    /// substitutes in order before surfacing `NoModelAvailable`.
    pub async fn generate(
        &self,
        model_ref: &str,
        system: &str,
        user: &str,
        history: &[(String, String)],
        options: GenerateOptions,
    ) -> Result<GenerateResponse, LlmError> {
        let fingerprint = Self::fingerprint(model_ref, system, user, history);

        if !options.no_cache {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&fingerprint) {
                if entry.inserted_at.elapsed() < self.cache_ttl {
                    debug!("llm cache hit for fingerprint {fingerprint}");
                    return Ok(entry.response.clone());
                }
            }
        }

        let mut last_err = LlmError::NoModelAvailable;
        for tracked in &self.endpoints {
            if !*tracked.healthy.lock().await {
                continue;
            }
            let _permit = tracked
                .semaphore
                .acquire()
                .await
                .expect("semaphore never closes");

            match tracked
                .endpoint
                .generate(system, user, history, &options)
                .await
            {
                Ok(response) => {
                    if !options.no_cache {
                        let mut cache = self.cache.lock().await;
                        cache.insert(
                            fingerprint.clone(),
                            CacheEntry {
                                response: response.clone(),
                                inserted_at: Instant::now(),
                            },
                        );
                    }
                    return Ok(response);
                }
                Err(err) => {
                    warn!("endpoint {} generate failed: {err}", tracked.endpoint.server_id());
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }
}
