use crate::config::ProvidersConfig;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_PROBE_TTL: Duration = Duration::from_secs(30);
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_RECOVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {provider} request failed")]
    Request {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("provider {provider} rate limited us, retry in {retry_after_secs}s")]
    RateLimited {
        provider: &'static str,
        retry_after_secs: u64,
    },

    #[error("provider {provider} returned a response we couldn't understand")]
    BadResponse {
        provider: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("provider {provider} circuit breaker is open")]
    BreakerOpen { provider: &'static str },

    #[error("provider {provider} failed its health probe")]
    Unhealthy { provider: &'static str },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Request { .. }
                | ProviderError::BreakerOpen { .. }
                | ProviderError::Unhealthy { .. }
        )
    }
}

/// Classic circuit breaker: after enough consecutive failures the circuit
/// opens, and all calls short-circuit until the recovery window elapses.
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    provider: &'static str,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(provider: &'static str) -> Self {
        CircuitBreaker {
            provider,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn check(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        if let Some(opened_at) = state.opened_at {
            if opened_at.elapsed() < BREAKER_RECOVERY {
                return Err(ProviderError::BreakerOpen {
                    provider: self.provider,
                });
            }
            // Half-open: allow one probe call through.
            state.opened_at = None;
            state.consecutive_failures = BREAKER_FAILURE_THRESHOLD - 1;
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        state.consecutive_failures += 1;
        if state.consecutive_failures >= BREAKER_FAILURE_THRESHOLD && state.opened_at.is_none() {
            warn!("Circuit breaker for {} opened", self.provider);
            state.opened_at = Some(Instant::now());
        }
    }
}

fn classify(provider: &'static str, response: &reqwest::Response) -> Option<ProviderError> {
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        return Some(ProviderError::RateLimited {
            provider,
            retry_after_secs,
        });
    }
    None
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VisionResult {
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub ocr_text: Option<String>,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Deserialize)]
struct TagsBody {
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingBody {
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct CrawlBody {
    #[serde(default)]
    pages: Vec<serde_json::Value>,
}

/// Thin clients for every external AI/graph collaborator. Internals of the
/// vendors are deliberately not modeled here; each call is one POST with a
/// typed response, a circuit breaker, and a shared timeout.
pub struct Providers {
    client: reqwest::Client,
    config: ProvidersConfig,
    pub tagging_breaker: CircuitBreaker,
    pub vision_breaker: CircuitBreaker,
    pub ocr_breaker: CircuitBreaker,
    pub embedding_breaker: CircuitBreaker,
    pub graph_breaker: CircuitBreaker,
    pub crawl_breaker: CircuitBreaker,
    pub digest_breaker: CircuitBreaker,
    /// Cached embedding-service health probe: (checked_at, healthy).
    embedding_health: Mutex<Option<(Instant, bool)>>,
}

impl Providers {
    pub fn new(config: ProvidersConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .expect("reqwest client construction only fails on malformed TLS config");
        Providers {
            client,
            config,
            tagging_breaker: CircuitBreaker::new("tagging"),
            vision_breaker: CircuitBreaker::new("vision"),
            ocr_breaker: CircuitBreaker::new("ocr"),
            embedding_breaker: CircuitBreaker::new("embedding"),
            graph_breaker: CircuitBreaker::new("graph"),
            crawl_breaker: CircuitBreaker::new("crawl"),
            digest_breaker: CircuitBreaker::new("digest"),
            embedding_health: Mutex::new(None),
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        provider: &'static str,
        breaker: &CircuitBreaker,
        url: String,
        body: serde_json::Value,
    ) -> Result<T, ProviderError> {
        breaker.check()?;

        let result = self.client.post(&url).json(&body).send().await;
        let response = match result {
            Ok(response) => response,
            Err(source) => {
                breaker.record_failure();
                return Err(ProviderError::Request { provider, source });
            }
        };

        if let Some(err) = classify(provider, &response) {
            // Rate limiting is the provider protecting itself, not failing.
            return Err(err);
        }

        let response = match response.error_for_status() {
            Ok(response) => response,
            Err(source) => {
                breaker.record_failure();
                return Err(ProviderError::Request { provider, source });
            }
        };

        let text = response.text().await.map_err(|source| {
            breaker.record_failure();
            ProviderError::Request { provider, source }
        })?;

        match serde_json::from_str(&text) {
            Ok(parsed) => {
                breaker.record_success();
                Ok(parsed)
            }
            Err(source) => {
                // A well-formed HTTP response with a wrong body is a schema
                // problem, not an availability problem; don't trip the
                // breaker for it.
                Err(ProviderError::BadResponse { provider, source })
            }
        }
    }

    /// Tagging. The response is normalized to lowercase flat strings here so
    /// no consumer ever sees provider casing.
    pub async fn tag(&self, content: &str) -> Result<Vec<String>, ProviderError> {
        let body: TagsBody = self
            .post_json(
                "tagging",
                &self.tagging_breaker,
                format!("{}/v1/tags", self.config.tagging_url),
                json!({ "model": self.config.tagging_model, "text": content }),
            )
            .await?;
        Ok(body
            .tags
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect())
    }

    pub async fn analyze_image(&self, image: &[u8], mime: &str) -> Result<VisionResult, ProviderError> {
        let mut result: VisionResult = self
            .post_json(
                "vision",
                &self.vision_breaker,
                format!("{}/v1/analyze", self.config.vision_url),
                json!({
                    "model": self.config.vision_model,
                    "mime": mime,
                    "image_b64": BASE64.encode(image),
                }),
            )
            .await?;
        result.provider = "vision".into();
        result.model = self.config.vision_model.clone();
        Ok(result)
    }

    /// OCR fallback for when the vision provider is down or refuses the
    /// image.
    pub async fn ocr_image(&self, image: &[u8], mime: &str) -> Result<VisionResult, ProviderError> {
        #[derive(Deserialize)]
        struct OcrBody {
            text: String,
        }

        let body: OcrBody = self
            .post_json(
                "ocr",
                &self.ocr_breaker,
                format!("{}/v1/ocr", self.config.ocr_url),
                json!({ "mime": mime, "image_b64": BASE64.encode(image) }),
            )
            .await?;
        Ok(VisionResult {
            description: String::new(),
            labels: Vec::new(),
            ocr_text: Some(body.text),
            provider: "ocr".into(),
            model: "ocr".into(),
        })
    }

    /// Health probe against the embedding service's models listing, cached
    /// for a short TTL so a hot loop doesn't hammer it.
    pub async fn embedding_healthy(&self) -> bool {
        {
            let cached = self.embedding_health.lock().expect("health mutex poisoned");
            if let Some((checked_at, healthy)) = *cached {
                if checked_at.elapsed() < HEALTH_PROBE_TTL {
                    return healthy;
                }
            }
        }

        let url = format!("{}/v1/models", self.config.embedding_url);
        let healthy = match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("Embedding health probe failed: {err}");
                false
            }
        };

        let mut cached = self.embedding_health.lock().expect("health mutex poisoned");
        *cached = Some((Instant::now(), healthy));
        healthy
    }

    pub async fn embed(&self, content: &str) -> Result<Vec<f64>, ProviderError> {
        if !self.embedding_healthy().await {
            return Err(ProviderError::Unhealthy {
                provider: "embedding",
            });
        }
        let body: EmbeddingBody = self
            .post_json(
                "embedding",
                &self.embedding_breaker,
                format!("{}/v1/embeddings", self.config.embedding_url),
                json!({ "model": self.config.embedding_model, "input": content }),
            )
            .await?;
        Ok(body.embedding)
    }

    /// Upserts one post's vector into the vector store. The store keys on
    /// post id, so replays overwrite rather than duplicate.
    pub async fn index_vector(
        &self,
        post_id: Uuid,
        embedding: &[f64],
        payload: serde_json::Value,
    ) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .post_json(
                "embedding",
                &self.embedding_breaker,
                format!("{}/v1/points/upsert", self.config.embedding_url),
                json!({ "id": post_id, "vector": embedding, "payload": payload }),
            )
            .await?;
        Ok(())
    }

    /// Runs one idempotent MERGE statement against the graph store. Every
    /// statement is parameterized; nothing is ever interpolated into the
    /// query text.
    pub async fn graph_merge(
        &self,
        statement: &str,
        params: serde_json::Value,
    ) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .post_json(
                "graph",
                &self.graph_breaker,
                format!("{}/v1/cypher", self.config.graph_url),
                json!({ "statement": statement, "params": params }),
            )
            .await?;
        Ok(())
    }

    pub async fn crawl(&self, urls: &[String]) -> Result<serde_json::Value, ProviderError> {
        let body: CrawlBody = self
            .post_json(
                "crawl",
                &self.crawl_breaker,
                format!("{}/v1/crawl", self.config.crawl_url),
                json!({ "urls": urls }),
            )
            .await?;
        Ok(json!({ "pages": body.pages }))
    }

    pub async fn generate_digest(
        &self,
        user_id: Uuid,
        posts: &[serde_json::Value],
    ) -> Result<String, ProviderError> {
        #[derive(Deserialize)]
        struct DigestBody {
            digest_id: String,
        }

        let body: DigestBody = self
            .post_json(
                "digest",
                &self.digest_breaker,
                format!("{}/v1/digests", self.config.digest_url),
                json!({ "user_id": user_id, "posts": posts }),
            )
            .await?;
        Ok(body.digest_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_and_recovers_half_open() {
        let breaker = CircuitBreaker::new("test");
        assert!(breaker.check().is_ok());

        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        assert!(matches!(
            breaker.check(),
            Err(ProviderError::BreakerOpen { .. })
        ));

        // Success resets everything.
        breaker.record_success();
        assert!(breaker.check().is_ok());
    }
}
