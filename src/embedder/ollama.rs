//! Ollama embedding client implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{EmbeddingError, EmbeddingProvider};
use crate::config::EmbeddingConfig;

/// Async client for Ollama's `/api/embeddings` endpoint.
#[derive(Clone)]
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    context_window: usize,
    timeout: Duration,
}

impl OllamaEmbedder {
    /// Builds a new Ollama embeddings client.
    pub fn new(
        base_url: &str,
        model: String,
        context_window: usize,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!model.trim().is_empty(), "missing Ollama model name");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Ollama HTTP client")?;
        let endpoint = format!("{}/api/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            context_window,
            timeout,
        })
    }

    /// Builds a client from validated configuration.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Self::new(
            config.base_url(),
            config.model().to_string(),
            config.context_window(),
            config.timeout(),
        )
    }

    /// Full URL requests are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, err: reqwest::Error) -> EmbeddingError {
        if err.is_timeout() {
            EmbeddingError::Provider(format!(
                "Ollama request timed out after {}s",
                self.timeout.as_secs()
            ))
        } else if err.is_connect() {
            EmbeddingError::Provider(format!(
                "could not connect to Ollama at {}: {err}",
                self.endpoint
            ))
        } else {
            EmbeddingError::Provider(format!("Ollama request failed: {err}"))
        }
    }
}

impl EmbeddingProvider for OllamaEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = EmbeddingRequest {
            model: &self.model,
            prompt,
            options: RequestOptions {
                num_ctx: self.context_window,
            },
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::Provider(format!(
                "Ollama embeddings request failed ({status}): {body}"
            )));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|err| {
            EmbeddingError::Provider(format!("failed to parse Ollama embedding response: {err}"))
        })?;
        parsed.into_vector()
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: RequestOptions,
}

#[derive(Serialize)]
struct RequestOptions {
    num_ctx: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    error: Option<String>,
}

impl EmbeddingResponse {
    fn into_vector(self) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(error) = self.error {
            return Err(EmbeddingError::Provider(format!("Ollama API error: {error}")));
        }
        if self.embedding.is_empty() {
            return Err(EmbeddingError::Provider(
                "Ollama returned an empty embedding".to_string(),
            ));
        }
        Ok(self.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_body_matches_ollama_shape() {
        let request = EmbeddingRequest {
            model: "nomic-embed-text",
            prompt: "search_document: hi",
            options: RequestOptions { num_ctx: 8192 },
        };
        assert_eq!(
            serde_json::to_value(&request).expect("serialize"),
            json!({"model": "nomic-embed-text", "prompt": "search_document: hi", "options": {"num_ctx": 8192}})
        );
    }

    #[test]
    fn error_payloads_become_provider_errors() {
        let parsed: EmbeddingResponse =
            serde_json::from_value(json!({"error": "model \"nope\" not found"})).expect("parse");
        let err = parsed.into_vector().expect_err("error payload");
        assert!(err.to_string().contains("not found"));

        let empty: EmbeddingResponse = serde_json::from_value(json!({"embedding": []})).expect("parse");
        assert!(matches!(empty.into_vector(), Err(EmbeddingError::Provider(_))));
    }

    #[test]
    fn successful_payload_yields_vector() {
        let parsed: EmbeddingResponse =
            serde_json::from_value(json!({"embedding": [0.25, -0.5, 1.0]})).expect("parse");
        assert_eq!(parsed.into_vector().expect("vector"), vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let embedder = OllamaEmbedder::new(
            "http://localhost:11434/",
            "nomic-embed-text".to_string(),
            8192,
            Duration::from_secs(30),
        )
        .expect("client");
        assert_eq!(embedder.endpoint(), "http://localhost:11434/api/embeddings");
        assert!(OllamaEmbedder::new("http://x", " ".to_string(), 1, Duration::from_secs(1)).is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unreachable_server_is_a_provider_error() {
        let embedder = OllamaEmbedder::new(
            "http://127.0.0.1:9",
            "nomic-embed-text".to_string(),
            8192,
            Duration::from_secs(2),
        )
        .expect("client");
        let err = embedder.embed("hello").await.expect_err("nothing listens on port 9");
        assert!(matches!(err, EmbeddingError::Provider(_)));
    }
}
