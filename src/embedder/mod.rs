//! Text-to-vector gateway.
//!
//! Providers only turn a prompt into raw floats. [`EmbeddingGateway`] owns the
//! parts that must be identical for documents and queries: the prompt prefix
//! and reconciliation to the configured dimensionality.

pub mod ollama;

use thiserror::Error;
use tracing::{debug, warn};

pub use ollama::OllamaEmbedder;

/// Prefix nomic-style models expect in front of retrieval documents.
pub const DEFAULT_DOCUMENT_PREFIX: &str = "search_document: ";

/// Failures surfaced by embedding calls. None of them are retried.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Transport failure, timeout, non-success status, or an error payload.
    #[error("embedding provider error: {0}")]
    Provider(String),
    /// The provider returned fewer dimensions than configured.
    #[error("embedding dimension mismatch: expected {expected}, provider returned {actual}")]
    DimensionMismatch {
        /// Configured dimensionality.
        expected: usize,
        /// Length of the vector the provider returned.
        actual: usize,
    },
}

/// Something that can embed a single prompt.
#[allow(async_fn_in_trait)]
pub trait EmbeddingProvider {
    /// Model identifier recorded next to stored vectors.
    fn model(&self) -> &str;

    /// Embeds `prompt` exactly as given.
    async fn embed(&self, prompt: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Prefixing and dimension-reconciling front for a provider.
pub struct EmbeddingGateway<P> {
    provider: P,
    dimensions: usize,
    prefix: String,
}

impl<P: EmbeddingProvider> EmbeddingGateway<P> {
    /// Wraps `provider`, keeping `dimensions` values from every vector.
    pub fn new(provider: P, dimensions: usize, prefix: impl Into<String>) -> Self {
        Self {
            provider,
            dimensions,
            prefix: prefix.into(),
        }
    }

    /// Configured dimensionality.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Model identifier of the wrapped provider.
    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Embeds one text. Queries and documents go through the same prefix so
    /// they land in the same space.
    pub async fn create_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let prompt = format!("{}{}", self.prefix, text);
        debug!(chars = prompt.len(), model = self.model(), "requesting embedding");
        let raw = self.provider.embed(&prompt).await?;
        reconcile_dimensions(raw, self.dimensions)
    }

    /// Embeds each non-blank text in turn, returning `(input index, vector)` pairs.
    /// Blank inputs are skipped; the first provider error aborts the batch.
    pub async fn create_embeddings_batch<S: AsRef<str>>(
        &self,
        texts: &[S],
    ) -> Result<Vec<(usize, Vec<f32>)>, EmbeddingError> {
        let mut embedded = Vec::with_capacity(texts.len());
        for (index, text) in texts.iter().enumerate() {
            let text = text.as_ref();
            if text.trim().is_empty() {
                warn!(index, "skipping blank text in embedding batch");
                continue;
            }
            embedded.push((index, self.create_embedding(text).await?));
        }
        Ok(embedded)
    }
}

/// Truncates longer vectors to `expected` values (Matryoshka-style) and
/// rejects shorter ones. Vectors are never padded.
pub fn reconcile_dimensions(mut vector: Vec<f32>, expected: usize) -> Result<Vec<f32>, EmbeddingError> {
    match vector.len() {
        actual if actual < expected => Err(EmbeddingError::DimensionMismatch { expected, actual }),
        actual => {
            if actual > expected {
                debug!(actual, expected, "truncating embedding");
                vector.truncate(expected);
            }
            Ok(vector)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "current_thread")]
    async fn prefixes_prompts_for_documents_and_queries() {
        let provider = ScriptedProvider::default().with("search_document: hello", vec![0.5, 0.5]);
        let gateway = EmbeddingGateway::new(provider, 2, DEFAULT_DOCUMENT_PREFIX);

        let vector = gateway.create_embedding("hello").await.expect("embedding");
        assert_eq!(vector, vec![0.5, 0.5]);
        assert_eq!(
            gateway.provider.prompts.borrow().as_slice(),
            ["search_document: hello".to_string()]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn longer_vectors_keep_leading_dimensions() {
        let raw: Vec<f32> = (0..1024).map(|i| i as f32).collect();
        let provider = ScriptedProvider::default().fallback(raw.clone());
        let gateway = EmbeddingGateway::new(provider, 512, DEFAULT_DOCUMENT_PREFIX);

        let vector = gateway.create_embedding("long").await.expect("embedding");
        assert_eq!(vector.len(), 512);
        assert_eq!(&vector[..], &raw[..512]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shorter_vectors_are_rejected() {
        let provider = ScriptedProvider::default().fallback(vec![1.0; 384]);
        let gateway = EmbeddingGateway::new(provider, 512, DEFAULT_DOCUMENT_PREFIX);

        match gateway.create_embedding("short").await {
            Err(EmbeddingError::DimensionMismatch { expected, actual }) => {
                assert_eq!((expected, actual), (512, 384));
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn batch_skips_blank_inputs_and_keeps_indices() {
        let provider = ScriptedProvider::default().fallback(vec![1.0, 0.0]);
        let gateway = EmbeddingGateway::new(provider, 2, DEFAULT_DOCUMENT_PREFIX);

        let embedded = gateway
            .create_embeddings_batch(&["first", "   ", "", "fourth"])
            .await
            .expect("batch");
        let indices: Vec<_> = embedded.iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, vec![0, 3]);
        assert_eq!(gateway.provider.prompts.borrow().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn provider_errors_surface_unchanged() {
        let gateway = EmbeddingGateway::new(ScriptedProvider::default(), 2, "");
        let err = gateway.create_embedding("anything").await.expect_err("no script");
        assert!(matches!(err, EmbeddingError::Provider(_)));
    }
}
