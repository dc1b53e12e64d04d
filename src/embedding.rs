//! Adaptador de embeddings: único punto de contacto con el modelo externo.
//!
//! La ingesta y las consultas comparten la misma instancia de
//! `EmbeddingAdapter`; mezclar modelos degrada la recuperación sin error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use crate::error::{RagError, Result};
use crate::models::EmbeddingVector;

/// Modelo de embeddings externo.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Calcula un vector por texto, en el mismo orden.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>>;

    /// Dimensión declarada por el modelo.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy)]
pub struct EmbeddingOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self { batch_size: 16, concurrency: 4, timeout: Duration::from_secs(30) }
    }
}

#[derive(Clone)]
pub struct EmbeddingAdapter {
    inner: Arc<dyn Embedder>,
    options: EmbeddingOptions,
}

impl EmbeddingAdapter {
    pub fn new(inner: Arc<dyn Embedder>, options: EmbeddingOptions) -> Self {
        Self { inner, options }
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    pub async fn embed(&self, text: &str) -> Result<EmbeddingVector> {
        let mut vectors = self.call(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::permanent("embeddings", "el modelo no devolvió ningún vector"))
    }

    /// Embeddings de varios textos, uno a uno y en orden. Los lotes se envían
    /// en paralelo hasta `concurrency` a la vez.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batch_size = self.options.batch_size.max(1);
        let batches: Vec<Vec<String>> = texts.chunks(batch_size).map(|b| b.to_vec()).collect();
        debug!(texts = texts.len(), batches = batches.len(), "Calculando embeddings");

        let per_batch: Vec<Vec<EmbeddingVector>> = stream::iter(batches)
            .map(|batch| self.call(batch))
            .buffered(self.options.concurrency.max(1))
            .try_collect()
            .await?;

        Ok(per_batch.into_iter().flatten().collect())
    }

    async fn call(&self, texts: Vec<String>) -> Result<Vec<EmbeddingVector>> {
        let expected = texts.len();
        let vectors = tokio::time::timeout(self.options.timeout, self.inner.embed_batch(&texts))
            .await
            .map_err(|_| {
                RagError::transient(
                    "embeddings",
                    format!("sin respuesta tras {:?}", self.options.timeout),
                )
            })??;

        if vectors.len() != expected {
            return Err(RagError::permanent(
                "embeddings",
                format!(
                    "número de embeddings ({}) distinto al número de textos ({expected})",
                    vectors.len()
                ),
            ));
        }
        let dimension = self.inner.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(RagError::ConfigurationConflict {
                collection: self.inner.model_name().to_string(),
                message: format!(
                    "el modelo declaró dimensión {dimension} pero devolvió un vector de {}",
                    bad.len()
                ),
            });
        }
        Ok(vectors)
    }
}
