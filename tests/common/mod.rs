#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rag_ingest_queue::{
    chunker::ChunkerConfig,
    config::PipelineConfig,
    embedding::{Embedder, EmbeddingAdapter},
    error::{RagError, Result},
    inmemory::InMemoryVectorIndex,
    llm::ChatModel,
    loader::DocumentLoader,
    models::{CollectionSpec, Document, EmbeddingVector, IndexPoint, SearchHit},
    retry::RetryPolicy,
    vector_store::{EnsureOutcome, UpsertReport, VectorIndex},
};

pub const INSUFFICIENT: &str = "No tengo información suficiente para responder a esa pregunta.";

/// Configuración pequeña y sin esperas largas entre reintentos.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        collection: "test_chunks".to_string(),
        chunker: ChunkerConfig::new(40, 10).unwrap(),
        top_k: 3,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        model_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    }
}

pub fn adapter(embedder: Arc<dyn Embedder>) -> EmbeddingAdapter {
    EmbeddingAdapter::new(embedder, test_config().embedding)
}

/// Embedding determinista: histograma de caracteres. Textos iguales dan
/// vectores iguales y textos parecidos quedan cerca.
pub struct FakeEmbedder {
    dimension: usize,
    transient_failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, transient_failures: AtomicUsize::new(0), calls: AtomicUsize::new(0) }
    }

    /// Las primeras `n` llamadas fallan con un error transitorio.
    pub fn failing_first(dimension: usize, n: usize) -> Self {
        Self { dimension, transient_failures: AtomicUsize::new(n), calls: AtomicUsize::new(0) }
    }

    pub fn vector_for(&self, text: &str) -> EmbeddingVector {
        let mut v = vec![0.001; self.dimension];
        for c in text.chars() {
            v[c as usize % self.dimension] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(RagError::transient("embeddings", "429 rate limit"));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "fake-embedding"
    }
}

/// Modelo de chat que declina cuando no hay contexto y, si lo hay, devuelve
/// el primer fragmento. Guarda los mensajes recibidos.
#[derive(Default)]
pub struct FakeChat {
    pub messages: Mutex<Vec<String>>,
}

#[async_trait]
impl ChatModel for FakeChat {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String> {
        assert!(!system_prompt.trim().is_empty());
        self.messages.lock().unwrap().push(user_message.to_string());
        if user_message.contains("(sin contexto disponible)") {
            return Ok(INSUFFICIENT.to_string());
        }
        let context = user_message
            .trim_start_matches("Contexto:\n")
            .split("\n\n---\n\n")
            .next()
            .unwrap_or_default();
        Ok(format!("Según el contexto: {context}"))
    }
}

/// Modelo de chat que siempre falla de forma permanente.
pub struct BrokenChat;

#[async_trait]
impl ChatModel for BrokenChat {
    async fn complete(&self, _: &str, _: &str) -> Result<String> {
        Err(RagError::permanent("chat", "invalid_api_key"))
    }
}

/// Loader en memoria. Las rutas marcadas como corruptas dan
/// `MalformedDocument`; las desconocidas, `NotFound`.
#[derive(Default)]
pub struct FakeLoader {
    documents: HashMap<PathBuf, String>,
    malformed: Vec<PathBuf>,
    pub loads: AtomicUsize,
}

impl FakeLoader {
    pub fn with_document(mut self, path: &str, text: &str) -> Self {
        self.documents.insert(PathBuf::from(path), text.to_string());
        self
    }

    pub fn with_malformed(mut self, path: &str) -> Self {
        self.malformed.push(PathBuf::from(path));
        self
    }
}

#[async_trait]
impl DocumentLoader for FakeLoader {
    async fn load(&self, location: &Path, media_type: Option<&str>) -> Result<Document> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.malformed.iter().any(|p| p == location) {
            return Err(RagError::MalformedDocument {
                location: location.display().to_string(),
                message: "cabecera PDF no válida".to_string(),
            });
        }
        let text = self
            .documents
            .get(location)
            .ok_or_else(|| RagError::NotFound(location.display().to_string()))?;
        Ok(Document {
            location: location.to_path_buf(),
            media_type: media_type.map(str::to_string),
            text: text.clone(),
        })
    }
}

/// Índice en memoria cuyo primer upsert deja sin escribir el último punto.
#[derive(Default)]
pub struct FlakyIndex {
    pub inner: InMemoryVectorIndex,
    pub upserts: AtomicUsize,
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<EnsureOutcome> {
        self.inner.ensure_collection(spec).await
    }

    async fn describe(&self, name: &str) -> Result<Option<CollectionSpec>> {
        self.inner.describe(name).await
    }

    async fn upsert(&self, name: &str, points: &[IndexPoint]) -> Result<UpsertReport> {
        if self.upserts.fetch_add(1, Ordering::SeqCst) > 0 || points.len() < 2 {
            return self.inner.upsert(name, points).await;
        }
        let (head, last) = points.split_at(points.len() - 1);
        let mut report = self.inner.upsert(name, head).await?;
        report.failed.push((last[0].id, "timeout de escritura".to_string()));
        Ok(report)
    }

    async fn search(&self, name: &str, query: &[f64], top_k: usize) -> Result<Vec<SearchHit>> {
        self.inner.search(name, query, top_k).await
    }

    async fn count(&self, name: &str, source: Option<&str>) -> Result<usize> {
        self.inner.count(name, source).await
    }
}

/// Índice que nunca responde.
pub struct UnreachableIndex;

#[async_trait]
impl VectorIndex for UnreachableIndex {
    async fn ensure_collection(&self, _: &CollectionSpec) -> Result<EnsureOutcome> {
        Err(RagError::transient("vector_index", "connection refused"))
    }

    async fn describe(&self, _: &str) -> Result<Option<CollectionSpec>> {
        Err(RagError::transient("vector_index", "connection refused"))
    }

    async fn upsert(&self, _: &str, _: &[IndexPoint]) -> Result<UpsertReport> {
        Err(RagError::transient("vector_index", "connection refused"))
    }

    async fn search(&self, _: &str, _: &[f64], _: usize) -> Result<Vec<SearchHit>> {
        Err(RagError::transient("vector_index", "connection refused"))
    }

    async fn count(&self, _: &str, _: Option<&str>) -> Result<usize> {
        Err(RagError::transient("vector_index", "connection refused"))
    }
}

/// Loader cuya extracción entra siempre en pánico.
#[derive(Default)]
pub struct PanickingLoader {
    pub loads: AtomicUsize,
}

#[async_trait]
impl DocumentLoader for PanickingLoader {
    async fn load(&self, location: &Path, _: Option<&str>) -> Result<Document> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        panic!("el extractor se cayó con {}", location.display());
    }
}
