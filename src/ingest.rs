//! Ejecución de un trabajo de ingesta: documento → chunks → embeddings →
//! colección → puntos en el índice vectorial.
//!
//! Cada paso puede fallar y aborta los siguientes. Los fallos transitorios se
//! reintentan dentro de la misma ejecución según la `RetryPolicy`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    chunker,
    config::PipelineConfig,
    embedding::EmbeddingAdapter,
    error::{self, RagError},
    loader::{self, DocumentLoader},
    models::{CollectionSpec, IndexPoint, IngestionJob, JobId},
    queue::JobQueue,
    vector_store::{EnsureOutcome, VectorIndex},
};

/// Resumen de la ingesta de un documento.
#[derive(Debug, Clone)]
pub struct IngestionSummary {
    pub source: String,
    pub chunks_indexed: usize,
    pub collection_created: bool,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} chunks indexados", self.source, self.chunks_indexed)?;
        if self.collection_created {
            write!(f, " (colección creada)")?;
        }
        Ok(())
    }
}

pub struct IngestionPipeline {
    loader: Arc<dyn DocumentLoader>,
    embeddings: EmbeddingAdapter,
    index: Arc<dyn VectorIndex>,
    config: PipelineConfig,
}

impl IngestionPipeline {
    pub fn new(
        loader: Arc<dyn DocumentLoader>,
        embeddings: EmbeddingAdapter,
        index: Arc<dyn VectorIndex>,
        config: PipelineConfig,
    ) -> Self {
        Self { loader, embeddings, index, config }
    }

    /// Ejecuta todos los pasos de un trabajo. Volver a ejecutar el mismo
    /// trabajo sobrescribe los mismos puntos: los ids salen de
    /// (documento, índice de chunk).
    pub async fn run(&self, job: &IngestionJob) -> error::Result<IngestionSummary> {
        let retry = self.config.retry;

        // --- Fase 1: Carga ---
        let document = retry
            .run("load", |_| self.loader.load(&job.location, job.media_type.as_deref()))
            .await?;
        let source = document.id();

        // --- Fase 2: Chunks ---
        let chunks: Vec<_> = chunker::chunk(&document.text, &source, self.config.chunker).collect();
        drop(document);
        if chunks.is_empty() {
            warn!(job_id = %job.id, source = %source, "Documento vacío o sin texto útil");
            return Ok(IngestionSummary { source, chunks_indexed: 0, collection_created: false });
        }

        // --- Fase 3: Embeddings ---
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = retry.run("embed", |_| self.embeddings.embed_many(&texts)).await?;
        if vectors.len() != chunks.len() {
            return Err(RagError::Internal(format!(
                "Número de embeddings ({}) distinto al número de chunks ({})",
                vectors.len(),
                chunks.len()
            )));
        }

        // --- Fase 4: Colección con la dimensión observada ---
        let spec = CollectionSpec {
            name: self.config.collection.clone(),
            dimension: vectors[0].len(),
            metric: self.config.metric,
        };
        let outcome = retry.run("ensure_collection", |_| self.index.ensure_collection(&spec)).await?;

        // --- Fase 5: Upsert ---
        let points: Vec<IndexPoint> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexPoint::from_chunk(chunk, vector))
            .collect();
        let chunks_indexed = points.len();
        self.upsert_all(points).await?;

        info!(job_id = %job.id, source = %source, chunks = chunks_indexed, "Documento indexado");
        Ok(IngestionSummary {
            source,
            chunks_indexed,
            collection_created: outcome == EnsureOutcome::Created,
        })
    }

    /// Escribe todos los puntos; en cada reintento sólo se reenvían los que
    /// fallaron.
    async fn upsert_all(&self, mut pending: Vec<IndexPoint>) -> error::Result<()> {
        let retry = self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self.index.upsert(&self.config.collection, &pending).await;
            let err = match result {
                Ok(report) if report.is_complete() => return Ok(()),
                Ok(report) => {
                    let failed_ids = report.failed_ids();
                    pending.retain(|p| failed_ids.contains(&p.id));
                    RagError::PartialUpsert { failed: report.failed }
                }
                Err(err) => err,
            };

            if !err.is_transient() || attempt >= max_attempts {
                return Err(err);
            }
            let delay = retry.delay_for(attempt);
            warn!(
                collection = %self.config.collection,
                attempt,
                pending = pending.len(),
                "Upsert incompleto, se reintenta: {err}"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Resumen de un envío de directorio completo.
#[derive(Debug, Default)]
pub struct DirectorySubmission {
    pub files_scanned: u32,
    pub jobs: Vec<JobId>,
    pub files_skipped: u32,
}

impl std::fmt::Display for DirectorySubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} encolados, {} omitidos.",
            self.files_scanned,
            self.jobs.len(),
            self.files_skipped
        )
    }
}

/// Recorre recursivamente un directorio y encola un trabajo por cada fichero
/// soportado. No lee el contenido: eso ocurre en el worker.
pub fn submit_directory(queue: &JobQueue, root: &Path) -> Result<DirectorySubmission> {
    if !root.is_dir() {
        return Err(anyhow!("La ruta no es un directorio: {}", root.display()));
    }

    let mut summary = DirectorySubmission::default();
    let file_entries = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file());

    for entry in file_entries {
        summary.files_scanned += 1;
        let path = entry.path();
        if loader::is_supported(path) {
            summary.jobs.push(queue.submit(path, None));
        } else {
            debug!("Saltando fichero con extensión no soportada: {}", path.display());
            summary.files_skipped += 1;
        }
    }

    info!("{summary}");
    Ok(summary)
}
