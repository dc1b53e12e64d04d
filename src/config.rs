//! Carga y gestión de configuración de la aplicación (índice vectorial, LLM
//! y parámetros del pipeline).
//!
//! Ingesta y consulta comparten un único `PipelineConfig`: mismo modelo de
//! embeddings, misma colección y misma dimensión.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::chunker::ChunkerConfig;
use crate::embedding::EmbeddingOptions;
use crate::models::Metric;
use crate::queue::DEFAULT_KEEP_COMPLETED;
use crate::retry::RetryPolicy;
use crate::vector_store::validate_collection_name;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            other => Err(anyhow!("Proveedor LLM no soportado: {other} (sólo 'openai')")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VectorBackend {
    Memory,
    Neo4j,
}

impl VectorBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "neo4j" => Ok(Self::Neo4j),
            other => Err(anyhow!("Backend vectorial no soportado: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Parámetros compartidos por la ingesta y las consultas.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub collection: String,
    pub metric: Metric,
    pub chunker: ChunkerConfig,
    pub top_k: usize,
    pub context_max_chars: usize,
    pub retry: RetryPolicy,
    pub embedding: EmbeddingOptions,
    /// Límite de espera de cada llamada al modelo de chat.
    pub model_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collection: "pdf_chunks".to_string(),
            metric: Metric::Cosine,
            chunker: ChunkerConfig::default(),
            top_k: 5,
            context_max_chars: 6000,
            retry: RetryPolicy::default(),
            embedding: EmbeddingOptions::default(),
            model_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub upload_dir: PathBuf,

    pub vector_backend: VectorBackend,
    pub neo4j: Option<Neo4jConfig>,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_embedding_dimensions: usize,
    pub llm_chat_model: String,

    pub worker_count: usize,
    pub job_lease: Duration,
    pub job_max_deliveries: u32,
    /// Trabajos completados que se conservan para consulta.
    pub job_keep_completed: usize,

    pub pipeline: PipelineConfig,
}

/// Dimensión conocida de los modelos de embeddings habituales.
pub fn known_embedding_dimensions(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        "nomic-embed-text" => Some(768),
        "textembedding-gecko" | "text-embedding-004" => Some(768),
        _ => None,
    }
}

/// Lee una variable numérica; si no existe usa `default`, si no se puede
/// parsear falla en lugar de ignorarla.
fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Valor no válido para {key} ('{raw}'): {e}")),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:9000".to_string());
        let upload_dir =
            PathBuf::from(env::var("UPLOAD_DIR").unwrap_or_else(|_| "./uploads".to_string()));

        let vector_backend =
            VectorBackend::from_str(&env::var("VECTOR_BACKEND").unwrap_or_else(|_| "memory".to_string()))?;
        let neo4j = match vector_backend {
            VectorBackend::Neo4j => Some(Neo4jConfig {
                uri: env::var("NEO4J_URI").map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?,
                user: env::var("NEO4J_USER").map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?,
                password: env::var("NEO4J_PASSWORD")
                    .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?,
            }),
            VectorBackend::Memory => None,
        };

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_embedding_dimensions = match env::var("LLM_EMBEDDING_DIMENSIONS") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("LLM_EMBEDDING_DIMENSIONS no válido: '{raw}'"))?,
            Err(_) => known_embedding_dimensions(&llm_embedding_model).ok_or_else(|| {
                anyhow!(
                    "Dimensión desconocida para el modelo '{llm_embedding_model}': defina LLM_EMBEDDING_DIMENSIONS"
                )
            })?,
        };
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let collection = env::var("COLLECTION_NAME").unwrap_or_else(|_| "pdf_chunks".to_string());
        validate_collection_name(&collection)?;
        let metric_str = env::var("COLLECTION_METRIC").unwrap_or_else(|_| "cosine".to_string());
        let metric = Metric::parse(&metric_str)
            .ok_or_else(|| anyhow!("Métrica no soportada: {metric_str}"))?;

        let chunker = ChunkerConfig::new(parse_var("CHUNK_SIZE", 500)?, parse_var("CHUNK_OVERLAP", 50)?)?;

        let retry = RetryPolicy {
            max_attempts: parse_var("RETRY_MAX_ATTEMPTS", 4)?,
            base_delay: Duration::from_millis(parse_var("RETRY_BASE_DELAY_MS", 250)?),
            max_delay: Duration::from_millis(parse_var("RETRY_MAX_DELAY_MS", 5000)?),
        };
        let model_timeout = Duration::from_secs(parse_var("MODEL_TIMEOUT_SECS", 30)?);

        let pipeline = PipelineConfig {
            collection,
            metric,
            chunker,
            top_k: parse_var("TOP_K", 5)?,
            context_max_chars: parse_var("CONTEXT_MAX_CHARS", 6000)?,
            retry,
            embedding: EmbeddingOptions {
                batch_size: parse_var("EMBED_BATCH_SIZE", 16)?,
                concurrency: parse_var("EMBED_CONCURRENCY", 4)?,
                timeout: model_timeout,
            },
            model_timeout,
        };
        if pipeline.top_k == 0 {
            return Err(anyhow!("TOP_K debe ser mayor que cero"));
        }

        Ok(Self {
            server_addr,
            upload_dir,
            vector_backend,
            neo4j,
            llm_provider,
            llm_embedding_model,
            llm_embedding_dimensions,
            llm_chat_model,
            worker_count: parse_var::<usize>("WORKER_COUNT", 2)?.max(1),
            job_lease: Duration::from_secs(parse_var("JOB_LEASE_SECS", 300)?),
            job_max_deliveries: parse_var("JOB_MAX_DELIVERIES", 5)?,
            job_keep_completed: parse_var("JOB_KEEP_COMPLETED", DEFAULT_KEEP_COMPLETED)?,
            pipeline,
        })
    }
}
