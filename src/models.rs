//! Modelos de dominio: documentos, chunks, puntos del índice vectorial,
//! colecciones y trabajos de ingesta.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Vector de embedding. Su longitud la fija el modelo configurado.
pub type EmbeddingVector = Vec<f64>;

/// Espacio de nombres para los ids v5 de los puntos.
const POINT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b7e_94a3_4d0b_8e55_3c1a_9f20_d4e7);

/// Documento ya cargado: ubicación, tipo declarado y texto extraído.
/// Los bytes originales no se conservan una vez indexado.
#[derive(Debug, Clone)]
pub struct Document {
    pub location: PathBuf,
    pub media_type: Option<String>,
    pub text: String,
}

impl Document {
    /// Identificador estable del documento, usado como `source` de sus puntos.
    pub fn id(&self) -> String {
        document_id(&self.location)
    }
}

/// Identificador de documento a partir de su ubicación, normalizada de
/// forma léxica: `./docs//a.txt`, `docs/sub/../a.txt` y `docs\a.txt` dan
/// todos `docs/a.txt`. No se consulta el sistema de ficheros.
pub fn document_id(location: &Path) -> String {
    let unified = location.to_string_lossy().replace('\\', "/");
    let mut prefix = String::new();
    let mut parts: Vec<String> = Vec::new();

    for component in Path::new(&unified).components() {
        match component {
            Component::Prefix(p) => prefix.push_str(&p.as_os_str().to_string_lossy()),
            Component::RootDir => prefix.push('/'),
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(last) if last != ".." => {
                    parts.pop();
                }
                // `..` por encima de la raíz no sube más.
                _ if prefix.ends_with('/') => {}
                _ => parts.push("..".to_string()),
            },
            Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
        }
    }

    let joined = parts.join("/");
    match (prefix.is_empty(), joined.is_empty()) {
        (true, true) => ".".to_string(),
        (true, false) => joined,
        (false, _) => format!("{prefix}{joined}"),
    }
}

/// Trozo contiguo del texto de un documento.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// Desplazamiento en caracteres dentro del texto original.
    pub offset: usize,
    pub text: String,
    pub source: String,
}

impl Chunk {
    /// Id determinista a partir de (documento, índice del chunk): una
    /// reingesta del mismo documento sobrescribe en lugar de duplicar.
    pub fn point_id(&self) -> Uuid {
        point_id(&self.source, self.index)
    }
}

pub fn point_id(source: &str, chunk_index: usize) -> Uuid {
    Uuid::new_v5(&POINT_ID_NAMESPACE, format!("{source}#{chunk_index}").as_bytes())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    pub text: String,
    pub source: String,
    pub chunk_index: usize,
}

/// Unidad persistida en el índice vectorial.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPoint {
    pub id: Uuid,
    pub vector: EmbeddingVector,
    pub payload: PointPayload,
}

impl IndexPoint {
    pub fn from_chunk(chunk: Chunk, vector: EmbeddingVector) -> Self {
        Self {
            id: chunk.point_id(),
            vector,
            payload: PointPayload { text: chunk.text, source: chunk.source, chunk_index: chunk.index },
        }
    }
}

/// Función de similitud de una colección.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    Euclidean,
    Dot,
}

impl Metric {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Some(Self::Cosine),
            "euclidean" => Some(Self::Euclidean),
            "dot" => Some(Self::Dot),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
            Self::Dot => "dot",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definición de una colección: nombre, dimensión fija y métrica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionSpec {
    pub name: String,
    pub dimension: usize,
    pub metric: Metric,
}

/// Resultado de una búsqueda: el punto recuperado y su puntuación.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub score: f64,
    pub payload: PointPayload,
}

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Registro de un trabajo de ingesta, tal como lo expone la API.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionJob {
    pub id: JobId,
    pub location: PathBuf,
    pub media_type: Option<String>,
    pub status: JobStatus,
    pub failure: Option<JobFailure>,
    /// Veces que el trabajo se ha entregado a un worker.
    pub deliveries: u32,
    pub chunks_indexed: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub kind: String,
    pub message: String,
}
