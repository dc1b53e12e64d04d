//! Índice vectorial: contrato común y backend sobre Neo4j.
//!
//! Cada colección se guarda como una etiqueta de nodo con su propio índice
//! vectorial (`CREATE VECTOR INDEX`) del mismo nombre que la colección.
//!
//! API pública:
//!   - `VectorIndex` (trait), implementado por `Neo4jVectorIndex` e
//!     `InMemoryVectorIndex`.
//!   - `check_compatible`, usado por ambos backends en `ensure_collection`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use neo4rs::{query, Graph};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{CollectionSpec, IndexPoint, Metric, PointPayload, SearchHit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnsureOutcome {
    Created,
    Existing,
}

/// Resultado de un upsert: cuántos puntos se escribieron y cuáles fallaron.
#[derive(Debug, Default, Clone)]
pub struct UpsertReport {
    pub written: usize,
    pub failed: Vec<(Uuid, String)>,
}

impl UpsertReport {
    pub fn failed_ids(&self) -> Vec<Uuid> {
        self.failed.iter().map(|(id, _)| *id).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Crea la colección si no existe. Si existe con otra dimensión o métrica
    /// falla con `ConfigurationConflict` y no la toca. Comprobación y
    /// creación son una única operación atómica por nombre.
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<EnsureOutcome>;

    async fn describe(&self, name: &str) -> Result<Option<CollectionSpec>>;

    /// Escribe o sobrescribe puntos por id. Cada punto es atómico; los que
    /// fallan se devuelven en el informe.
    async fn upsert(&self, name: &str, points: &[IndexPoint]) -> Result<UpsertReport>;

    /// Hasta `top_k` puntos por similitud descendente.
    async fn search(&self, name: &str, query: &[f64], top_k: usize) -> Result<Vec<SearchHit>>;

    /// Número de puntos de la colección, opcionalmente de un solo documento.
    async fn count(&self, name: &str, source: Option<&str>) -> Result<usize>;
}

/// Compara la colección existente con la pedida.
pub fn check_compatible(existing: &CollectionSpec, requested: &CollectionSpec) -> Result<()> {
    if existing.dimension != requested.dimension {
        return Err(RagError::conflict(
            &existing.name,
            format!(
                "la colección existe con dimensión {} y se pidió {}",
                existing.dimension, requested.dimension
            ),
        ));
    }
    if existing.metric != requested.metric {
        return Err(RagError::conflict(
            &existing.name,
            format!(
                "la colección existe con métrica {} y se pidió {}",
                existing.metric, requested.metric
            ),
        ));
    }
    Ok(())
}

/// Sólo se admiten nombres de colección `[A-Za-z0-9_]`, porque acaban
/// interpolados como etiqueta e índice en Cypher.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RagError::Validation(format!("nombre de colección no válido: '{name}'")))
    }
}

// ---------------------------------------------------------------------
// NEO4J
// ---------------------------------------------------------------------

pub struct Neo4jVectorIndex {
    graph: Arc<Graph>,
    /// Un cerrojo por colección para serializar `ensure_collection` dentro
    /// del proceso. Entre procesos lo resuelve `IF NOT EXISTS` + relectura.
    ensure_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Sólo los fallos de red y los errores `Neo.TransientError.*` del servidor
/// se reintentan; sintaxis, restricciones, credenciales o límites del índice
/// son permanentes.
fn map_neo4j_err(e: neo4rs::Error) -> RagError {
    match e {
        neo4rs::Error::IOError { .. } => RagError::transient("neo4j", e),
        other => classify_neo4j_message(&other.to_string()),
    }
}

fn classify_neo4j_message(message: &str) -> RagError {
    const TRANSIENT_MARKERS: &[&str] = &[
        "Neo.TransientError",
        "ServiceUnavailable",
        "DatabaseUnavailable",
        "connection",
        "timed out",
        "broken pipe",
    ];
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(&m.to_lowercase())) {
        RagError::transient("neo4j", message)
    } else {
        RagError::permanent("neo4j", message)
    }
}

/// Columna obligatoria de una fila de resultados.
fn required<T>(value: Option<T>, column: &str) -> Result<T> {
    value.ok_or_else(|| RagError::Internal(format!("Falta la columna '{column}' en el resultado de Neo4j")))
}

fn parse_point_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| RagError::Internal(format!("Id de punto no válido '{raw}': {e}")))
}

fn label_for(name: &str) -> String {
    format!("Point_{name}")
}

fn neo4j_similarity(metric: Metric) -> Result<&'static str> {
    match metric {
        Metric::Cosine => Ok("cosine"),
        Metric::Euclidean => Ok("euclidean"),
        Metric::Dot => Err(RagError::Validation(
            "Neo4j no soporta la métrica 'dot' en índices vectoriales".to_string(),
        )),
    }
}

impl Neo4jVectorIndex {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph, ensure_locks: Mutex::new(HashMap::new()) }
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.ensure_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    async fn create_index(&self, spec: &CollectionSpec) -> Result<()> {
        let similarity = neo4j_similarity(spec.metric)?;
        let label = label_for(&spec.name);

        // Crear índice vectorial para (:Point_<colección>)(embedding)
        let cypher = format!(
            "\
CREATE VECTOR INDEX `{index_name}` IF NOT EXISTS
FOR (p:`{label}`)
ON (p.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: '{similarity}'
  }}
}}",
            index_name = spec.name,
            dimensions = spec.dimension,
        );
        self.graph.run(query(&cypher)).await.map_err(map_neo4j_err)?;

        // Id único por colección
        let constraint = format!(
            "CREATE CONSTRAINT `{name}_id` IF NOT EXISTS FOR (p:`{label}`) REQUIRE p.id IS UNIQUE",
            name = spec.name,
        );
        self.graph.run(query(&constraint)).await.map_err(map_neo4j_err)?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for Neo4jVectorIndex {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<EnsureOutcome> {
        validate_collection_name(&spec.name)?;
        let lock = self.lock_for(&spec.name);
        let _guard = lock.lock().await;

        if let Some(existing) = self.describe(&spec.name).await? {
            check_compatible(&existing, spec)?;
            debug!(collection = %spec.name, "Índice vectorial ya existe.");
            return Ok(EnsureOutcome::Existing);
        }

        self.create_index(spec).await?;

        // Otro proceso pudo crearlo entre medias con otra dimensión:
        // `IF NOT EXISTS` no lo sobrescribe, así que se relee lo que quedó.
        let stored = self.describe(&spec.name).await?.ok_or_else(|| {
            RagError::transient("neo4j", format!("el índice '{}' aún no es visible", spec.name))
        })?;
        check_compatible(&stored, spec)?;

        info!(collection = %spec.name, dimension = spec.dimension, "Índice vectorial creado.");
        Ok(EnsureOutcome::Created)
    }

    async fn describe(&self, name: &str) -> Result<Option<CollectionSpec>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "SHOW VECTOR INDEXES YIELD name, options WHERE name = $name
                     RETURN options.indexConfig['vector.dimensions'] AS dimensions,
                            options.indexConfig['vector.similarity_function'] AS metric",
                )
                .param("name", name),
            )
            .await
            .map_err(map_neo4j_err)?;

        let Some(row) = cursor.next().await.map_err(map_neo4j_err)? else {
            return Ok(None);
        };
        let dimensions: i64 = row
            .get("dimensions")
            .ok_or_else(|| RagError::Internal("Falta 'dimensions' en el índice vectorial".into()))?;
        let metric_name: String = row.get("metric").unwrap_or_else(|| "cosine".to_string());
        let metric = Metric::parse(&metric_name).ok_or_else(|| {
            RagError::Internal(format!("Métrica desconocida en Neo4j: {metric_name}"))
        })?;

        Ok(Some(CollectionSpec { name: name.to_string(), dimension: dimensions as usize, metric }))
    }

    async fn upsert(&self, name: &str, points: &[IndexPoint]) -> Result<UpsertReport> {
        validate_collection_name(name)?;
        let cypher = format!(
            "MERGE (p:`{label}` {{id: $id}})
             SET p.embedding = $embedding, p.text = $text, p.source = $source,
                 p.chunk_index = $chunk_index, p.updated_at = datetime()",
            label = label_for(name)
        );

        let mut report = UpsertReport::default();
        for point in points {
            let result = self
                .graph
                .run(
                    query(&cypher)
                        .param("id", point.id.to_string())
                        .param("embedding", point.vector.clone())
                        .param("text", point.payload.text.clone())
                        .param("source", point.payload.source.clone())
                        .param("chunk_index", point.payload.chunk_index as i64),
                )
                .await;
            match result {
                Ok(()) => report.written += 1,
                Err(e) => {
                    warn!(collection = name, point_id = %point.id, "Fallo escribiendo punto: {e}");
                    report.failed.push((point.id, e.to_string()));
                }
            }
        }
        debug!(collection = name, written = report.written, failed = report.failed.len(), "Upsert en Neo4j");
        Ok(report)
    }

    async fn search(&self, name: &str, query_vec: &[f64], top_k: usize) -> Result<Vec<SearchHit>> {
        if self.describe(name).await?.is_none() {
            return Err(RagError::NotFound(format!("colección '{name}'")));
        }

        let mut cursor = self
            .graph
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                     YIELD node, score
                     RETURN node.id AS id, score, node.text AS text, node.source AS source,
                            node.chunk_index AS chunk_index
                     ORDER BY score DESC",
                )
                .param("index_name", name)
                .param("k", top_k as i64)
                .param("embedding", query_vec.to_vec()),
            )
            .await
            .map_err(map_neo4j_err)?;

        let mut hits = Vec::new();
        while let Some(row) = cursor.next().await.map_err(map_neo4j_err)? {
            let id: String = required(row.get("id"), "id")?;
            let score: f64 = required(row.get("score"), "score")?;
            let text: String = required(row.get("text"), "text")?;
            let source: String = required(row.get("source"), "source")?;
            let chunk_index: i64 = required(row.get("chunk_index"), "chunk_index")?;

            hits.push(SearchHit {
                id: parse_point_id(&id)?,
                score,
                payload: PointPayload { text, source, chunk_index: chunk_index.max(0) as usize },
            });
        }
        Ok(hits)
    }

    async fn count(&self, name: &str, source: Option<&str>) -> Result<usize> {
        validate_collection_name(name)?;
        let label = label_for(name);
        let q = match source {
            Some(source) => query(&format!(
                "MATCH (p:`{label}`) WHERE p.source = $source RETURN count(p) AS n"
            ))
            .param("source", source),
            None => query(&format!("MATCH (p:`{label}`) RETURN count(p) AS n")),
        };

        let mut cursor = self.graph.execute(q).await.map_err(map_neo4j_err)?;
        let n: i64 = match cursor.next().await.map_err(map_neo4j_err)? {
            Some(row) => row.get("n").unwrap_or_default(),
            None => 0,
        };
        Ok(n.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dimension: usize, metric: Metric) -> CollectionSpec {
        CollectionSpec { name: "pdf_chunks".into(), dimension, metric }
    }

    #[test]
    fn compatible_specs_pass() {
        assert!(check_compatible(&spec(768, Metric::Cosine), &spec(768, Metric::Cosine)).is_ok());
    }

    #[test]
    fn dimension_or_metric_mismatch_is_a_conflict() {
        let dim = check_compatible(&spec(768, Metric::Cosine), &spec(1536, Metric::Cosine));
        assert!(matches!(dim, Err(RagError::ConfigurationConflict { .. })));
        let metric = check_compatible(&spec(768, Metric::Cosine), &spec(768, Metric::Euclidean));
        assert!(matches!(metric, Err(RagError::ConfigurationConflict { .. })));
    }

    #[test]
    fn collection_names_must_be_plain_identifiers() {
        assert!(validate_collection_name("pdf_chunks").is_ok());
        assert!(validate_collection_name("docs2").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("1docs").is_err());
        assert!(validate_collection_name("docs`) DETACH DELETE n //").is_err());
    }

    #[test]
    fn neo4j_failures_are_classified_by_cause() {
        let transient = [
            "Neo.TransientError.Transaction.DeadlockDetected: deadlock",
            "Neo.TransientError.General.DatabaseUnavailable",
            "connection error",
            "operation timed out",
        ];
        for message in transient {
            assert!(classify_neo4j_message(message).is_transient(), "{message}");
        }

        let permanent = [
            "Neo.ClientError.Statement.SyntaxError: Invalid input 'CRATE'",
            "Neo.ClientError.Schema.ConstraintValidationFailed: already exists",
            "Neo.ClientError.Security.Unauthorized: The client is unauthorized",
            "Neo.ClientError.Procedure.ProcedureCallFailed: 'vector.dimensions' must be between 1 and 4096",
        ];
        for message in permanent {
            let err = classify_neo4j_message(message);
            assert!(!err.is_transient(), "{message}");
            assert_eq!(err.kind(), "permanent_dependency");
        }
    }

    #[test]
    fn missing_columns_and_bad_ids_are_internal_errors() {
        assert_eq!(required(Some(3_i64), "n").unwrap(), 3);
        assert!(matches!(required::<String>(None, "text"), Err(RagError::Internal(_))));

        let id = Uuid::new_v4();
        assert_eq!(parse_point_id(&id.to_string()).unwrap(), id);
        assert!(matches!(parse_point_id(""), Err(RagError::Internal(_))));
    }

    #[test]
    fn dot_metric_is_rejected_for_neo4j() {
        assert!(neo4j_similarity(Metric::Dot).is_err());
        assert_eq!(neo4j_similarity(Metric::Cosine).unwrap(), "cosine");
    }
}
