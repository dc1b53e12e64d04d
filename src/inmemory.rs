//! Índice vectorial en memoria.
//!
//! Colecciones en un `HashMap` protegido por un `tokio::sync::RwLock`. La
//! comprobación y creación de una colección ocurren bajo el mismo cerrojo de
//! escritura, así que `ensure_collection` es atómico.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{CollectionSpec, EmbeddingVector, IndexPoint, Metric, PointPayload, SearchHit};
use crate::vector_store::{check_compatible, EnsureOutcome, UpsertReport, VectorIndex};

#[derive(Debug)]
struct StoredPoint {
    vector: EmbeddingVector,
    payload: PointPayload,
    /// Orden de escritura, para desempatar por recencia.
    seq: u64,
}

#[derive(Debug)]
struct Collection {
    spec: CollectionSpec,
    points: HashMap<Uuid, StoredPoint>,
}

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<String, Collection>,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    inner: RwLock<Inner>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn similarity(metric: Metric, a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match metric {
        Metric::Dot => dot,
        Metric::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
        // Misma convención que Neo4j: 1 / (1 + d²).
        Metric::Euclidean => {
            let d2: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
            1.0 / (1.0 + d2)
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<EnsureOutcome> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.collections.get(&spec.name) {
            check_compatible(&existing.spec, spec)?;
            return Ok(EnsureOutcome::Existing);
        }
        inner
            .collections
            .insert(spec.name.clone(), Collection { spec: spec.clone(), points: HashMap::new() });
        info!(collection = %spec.name, dimension = spec.dimension, metric = %spec.metric, "Colección creada");
        Ok(EnsureOutcome::Created)
    }

    async fn describe(&self, name: &str) -> Result<Option<CollectionSpec>> {
        let inner = self.inner.read().await;
        Ok(inner.collections.get(name).map(|c| c.spec.clone()))
    }

    async fn upsert(&self, name: &str, points: &[IndexPoint]) -> Result<UpsertReport> {
        let mut inner = self.inner.write().await;
        let Inner { collections, next_seq } = &mut *inner;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| RagError::NotFound(format!("colección '{name}'")))?;

        let mut report = UpsertReport::default();
        for point in points {
            if point.vector.len() != collection.spec.dimension {
                report.failed.push((
                    point.id,
                    format!(
                        "dimensión {} distinta de la de la colección ({})",
                        point.vector.len(),
                        collection.spec.dimension
                    ),
                ));
                continue;
            }
            *next_seq += 1;
            collection.points.insert(
                point.id,
                StoredPoint { vector: point.vector.clone(), payload: point.payload.clone(), seq: *next_seq },
            );
            report.written += 1;
        }
        debug!(collection = name, written = report.written, failed = report.failed.len(), "Upsert en memoria");
        Ok(report)
    }

    async fn search(&self, name: &str, query: &[f64], top_k: usize) -> Result<Vec<SearchHit>> {
        let inner = self.inner.read().await;
        let collection = inner
            .collections
            .get(name)
            .ok_or_else(|| RagError::NotFound(format!("colección '{name}'")))?;
        if query.len() != collection.spec.dimension {
            return Err(RagError::conflict(
                name,
                format!(
                    "vector de consulta de dimensión {} para una colección de dimensión {}",
                    query.len(),
                    collection.spec.dimension
                ),
            ));
        }

        let mut scored: Vec<(f64, u64, Uuid, &PointPayload)> = collection
            .points
            .iter()
            .map(|(id, p)| (similarity(collection.spec.metric, &p.vector, query), p.seq, *id, &p.payload))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(b.1.cmp(&a.1))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, _, id, payload)| SearchHit { id, score, payload: payload.clone() })
            .collect())
    }

    async fn count(&self, name: &str, source: Option<&str>) -> Result<usize> {
        let inner = self.inner.read().await;
        let Some(collection) = inner.collections.get(name) else {
            return Ok(0);
        };
        Ok(match source {
            Some(source) => collection.points.values().filter(|p| p.payload.source == source).count(),
            None => collection.points.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dimension: usize) -> CollectionSpec {
        CollectionSpec { name: "docs".into(), dimension, metric: Metric::Cosine }
    }

    fn point(source: &str, index: usize, vector: Vec<f64>) -> IndexPoint {
        IndexPoint {
            id: crate::models::point_id(source, index),
            vector,
            payload: PointPayload { text: format!("{source}-{index}"), source: source.into(), chunk_index: index },
        }
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_guards_dimension() {
        let index = InMemoryVectorIndex::new();
        assert_eq!(index.ensure_collection(&spec(3)).await.unwrap(), EnsureOutcome::Created);
        index.upsert("docs", &[point("a", 0, vec![1.0, 0.0, 0.0])]).await.unwrap();

        assert_eq!(index.ensure_collection(&spec(3)).await.unwrap(), EnsureOutcome::Existing);
        let err = index.ensure_collection(&spec(4)).await.unwrap_err();
        assert!(matches!(err, RagError::ConfigurationConflict { .. }));

        assert_eq!(index.describe("docs").await.unwrap(), Some(spec(3)));
        assert_eq!(index.count("docs", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_once() {
        let index = std::sync::Arc::new(InMemoryVectorIndex::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let index = index.clone();
            handles.push(tokio::spawn(async move { index.ensure_collection(&spec(3)).await.unwrap() }));
        }
        let mut created = 0;
        for h in handles {
            if h.await.unwrap() == EnsureOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn identical_vector_ranks_first() {
        let index = InMemoryVectorIndex::new();
        index.ensure_collection(&spec(3)).await.unwrap();
        index
            .upsert(
                "docs",
                &[
                    point("a", 0, vec![1.0, 0.0, 0.0]),
                    point("a", 1, vec![0.0, 1.0, 0.0]),
                    point("a", 2, vec![0.6, 0.8, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = index.search("docs", &[0.0, 1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload.chunk_index, 1);
        assert_eq!(hits[1].payload.chunk_index, 2);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn ties_prefer_the_most_recent_write() {
        let index = InMemoryVectorIndex::new();
        index.ensure_collection(&spec(2)).await.unwrap();
        index.upsert("docs", &[point("old", 0, vec![1.0, 1.0])]).await.unwrap();
        index.upsert("docs", &[point("new", 0, vec![1.0, 1.0])]).await.unwrap();

        let hits = index.search("docs", &[1.0, 1.0], 2).await.unwrap();
        assert_eq!(hits[0].payload.source, "new");
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id_and_reports_bad_points() {
        let index = InMemoryVectorIndex::new();
        index.ensure_collection(&spec(2)).await.unwrap();
        index.upsert("docs", &[point("a", 0, vec![1.0, 0.0])]).await.unwrap();

        let bad = point("a", 1, vec![1.0, 0.0, 0.0]);
        let report = index
            .upsert("docs", &[point("a", 0, vec![0.0, 1.0]), bad.clone()])
            .await
            .unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.failed_ids(), vec![bad.id]);
        assert_eq!(index.count("docs", Some("a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_collection_is_not_found() {
        let index = InMemoryVectorIndex::new();
        let err = index.search("nope", &[1.0], 5).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
        assert_eq!(index.count("nope", None).await.unwrap(), 0);
    }
}
