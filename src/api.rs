use std::path::PathBuf;

use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    ingest,
    models::{IngestionJob, JobStatus},
    rag::{validate_question, Reply},
};

/// Tamaño máximo de un PDF subido.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// --- Payloads ---

#[derive(Deserialize)]
pub struct DocumentPayload {
    path: String,
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

#[derive(Deserialize)]
pub struct DirectoryPayload {
    path: String,
}

#[derive(Deserialize)]
pub struct ChatPayload {
    message: String,
}

#[derive(Deserialize)]
pub struct JobsQuery {
    status: Option<JobStatus>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Servidor RAG listo." }))
        .route(
            "/uploads/pdf",
            // Margen para las cabeceras del multipart.
            post(upload_pdf_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024)),
        )
        .route("/api/documents", post(submit_document_handler))
        .route("/api/ingest-directory", post(ingest_directory_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/chat", post(chat_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers de ingesta ---

/// Guarda el PDF con un nombre aleatorio y encola su ingesta. El
/// procesamiento ocurre después, en los workers.
#[axum::debug_handler]
async fn upload_pdf_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?
    {
        if field.name() != Some("pdf") {
            continue;
        }
        if field.content_type() != Some("application/pdf") {
            return Err(api_error(StatusCode::BAD_REQUEST, "Sólo se admiten ficheros PDF"));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(api_error(StatusCode::BAD_REQUEST, "El fichero supera el límite de 10 MiB"));
        }

        let path = state.config.upload_dir.join(format!("{}.pdf", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            error!("No se pudo guardar {}: {e}", path.display());
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "No se pudo guardar el fichero")
        })?;

        let job_id = state.queue.submit(&path, Some("application/pdf".to_string()));
        info!(job_id = %job_id, bytes = bytes.len(), "PDF recibido: {}", path.display());
        return Ok(Json(json!({ "message": "PDF subido correctamente", "jobId": job_id })));
    }

    Err(api_error(StatusCode::BAD_REQUEST, "No se ha subido ningún fichero"))
}

#[axum::debug_handler]
async fn submit_document_handler(
    State(state): State<AppState>,
    Json(payload): Json<DocumentPayload>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.path.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "La ruta del documento está vacía"));
    }
    let job_id = state.queue.submit(PathBuf::from(payload.path.trim()), payload.media_type);
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
}

#[axum::debug_handler]
async fn ingest_directory_handler(
    State(state): State<AppState>,
    Json(payload): Json<DirectoryPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let root = PathBuf::from(&payload.path);
    let summary = ingest::submit_directory(&state.queue, &root)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": summary.to_string(),
            "filesScanned": summary.files_scanned,
            "filesSkipped": summary.files_skipped,
            "jobIds": summary.jobs,
        })),
    ))
}

#[axum::debug_handler]
async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(filter): Query<JobsQuery>,
) -> Json<Vec<IngestionJob>> {
    Json(state.queue.list(filter.status))
}

#[axum::debug_handler]
async fn get_job_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<IngestionJob>, ApiError> {
    state
        .queue
        .get(id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Trabajo {id} no encontrado")))
}

// --- Consulta ---

/// Una pregunta vacía es un error del cliente; cualquier otro fallo se
/// responde con el mensaje genérico para que la interfaz siempre tenga algo
/// que mostrar.
#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatPayload>,
) -> Result<Json<Reply>, ApiError> {
    validate_question(&payload.message).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(state.query.reply(&payload.message).await))
}

// --- Estado y apagado ---

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let collection_name = &state.config.pipeline.collection;
    let collection = match state.index.describe(collection_name).await {
        Ok(Some(spec)) => {
            let points = state.index.count(collection_name, None).await.ok();
            json!({
                "name": spec.name,
                "dimension": spec.dimension,
                "metric": spec.metric,
                "points": points,
            })
        }
        Ok(None) => serde_json::Value::Null,
        Err(e) => {
            warn!(collection = %collection_name, "No se pudo consultar el índice: {e}");
            json!({ "name": collection_name, "error": e.to_string() })
        }
    };

    Json(json!({
        "jobs": state.queue.stats(),
        "collection": collection,
    }))
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = match state.shutdown_sender.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        config::{AppConfig, LlmProvider, PipelineConfig, VectorBackend},
        embedding::{Embedder, EmbeddingAdapter},
        error::Result,
        inmemory::InMemoryVectorIndex,
        llm::ChatModel,
        models::EmbeddingVector,
        queue::JobQueue,
        rag::QueryService,
    };

    struct ConstantEmbedder;

    #[async_trait]
    impl Embedder for ConstantEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }

        fn dimension(&self) -> usize {
            3
        }

        fn model_name(&self) -> &str {
            "constante"
        }
    }

    struct EchoChat;

    #[async_trait]
    impl ChatModel for EchoChat {
        async fn complete(&self, _: &str, user_message: &str) -> Result<String> {
            Ok(format!("eco: {user_message}"))
        }
    }

    fn state() -> AppState {
        let pipeline = PipelineConfig::default();
        let index = Arc::new(InMemoryVectorIndex::new());
        let query = QueryService::new(
            EmbeddingAdapter::new(Arc::new(ConstantEmbedder), pipeline.embedding),
            index.clone(),
            Arc::new(EchoChat),
            pipeline.clone(),
        );
        let (shutdown_tx, _shutdown_rx) = oneshot::channel();
        AppState {
            config: AppConfig {
                server_addr: "127.0.0.1:0".to_string(),
                upload_dir: PathBuf::from("uploads"),
                vector_backend: VectorBackend::Memory,
                neo4j: None,
                llm_provider: LlmProvider::OpenAI,
                llm_embedding_model: "constante".to_string(),
                llm_embedding_dimensions: 3,
                llm_chat_model: "eco".to_string(),
                worker_count: 1,
                job_lease: Duration::from_secs(60),
                job_max_deliveries: 3,
                job_keep_completed: 10,
                pipeline,
            },
            queue: Arc::new(JobQueue::new(Duration::from_secs(60), 3)),
            query: Arc::new(query),
            index,
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
        }
    }

    fn chat(message: &str) -> Json<ChatPayload> {
        Json(ChatPayload { message: message.to_string() })
    }

    #[tokio::test]
    async fn blank_chat_message_is_a_bad_request() {
        let Err((status, Json(body))) = chat_handler(State(state()), chat("   ")).await else {
            panic!("una pregunta vacía no debe responderse");
        };
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("vacía"));
    }

    #[tokio::test]
    async fn chat_message_is_answered_through_the_query_service() {
        let Ok(Json(reply)) = chat_handler(State(state()), chat(" ¿Qué es una bomba? ")).await else {
            panic!("la consulta debe responderse");
        };
        assert!(!reply.grounded);
        assert!(reply.error.is_none());
        assert!(reply.reply.starts_with("eco: "));
        assert!(reply.reply.contains("¿Qué es una bomba?"));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let Err((status, _)) = get_job_handler(State(state()), Path(Uuid::new_v4())).await else {
            panic!("el trabajo no existe");
        };
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
