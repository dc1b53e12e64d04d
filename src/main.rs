use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::Router;
use rag_ingest_queue::{
    api,
    app_state::AppState,
    config::{AppConfig, VectorBackend},
    embedding::EmbeddingAdapter,
    inmemory::InMemoryVectorIndex,
    ingest::IngestionPipeline,
    llm::LlmManager,
    loader::FsDocumentLoader,
    neo4j_client,
    queue::JobQueue,
    rag::QueryService,
    vector_store::{Neo4jVectorIndex, VectorIndex},
    worker::WorkerPool,
};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;
    tokio::fs::create_dir_all(&cfg.upload_dir)
        .await
        .with_context(|| format!("No se pudo crear {}", cfg.upload_dir.display()))?;

    // 3. Índice vectorial
    let index: Arc<dyn VectorIndex> = match (&cfg.vector_backend, &cfg.neo4j) {
        (VectorBackend::Neo4j, Some(neo4j_cfg)) => {
            let graph = neo4j_client::connect_from_config(neo4j_cfg)
                .await
                .context("Error conectando a Neo4j")?;
            Arc::new(Neo4jVectorIndex::new(Arc::new(graph)))
        }
        _ => {
            info!("Usando índice vectorial en memoria (no persistente)");
            Arc::new(InMemoryVectorIndex::new())
        }
    };

    // 4. Clientes de LLM, compartidos por ingesta y consulta
    let llm_manager = LlmManager::from_config(&cfg).context("Error inicializando LLM Manager")?;
    let embeddings = EmbeddingAdapter::new(llm_manager.embedder.clone(), cfg.pipeline.embedding);

    // 5. Cola de trabajos y workers
    let queue = Arc::new(
        JobQueue::new(cfg.job_lease, cfg.job_max_deliveries)
            .with_completed_retention(cfg.job_keep_completed),
    );
    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::new(FsDocumentLoader),
        embeddings.clone(),
        index.clone(),
        cfg.pipeline.clone(),
    ));
    let reap_every = (cfg.job_lease / 4).max(std::time::Duration::from_secs(1));
    let pool = WorkerPool::spawn(queue.clone(), pipeline, cfg.worker_count, reap_every);

    let query = Arc::new(QueryService::new(
        embeddings,
        index.clone(),
        llm_manager.chat.clone(),
        cfg.pipeline.clone(),
    ));

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 6. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        queue,
        query,
        index,
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 7. Configurar el router de la API
    let app = Router::new()
        .merge(api::create_router(app_state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 8. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    // Configurar el apagado ordenado: Ctrl+C o /api/shutdown.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::select! {
                _ = shutdown_rx => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .context("Error en el servidor HTTP")?;

    // Los trabajos en curso terminan; los pendientes se pierden con el proceso.
    pool.shutdown().await;
    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
