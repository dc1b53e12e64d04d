mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{adapter, test_config, BrokenChat, FakeChat, FakeEmbedder, FakeLoader, UnreachableIndex, INSUFFICIENT};
use rag_ingest_queue::{
    config::PipelineConfig,
    error::RagError,
    inmemory::InMemoryVectorIndex,
    ingest::IngestionPipeline,
    models::{CollectionSpec, Metric},
    queue::JobQueue,
    rag::{QueryService, FAILURE_REPLY},
    vector_store::VectorIndex,
};
use tokio_test::{assert_err, assert_ok};

const BOMBA: &str = "La bomba se revisa cada seis meses.";
const FILTRO: &str = "El filtro de aire se cambia cada año.";

/// Indexa cada documento con el mismo embedder que usará la consulta.
async fn indexed(documents: &[(&str, &str)], embedder: Arc<FakeEmbedder>) -> Arc<InMemoryVectorIndex> {
    let index = Arc::new(InMemoryVectorIndex::new());
    let loader = documents
        .iter()
        .fold(FakeLoader::default(), |loader, (path, text)| loader.with_document(path, text));
    let pipeline = IngestionPipeline::new(Arc::new(loader), adapter(embedder), index.clone(), test_config());
    let queue = JobQueue::new(Duration::from_secs(60), 3);
    for (path, _) in documents {
        queue.submit(*path, None);
        let delivery = queue.try_claim().unwrap();
        assert_ok!(pipeline.run(&delivery.job).await);
    }
    index
}

fn service(index: Arc<dyn VectorIndex>, embedder: Arc<FakeEmbedder>, chat: Arc<FakeChat>, config: PipelineConfig) -> QueryService {
    QueryService::new(adapter(embedder), index, chat, config)
}

#[tokio::test]
async fn empty_index_yields_an_insufficient_context_reply() {
    let chat = Arc::new(FakeChat::default());
    let service = service(Arc::new(InMemoryVectorIndex::new()), Arc::new(FakeEmbedder::new(16)), chat.clone(), test_config());

    let answer = assert_ok!(service.answer("¿Cada cuánto se revisa la bomba?").await);
    assert_eq!(answer.reply, INSUFFICIENT);
    assert!(!answer.is_grounded());

    let messages = chat.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("(sin contexto disponible)"));
    assert!(messages[0].contains("¿Cada cuánto se revisa la bomba?"));
}

#[tokio::test]
async fn most_similar_chunk_comes_first_in_the_context() {
    let embedder = Arc::new(FakeEmbedder::new(16));
    let index = indexed(&[("docs/filtro.txt", FILTRO), ("docs/bomba.txt", BOMBA)], embedder.clone()).await;
    let chat = Arc::new(FakeChat::default());
    let service = service(index, embedder, chat.clone(), test_config());

    let answer = assert_ok!(service.answer(BOMBA).await);
    assert!(answer.is_grounded());
    assert_eq!(answer.context[0].source, "docs/bomba.txt");
    assert!(answer.context.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(answer.reply.contains(BOMBA));

    let reply = service.reply(BOMBA).await;
    assert!(reply.grounded);
    assert_eq!(reply.sources[0], "docs/bomba.txt");
    assert!(reply.error.is_none());
}

#[tokio::test]
async fn context_respects_the_character_limit() {
    let embedder = Arc::new(FakeEmbedder::new(16));
    let index = indexed(&[("docs/filtro.txt", FILTRO), ("docs/bomba.txt", BOMBA)], embedder.clone()).await;
    let config = PipelineConfig { context_max_chars: 20, ..test_config() };
    let service = service(index, embedder, Arc::new(FakeChat::default()), config);

    let answer = assert_ok!(service.answer(BOMBA).await);
    assert_eq!(answer.context.len(), 1);
    assert_eq!(answer.context[0].text.chars().count(), 20);
}

#[tokio::test]
async fn blank_question_is_rejected() {
    let chat = Arc::new(FakeChat::default());
    let service = service(Arc::new(InMemoryVectorIndex::new()), Arc::new(FakeEmbedder::new(16)), chat.clone(), test_config());

    let err = assert_err!(service.answer("   ").await);
    assert!(matches!(err, RagError::Validation(_)));
    assert!(chat.messages.lock().unwrap().is_empty());

    let reply = service.reply("").await;
    assert_eq!(reply.reply, FAILURE_REPLY);
    assert!(reply.error.is_some());
}

#[tokio::test]
async fn collection_with_another_dimension_is_a_configuration_conflict() {
    let index = Arc::new(InMemoryVectorIndex::new());
    let spec = CollectionSpec { name: "test_chunks".into(), dimension: 8, metric: Metric::Cosine };
    assert_ok!(index.ensure_collection(&spec).await);
    let chat = Arc::new(FakeChat::default());
    let service = service(index, Arc::new(FakeEmbedder::new(16)), chat.clone(), test_config());

    let err = assert_err!(service.answer("¿Qué presión se comprueba?").await);
    assert!(matches!(err, RagError::ConfigurationConflict { .. }));
    assert!(chat.messages.lock().unwrap().is_empty());

    let reply = service.reply("¿Qué presión se comprueba?").await;
    assert_eq!(reply.reply, FAILURE_REPLY);
    assert!(!reply.grounded);
}

#[tokio::test]
async fn unreachable_index_degrades_to_an_empty_context() {
    let chat = Arc::new(FakeChat::default());
    let service = service(Arc::new(UnreachableIndex), Arc::new(FakeEmbedder::new(16)), chat, test_config());

    let answer = assert_ok!(service.answer("¿Cada cuánto se cambia el filtro?").await);
    assert_eq!(answer.reply, INSUFFICIENT);
    assert!(!answer.is_grounded());
}

#[tokio::test]
async fn chat_failure_becomes_the_generic_reply() {
    let service = QueryService::new(
        adapter(Arc::new(FakeEmbedder::new(16))),
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(BrokenChat),
        test_config(),
    );

    let err = assert_err!(service.answer("¿Hola?").await);
    assert_eq!(err.kind(), "permanent_dependency");

    let reply = service.reply("¿Hola?").await;
    assert_eq!(reply.reply, FAILURE_REPLY);
    assert!(reply.error.unwrap().contains("invalid_api_key"));
}
