//! Pipeline RAG: ingesta asíncrona de documentos mediante una cola de
//! trabajos y consultas respondidas con contexto recuperado de un índice
//! vectorial.

pub mod api;
pub mod app_state;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod inmemory;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod models;
pub mod neo4j_client;
pub mod queue;
pub mod rag;
pub mod retry;
pub mod vector_store;
pub mod worker;
