//! Modelos externos sobre Rig: embeddings y chat con OpenAI detrás de los
//! traits `Embedder` y `ChatModel`.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel as _; // <- para .embed_texts
use rig::providers::openai;

use crate::config::{AppConfig, LlmProvider};
use crate::embedding::Embedder;
use crate::error::{self, classify_provider_message};
use crate::models::EmbeddingVector;

/// Modelo de chat externo: instrucción de sistema + mensaje del usuario.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> error::Result<String>;
}

/// Gestor de LLMs y embeddings. Construye una sola vez los clientes del
/// proveedor configurado y los entrega como trait objects.
#[derive(Clone)]
pub struct LlmManager {
    pub embedder: Arc<dyn Embedder>,
    pub chat: Arc<dyn ChatModel>,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        match cfg.llm_provider {
            LlmProvider::OpenAI => {
                // `Client::from_env` aborta si falta la clave.
                if std::env::var("OPENAI_API_KEY").map_or(true, |k| k.trim().is_empty()) {
                    return Err(anyhow!("Falta OPENAI_API_KEY en el entorno"));
                }
                let client = openai::Client::from_env();
                Ok(Self {
                    embedder: Arc::new(RigEmbedder {
                        client: client.clone(),
                        model: cfg.llm_embedding_model.clone(),
                        dimension: cfg.llm_embedding_dimensions,
                    }),
                    chat: Arc::new(RigChatModel { client, model: cfg.llm_chat_model.clone() }),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------
// EMBEDDINGS
// ---------------------------------------------------------------------

pub struct RigEmbedder {
    client: openai::Client,
    model: String,
    dimension: usize,
}

#[async_trait]
impl Embedder for RigEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> error::Result<Vec<EmbeddingVector>> {
        // Trait para client.embedding_model(...)
        use rig::client::EmbeddingsClient as _;

        let embedding_model = self.client.embedding_model(&self.model);
        let embeddings = embedding_model
            .embed_texts(texts.to_vec())
            .await
            .map_err(|e| classify_provider_message("embeddings", &e.to_string()))?;

        Ok(embeddings.into_iter().map(|emb| emb.vec).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------
// CHAT / COMPLETION
// ---------------------------------------------------------------------

pub struct RigChatModel {
    client: openai::Client,
    model: String,
}

#[async_trait]
impl ChatModel for RigChatModel {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> error::Result<String> {
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        let agent = self.client.agent(&self.model).preamble(system_prompt).build();

        agent
            .prompt(user_message)
            .await
            .map_err(|e| classify_provider_message("chat", &e.to_string()))
    }
}
