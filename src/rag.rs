//! Consulta RAG contra el índice vectorial.
//!
//! Flujo:
//!   1. Embedding de la pregunta con el mismo adaptador que la ingesta.
//!   2. Búsqueda de los `top_k` chunks más parecidos.
//!   3. Contexto acotado con los textos en orden de similitud.
//!   4. El LLM responde sólo con ese contexto o declara que no lo sabe.
//!
//! Si el índice está vacío o no responde se llama igualmente al LLM con el
//! contexto vacío; `Answer::is_grounded` permite detectarlo.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::PipelineConfig,
    embedding::EmbeddingAdapter,
    error::{RagError, Result},
    llm::ChatModel,
    models::SearchHit,
    vector_store::VectorIndex,
};

pub const SYSTEM_PROMPT: &str = r#"
Eres un asistente experto en RAG.
Respondes en el idioma de la pregunta, de forma clara y concisa.
Sólo puedes usar la información suministrada en el contexto.
Si el contexto está vacío o no contiene la respuesta, di explícitamente que no tienes información suficiente para responder. No inventes datos.
"#;

/// Respuesta genérica cuando la consulta falla.
pub const FAILURE_REPLY: &str =
    "No se ha podido procesar la pregunta en este momento. Inténtalo de nuevo más tarde.";

const EMPTY_CONTEXT: &str = "(sin contexto disponible)";
const SEPARATOR: &str = "\n\n---\n\n";

/// Fragmento recuperado que formó parte del contexto.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPassage {
    pub source: String,
    pub chunk_index: usize,
    pub score: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub reply: String,
    pub context: Vec<ContextPassage>,
}

impl Answer {
    /// `false` si la respuesta se generó sin ningún fragmento recuperado.
    pub fn is_grounded(&self) -> bool {
        !self.context.is_empty()
    }
}

/// Respuesta que siempre llega al usuario, incluso si la consulta falla.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub reply: String,
    pub grounded: bool,
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Answer> for Reply {
    fn from(answer: Answer) -> Self {
        let grounded = answer.is_grounded();
        let mut sources: Vec<String> = Vec::new();
        for passage in answer.context {
            if !sources.contains(&passage.source) {
                sources.push(passage.source);
            }
        }
        Self { reply: answer.reply, grounded, sources, error: None }
    }
}

impl Reply {
    /// Respuesta genérica con el motivo del fallo.
    pub fn failure(err: &RagError) -> Self {
        Self {
            reply: FAILURE_REPLY.to_string(),
            grounded: false,
            sources: Vec::new(),
            error: Some(err.to_string()),
        }
    }
}

pub struct QueryService {
    embeddings: EmbeddingAdapter,
    index: Arc<dyn VectorIndex>,
    chat: Arc<dyn ChatModel>,
    config: PipelineConfig,
}

/// Pregunta sin espacios en los extremos; vacía es un error de validación.
pub fn validate_question(question: &str) -> Result<&str> {
    let question = question.trim();
    if question.is_empty() {
        return Err(RagError::Validation("la pregunta está vacía".to_string()));
    }
    Ok(question)
}

impl QueryService {
    pub fn new(
        embeddings: EmbeddingAdapter,
        index: Arc<dyn VectorIndex>,
        chat: Arc<dyn ChatModel>,
        config: PipelineConfig,
    ) -> Self {
        Self { embeddings, index, chat, config }
    }

    pub async fn answer(&self, question: &str) -> Result<Answer> {
        let question = validate_question(question)?;
        let retry = self.config.retry;

        // 1) Embedding de la pregunta
        let query_vec = retry.run("embed_query", |_| self.embeddings.embed(question)).await?;

        // 2) Búsqueda vectorial
        let hits = self.retrieve(&query_vec).await?;

        // 3) Contexto acotado
        let (context_block, context) = build_context(&hits, self.config.context_max_chars);
        debug!(passages = context.len(), chars = context_block.chars().count(), "Contexto construido");

        // 4) Preguntar al LLM
        let user_message = format!(
            "Contexto:\n{}\n\nPregunta del usuario:\n{}",
            if context_block.is_empty() { EMPTY_CONTEXT } else { context_block.as_str() },
            question
        );
        let timeout = self.config.model_timeout;
        let reply = retry
            .run("chat", |_| async {
                tokio::time::timeout(timeout, self.chat.complete(SYSTEM_PROMPT, &user_message))
                    .await
                    .map_err(|_| RagError::transient("chat", format!("sin respuesta tras {timeout:?}")))?
            })
            .await?;

        info!(grounded = !context.is_empty(), passages = context.len(), "Consulta RAG respondida");
        Ok(Answer { reply, context })
    }

    /// Como `answer`, pero nunca falla: los errores se convierten en una
    /// respuesta genérica con el motivo en `error`.
    pub async fn reply(&self, question: &str) -> Reply {
        match self.answer(question).await {
            Ok(answer) => answer.into(),
            Err(err) => {
                error!(kind = err.kind(), "Error al procesar la consulta RAG: {err}");
                Reply::failure(&err)
            }
        }
    }

    /// Busca en la colección. Sólo un conflicto de dimensión corta la
    /// consulta; una colección ausente o inaccesible degrada a contexto vacío.
    async fn retrieve(&self, query_vec: &[f64]) -> Result<Vec<SearchHit>> {
        let collection = &self.config.collection;
        match self.index.describe(collection).await {
            Ok(Some(spec)) if spec.dimension != query_vec.len() => {
                let err = RagError::conflict(
                    collection,
                    format!(
                        "la colección tiene dimensión {} y el modelo de embeddings '{}' produce {}",
                        spec.dimension,
                        self.embeddings.model_name(),
                        query_vec.len()
                    ),
                );
                error!("{err}");
                Err(err)
            }
            Ok(Some(_)) => match self.index.search(collection, query_vec, self.config.top_k).await {
                Ok(hits) => Ok(hits),
                Err(e) => {
                    warn!(collection = %collection, "Búsqueda fallida, se responde sin contexto: {e}");
                    Ok(Vec::new())
                }
            },
            Ok(None) => {
                info!(collection = %collection, "La colección aún no existe, se responde sin contexto");
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(collection = %collection, "Índice inaccesible, se responde sin contexto: {e}");
                Ok(Vec::new())
            }
        }
    }
}

/// Concatena los textos en orden de similitud sin pasar de `max_chars`.
/// El primer fragmento se recorta si no cabe entero; los siguientes que no
/// caben se descartan.
pub fn build_context(hits: &[SearchHit], max_chars: usize) -> (String, Vec<ContextPassage>) {
    let mut block = String::new();
    let mut used = 0;
    let mut passages = Vec::new();

    for hit in hits {
        let separator = if passages.is_empty() { 0 } else { SEPARATOR.chars().count() };
        let len = hit.payload.text.chars().count();
        let text = if used + separator + len <= max_chars {
            hit.payload.text.clone()
        } else if passages.is_empty() && max_chars > 0 {
            hit.payload.text.chars().take(max_chars).collect()
        } else {
            break;
        };

        if !passages.is_empty() {
            block.push_str(SEPARATOR);
        }
        used += separator + text.chars().count();
        block.push_str(&text);
        passages.push(ContextPassage {
            source: hit.payload.source.clone(),
            chunk_index: hit.payload.chunk_index,
            score: hit.score,
            text,
        });
    }

    (block, passages)
}
