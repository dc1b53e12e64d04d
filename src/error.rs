//! Taxonomía de errores del pipeline de ingesta y del camino de consulta.
//!
//! La distinción importante es transitorio / no transitorio: sólo los
//! errores transitorios se reintentan (ver `retry`).

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum RagError {
    /// Entrada mal formada (p. ej. pregunta vacía). Nunca se reintenta.
    #[error("Entrada no válida: {0}")]
    Validation(String),

    /// Timeout, rate limit o fallo de red contra un servicio externo.
    #[error("Error transitorio en {service}: {message}")]
    Transient { service: String, message: String },

    /// La dimensión (o métrica) no coincide con la de una colección existente.
    #[error("Conflicto de configuración en la colección '{collection}': {message}")]
    ConfigurationConflict { collection: String, message: String },

    /// El documento o la colección no existen.
    #[error("No encontrado: {0}")]
    NotFound(String),

    /// Documento ilegible o en un formato no soportado.
    #[error("Documento no decodificable '{location}': {message}")]
    MalformedDocument { location: String, message: String },

    /// Error definitivo de un servicio externo (entrada inválida, cuota agotada...).
    #[error("Error permanente en {service}: {message}")]
    Permanent { service: String, message: String },

    /// Algunos puntos no se pudieron escribir en el índice.
    #[error("Upsert parcial: fallaron {} puntos", failed.len())]
    PartialUpsert { failed: Vec<(Uuid, String)> },

    #[error("Error interno: {0}")]
    Internal(String),
}

impl RagError {
    pub fn transient(service: impl Into<String>, message: impl ToString) -> Self {
        Self::Transient { service: service.into(), message: message.to_string() }
    }

    pub fn permanent(service: impl Into<String>, message: impl ToString) -> Self {
        Self::Permanent { service: service.into(), message: message.to_string() }
    }

    pub fn conflict(collection: impl Into<String>, message: impl ToString) -> Self {
        Self::ConfigurationConflict { collection: collection.into(), message: message.to_string() }
    }

    /// Sólo los errores transitorios se reintentan. Un upsert parcial también,
    /// porque los puntos pendientes se vuelven a escribir por id.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::PartialUpsert { .. })
    }

    /// Nombre corto de la categoría, útil para logs y para la API.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transient { .. } => "transient_dependency",
            Self::ConfigurationConflict { .. } => "configuration_conflict",
            Self::NotFound(_) => "not_found",
            Self::MalformedDocument { .. } => "malformed_document",
            Self::Permanent { .. } => "permanent_dependency",
            Self::PartialUpsert { .. } => "partial_upsert",
            Self::Internal(_) => "internal",
        }
    }
}

/// Clasifica el mensaje de error de un proveedor externo.
///
/// Los proveedores no exponen un código estructurado homogéneo, así que se
/// buscan las señales habituales de fallo temporal en el texto.
pub fn classify_provider_message(service: &str, message: &str) -> RagError {
    let lower = message.to_lowercase();
    let permanent_markers = ["insufficient_quota", "quota exceeded", "invalid_api_key", "401", "403"];
    if permanent_markers.iter().any(|m| lower.contains(m)) {
        return RagError::permanent(service, message);
    }
    let transient_markers = [
        "timeout",
        "timed out",
        "rate limit",
        "429",
        "500",
        "502",
        "503",
        "504",
        "connection",
        "error sending request",
        "temporarily",
        "overloaded",
    ];
    if transient_markers.iter().any(|m| lower.contains(m)) {
        RagError::transient(service, message)
    } else {
        RagError::permanent(service, message)
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
