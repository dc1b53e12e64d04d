//! Carga de documentos: de una ubicación en disco a texto plano.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use mime_guess::MimeGuess;
use tracing::debug;

use crate::error::{RagError, Result};
use crate::models::Document;

/// Extensiones de texto que se leen directamente como UTF-8.
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "rs", "toml", "log", "html", "css", "js", "json", "csv"];

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Lee y extrae el texto. Un fichero inexistente es `NotFound`; uno
    /// ilegible o de tipo no soportado, `MalformedDocument`.
    async fn load(&self, location: &Path, media_type: Option<&str>) -> Result<Document>;
}

/// Indica si el loader sabe extraer texto de este fichero.
pub fn is_supported(path: &Path) -> bool {
    matches!(DocumentKind::detect(path, None), DocumentKind::Pdf | DocumentKind::Text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentKind {
    Pdf,
    Text,
    Unsupported,
}

impl DocumentKind {
    /// El tipo declarado manda; si no hay, se deduce de la extensión.
    fn detect(path: &Path, declared: Option<&str>) -> Self {
        let mime = declared
            .map(str::to_string)
            .or_else(|| MimeGuess::from_path(path).first().map(|m| m.essence_str().to_string()));

        if mime.as_deref() == Some("application/pdf") {
            return Self::Pdf;
        }
        if mime.as_deref().is_some_and(|m| m.starts_with("text/")) {
            return Self::Text;
        }
        let extension = path
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or("")
            .to_lowercase();
        match extension.as_str() {
            "pdf" => Self::Pdf,
            ext if TEXT_EXTENSIONS.contains(&ext) => Self::Text,
            _ => Self::Unsupported,
        }
    }
}

/// Loader sobre el sistema de ficheros local: PDF (pdf-extract) y texto UTF-8.
#[derive(Debug, Default, Clone)]
pub struct FsDocumentLoader;

impl FsDocumentLoader {
    fn extract(path: &Path, kind: DocumentKind) -> Result<String> {
        let malformed = |message: String| RagError::MalformedDocument {
            location: path.display().to_string(),
            message,
        };
        match kind {
            DocumentKind::Pdf => pdf_extract::extract_text(path)
                .map_err(|e| malformed(format!("no se pudo extraer texto del PDF: {e}"))),
            DocumentKind::Text => fs::read_to_string(path)
                .map_err(|e| malformed(format!("no es texto UTF-8: {e}"))),
            DocumentKind::Unsupported => Err(malformed("tipo de fichero no soportado".to_string())),
        }
    }
}

#[async_trait]
impl DocumentLoader for FsDocumentLoader {
    async fn load(&self, location: &Path, media_type: Option<&str>) -> Result<Document> {
        if !location.is_file() {
            return Err(RagError::NotFound(location.display().to_string()));
        }

        let kind = DocumentKind::detect(location, media_type);
        let path = location.to_path_buf();
        // pdf-extract es bloqueante y puede entrar en pánico con PDFs corruptos.
        let text = tokio::task::spawn_blocking(move || Self::extract(&path, kind))
            .await
            .map_err(|e| RagError::MalformedDocument {
                location: location.display().to_string(),
                message: format!("la extracción de texto abortó: {e}"),
            })??;

        debug!(location = %location.display(), chars = text.chars().count(), "Documento cargado");
        Ok(Document {
            location: location.to_path_buf(),
            media_type: media_type
                .map(str::to_string)
                .or_else(|| MimeGuess::from_path(location).first().map(|m| m.to_string())),
            text,
        })
    }
}
