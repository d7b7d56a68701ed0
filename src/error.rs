//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore custom dell'applicazione.
//!
//! ## Responsabilità:
//! - Definisce `ConvertError` enum per categorizzare tutti gli errori possibili
//! - Espone `ErrorKind`, la categoria dichiarata usata dalle statistiche
//! - Classifica gli errori di I/O tramite `io::ErrorKind` (mai tramite il testo)
//!
//! ## Categorie di errori:
//! - `CorruptedImage`: Immagine illeggibile o danneggiata
//! - `UnsupportedFormat`: Formato non supportato dal codec
//! - `PermissionDenied`: Permessi insufficienti su file o directory
//! - `SourceNotFound`: File o directory sorgente inesistente
//! - `AlreadyInTargetFormat`: Il file è già nel formato richiesto (conteggiato come skip)
//! - `Fatal`: Condizione che blocca l'intero batch (es. disco pieno)
//! - `Validation`: Errori di validazione input
//! - `Other`: Tutto il resto
//!
//! ## Esempio:
//! ```rust,ignore
//! let err = ConvertError::from_io(&io_err, "failed to stat file");
//! match err.kind() {
//!     ErrorKind::PermissionDenied => { /* ... */ }
//!     _ => {}
//! }
//! ```

use std::io;

/// Declared category of a [`ConvertError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CorruptedImage,
    UnsupportedFormat,
    PermissionDenied,
    SourceNotFound,
    AlreadyInTargetFormat,
    Fatal,
    Other,
}

/// Custom error types for image conversion
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("corrupted image: {0}")]
    CorruptedImage(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("file already in target format")]
    AlreadyInTargetFormat,

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("File validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CorruptedImage(_) => ErrorKind::CorruptedImage,
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::SourceNotFound(_) => ErrorKind::SourceNotFound,
            Self::AlreadyInTargetFormat => ErrorKind::AlreadyInTargetFormat,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Validation(_) | Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Classify an I/O error by its `io::ErrorKind`, prefixing `context`.
    pub fn from_io(err: &io::Error, context: &str) -> Self {
        let message = format!("{}: {}", context, err);
        match err.kind() {
            io::ErrorKind::NotFound => Self::SourceNotFound(message),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(message),
            io::ErrorKind::StorageFull => Self::Fatal(message),
            _ => Self::Other(message),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
