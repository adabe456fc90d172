//! Custom error types for the translation pipeline

use thiserror::Error;

/// Pipeline-level errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed source document; nothing is persisted
    #[error("parse error: {message}")]
    ParseError {
        message: String,
    },

    /// A single image asset failed to decode; decomposition continues
    #[error("asset error ({id}): {message}")]
    AssetError {
        id: String,
        message: String,
    },

    /// No mapping exists at the given location
    #[error("mapping not found: {path}")]
    NotFoundError {
        path: String,
    },

    /// Persisted mapping documents are partial or inconsistent
    #[error("mapping corrupted: {message}")]
    CorruptionError {
        message: String,
    },

    /// Export attempted while units are still untranslated
    #[error("incomplete translation: {} unit(s) unresolved, first: {}",
            missing.len(),
            missing.first().map(String::as_str).unwrap_or("<none>"))]
    IncompleteTranslationError {
        missing: Vec<String>,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    ConfigError {
        message: String,
    },

    /// Translation backend failure, already classified
    #[error("translation failed: {0}")]
    TranslationError(#[from] TranslateError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Archive error
    #[error("archive error: {0}")]
    ZipError(#[from] zip::result::ZipError),
}

/// Errors returned by the translation backend.
///
/// Clone is required so the smart cache can hand the same failure to every
/// waiter that joined an in-flight resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// Retriable backend fault (rate limit, 5xx, network)
    #[error("transient backend failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<u64>,
    },

    /// Attempt exceeded its timeout; retriable
    #[error("request timed out after {ms} ms")]
    Timeout {
        ms: u64,
    },

    /// Non-retriable failure (invalid input, auth, quota)
    #[error("permanent backend failure: {message}")]
    Permanent {
        message: String,
    },
}

impl TranslateError {
    /// Whether the retry policy applies to this failure
    pub fn is_transient(&self) -> bool {
        !matches!(self, TranslateError::Permanent { .. })
    }

    /// Short machine-readable kind, used in batch summaries
    pub fn kind(&self) -> &'static str {
        match self {
            TranslateError::Transient { .. } => "transient",
            TranslateError::Timeout { .. } => "timeout",
            TranslateError::Permanent { .. } => "permanent",
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
