use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecboxError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Request errors (rejected before anything is allocated)
    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    #[error("Invalid output type '{spec}': expected \"void\" or a file extension")]
    InvalidOutputSpec { spec: String },

    // Workspace errors
    #[error("Workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid input file name: {name:?}")]
    InvalidInputName { name: String },

    // Execution environment errors
    #[error("Container runtime not available: {0}")]
    RuntimeUnavailable(String),

    #[error("Failed to {operation} unit '{unit}': {message}")]
    EnvironmentControl {
        operation: &'static str,
        unit: String,
        message: String,
    },

    // Output retrieval errors
    #[error("Output retrieval failed: {0}")]
    Retrieval(String),

    #[error("Execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecboxError {
    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn control(
        operation: &'static str,
        unit: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::EnvironmentControl {
            operation,
            unit: unit.into(),
            message: message.to_string(),
        }
    }

    /// Errors caused by the request itself rather than by the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedLanguage { .. }
                | Self::InvalidOutputSpec { .. }
                | Self::InvalidInputName { .. }
        )
    }

    /// HTTP status a calling layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            _ if self.is_client_error() => 400,
            Self::Timeout { .. } => 504,
            Self::RuntimeUnavailable(_) => 503,
            _ => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RuntimeUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, ExecboxError>;
