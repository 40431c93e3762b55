//! Error types for configuration and startup.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A setting is missing or out of range
    #[error("Configuration error: {0}")]
    Config(String),

    /// A credential secret is present but unusable
    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for setting and credential problems, looking through context.
    pub fn is_config(&self) -> bool {
        match self {
            Self::Config(_) | Self::Credentials(_) => true,
            Self::WithContext { source, .. } => source.is_config(),
            _ => false,
        }
    }
}

pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
