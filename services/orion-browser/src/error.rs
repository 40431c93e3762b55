//! Error types for orion-browser.

/// Browser and cookie errors.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Navigation timeout: {url}")]
    NavigationTimeout { url: String },

    #[error("Navigation failed: {url} - {reason}")]
    NavigationFailed { url: String, reason: String },

    #[error("Global deadline reached before the harvest could start")]
    DeadlineExceeded,

    #[error("Invalid cookie data: {0}")]
    InvalidCookies(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrowserError {
    /// Whether a later harvest attempt could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NavigationTimeout { .. } | Self::NavigationFailed { .. }
        )
    }
}
