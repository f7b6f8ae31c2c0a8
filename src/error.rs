use std::sync::Arc;

/// Represents a result type for fallible operations in this crate.
///
/// Only construction and shutdown paths return errors. Event delivery and listener notification
/// never surface errors to the calling thread.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while setting up or tearing down the client.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid events base URL configuration.
    #[error("invalid events base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// A configured HTTP header name or value cannot be sent.
    #[error("invalid HTTP header: {0}")]
    InvalidHeader(String),

    /// Indicates that one of the background threads panicked. This should normally never happen.
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),

    /// An I/O error, usually a failure to spawn a background thread.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// HTTP client error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::InvalidBaseUrl(value)
    }
}
