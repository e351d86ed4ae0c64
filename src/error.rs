use std::sync::Arc;

/// Result type used throughout the Clutch SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Clutch SDK.
///
/// None of these are fatal to the host application. Business-level operations (running a test,
/// reaching a goal) never return them; they are surfaced from lower-level building blocks such as
/// [`Store`](crate::Store) and [`SyncEngine`](crate::SyncEngine) for debugging.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The local database could not be opened or created. The store stays unavailable for the
    /// rest of the process lifetime.
    #[error("local store is unavailable")]
    StoreUnavailable,

    /// SQLite error while reading or writing the local store.
    #[error(transparent)]
    // rusqlite::Error is not clonable, so we're wrapping it in an Arc.
    Store(Arc<rusqlite::Error>),

    /// Invalid `rpc_url` configuration.
    #[error("invalid rpc_url configuration")]
    InvalidRpcUrl(#[source] url::ParseError),

    /// Invalid `tunnel_url` configuration.
    #[error("invalid tunnel_url configuration")]
    InvalidTunnelUrl(#[source] url::ParseError),

    /// A tunnel poll was requested but no `tunnel_url` was configured.
    #[error("tunnel_url is not configured")]
    TunnelNotConfigured,

    /// The request was unauthorized, possibly due to an invalid app key.
    #[error("unauthorized, app_key is likely invalid")]
    Unauthorized,

    /// The server answered a remote method call with an error object.
    #[error("remote method {method} failed: {message}")]
    Remote {
        /// Name of the remote method.
        method: String,
        /// Error reported by the server.
        message: String,
    },

    /// The server answered with a non-success HTTP status.
    #[error("server returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: Arc<Vec<u8>>,
    },

    /// The server response could not be interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A content file name would escape the content directory.
    #[error("invalid content file name: {0:?}")]
    InvalidFileName(String),

    /// A sync request panicked. This should normally never happen.
    #[error("sync request panicked")]
    SyncPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// JSON encoding or decoding error.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
