//! Error types for etcd-discovery.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The entry already exists: a create-if-absent registration lost the race.
    #[error("service already registered")]
    AlreadyRegistered,

    /// The entry no longer exists: it expired or was removed elsewhere.
    #[error("service not registered")]
    NotRegistered,

    /// Operation on a discoverer after [`close`](crate::Discoverer::close).
    #[error("discoverer is closed")]
    Closed,

    /// Registration TTLs must round to at least one whole second.
    #[error("registration ttl must be at least one second")]
    InvalidTtl,

    /// No endpoints were supplied to a constructor.
    #[error("no endpoints provided")]
    NoEndpoints,

    /// HTTP transport error from the v2 keys API.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// etcd v3 client error.
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// A v2 keys API error with no dedicated mapping.
    #[error("keys api error {code}: {message}")]
    Api {
        /// Error code reported by the store (or the bare HTTP status when
        /// the response body carried no error document).
        code: u64,
        /// Server-provided message.
        message: String,
    },
}
