use thiserror::Error;

use crate::resources::ResourceKey;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the virtual cluster engine.
///
/// Everything here is recoverable. The periodic driver logs a failed tick and
/// retries on the next period; callers of the query surface get the error back.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The manifest text could not be parsed into resource declarations.
    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceKey),

    /// Delivery to a single subscriber failed. Handled inside the hub by
    /// dropping that subscriber; never propagated to other subscribers.
    #[error("Delivery to subscriber {subscriber_id} failed: {reason}")]
    DeliveryFailure { subscriber_id: u64, reason: String },

    /// A shared lock was poisoned by a panicking writer.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    pub(crate) fn poisoned(what: &str) -> Self {
        EngineError::StoreUnavailable(format!("{what} lock poisoned"))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
