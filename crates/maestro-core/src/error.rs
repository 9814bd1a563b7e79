use thiserror::Error;

pub type MaestroResult<T> = Result<T, MaestroError>;

/// Error taxonomy shared across every Maestro service.
///
/// The variants map one-to-one onto the platform's handling policy:
/// [`Transient`](MaestroError::Transient) errors are retried by the bus with
/// exponential backoff, [`Permanent`](MaestroError::Permanent) errors publish
/// a terminal `*.failed` event, [`StaleVersion`](MaestroError::StaleVersion)
/// triggers a bounded reload-and-retry, and cache-tier
/// [`Unavailable`](MaestroError::Unavailable) is always recoverable by falling
/// through to the durable tier.
#[derive(Debug, Error)]
pub enum MaestroError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("{tier} unavailable: {reason}")]
    Unavailable { tier: String, reason: String },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("stale version for '{key}': expected {expected}, stored {stored}")]
    StaleVersion {
        key: String,
        expected: u64,
        stored: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("queue '{queue}' overflow at {limit} messages")]
    QueueOverflow { queue: String, limit: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaestroError {
    /// Shorthand for an [`Unavailable`](MaestroError::Unavailable) error on a
    /// named tier ("cache", "durable", "broker").
    pub fn unavailable(tier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            tier: tier.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry can be expected to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MaestroError::Transient(_)
                | MaestroError::Unavailable { .. }
                | MaestroError::Timeout(_)
                | MaestroError::QueueOverflow { .. }
        )
    }
}
