//! Centralized error types for the indexer

use thiserror::Error;

/// Main indexer error type
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Market not found: {key}")]
    MarketUnknown { key: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Transaction receipt not found after {attempts} attempts: {tx_hash}")]
    ReceiptNotFound { tx_hash: String, attempts: u32 },

    #[error("Subscription stream error: {0}")]
    Subscription(String),

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result type alias for indexer operations
pub type IndexerResult<T> = Result<T, IndexerError>;

impl IndexerError {
    /// True when the error looks like an upstream rate limit. The gateway
    /// inspects the full rendered message chain, including nested short
    /// messages from RPC providers.
    pub fn is_rate_limited(&self) -> bool {
        let text = self.to_string().to_lowercase();
        text.contains("rate limit") || text.contains("429") || text.contains("too many requests")
    }
}

/// Helper to convert sqlx errors
impl From<sqlx::Error> for IndexerError {
    fn from(err: sqlx::Error) -> Self {
        IndexerError::Storage(StorageError::Database(err.to_string()))
    }
}

/// Helper to convert redis errors
impl From<redis::RedisError> for IndexerError {
    fn from(err: redis::RedisError) -> Self {
        IndexerError::Storage(StorageError::Queue(err.to_string()))
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        IndexerError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(err: reqwest::Error) -> Self {
        IndexerError::Network(NetworkError::ConnectionFailed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_classification_matches_provider_messages() {
        let cases = [
            ("Rate limit exceeded", true),
            ("HTTP 429 from provider", true),
            ("Too Many Requests", true),
            ("connection refused", false),
        ];
        for (message, expected) in cases {
            let err = IndexerError::Network(NetworkError::ConnectionFailed(message.to_string()));
            assert_eq!(err.is_rate_limited(), expected, "{message}");
        }
    }

    #[test]
    fn nested_rpc_errors_keep_their_short_message() {
        let err = IndexerError::Network(NetworkError::Rpc {
            code: -32005,
            message: "too many requests".to_string(),
        });
        assert!(err.is_rate_limited());
    }
}
