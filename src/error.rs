//! Error types for the content hub.

use crate::types::ContentKey;
use thiserror::Error;

/// Main error type for hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Content not found: {channel}/{key}")]
    ContentNotFound { channel: String, key: ContentKey },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid channel name: {0:?}")]
    InvalidChannelName(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage unavailable during {op} on {partition}: {reason}")]
    StorageUnavailable {
        op: &'static str,
        partition: String,
        reason: String,
    },

    #[error("Timed out during {op} on {partition}")]
    Timeout { op: &'static str, partition: String },

    #[error("Bulk insert into {channel} failed after {} committed items: {source}", .successful_keys.len())]
    BulkInsertFailed {
        channel: String,
        successful_keys: Vec<ContentKey>,
        #[source]
        source: Box<HubError>,
    },

    #[error("Channel is being deleted: {0}")]
    ChannelDeleting(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Storage directory is locked by another process")]
    Locked,

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),
}

impl HubError {
    /// Whether the caller may retry the failed operation.
    ///
    /// Retrying a write is not idempotent: the first attempt may already
    /// have been committed.
    pub fn is_retryable(&self) -> bool {
        match self {
            HubError::StorageUnavailable { .. } | HubError::Timeout { .. } => true,
            HubError::BulkInsertFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn unavailable(
        op: &'static str,
        partition: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        HubError::StorageUnavailable {
            op,
            partition: partition.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for HubError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        HubError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for HubError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        HubError::Deserialization(e.to_string())
    }
}

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;
