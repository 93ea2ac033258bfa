use std::sync::Arc;

use padlog_shared::ProtocolError;
use thiserror::Error;

/// Errors produced by the store layer.
///
/// Cloneable so a single coalesced index scan can hand the same outcome to
/// every waiting caller.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Read or write failure other than a missing log.
    #[error("IO error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Unparseable line before any checkpoint, or a resume offset past the
    /// end of the log. Recoverable by rescanning from byte 0.
    #[error("Offset consistency fault at byte {offset}")]
    OffsetConsistency { offset: u64 },

    /// The fault persisted through a full rescan from byte 0.
    #[error("Channel log {channel} is corrupt at byte {offset}")]
    CorruptLog { channel: String, offset: u64 },

    /// Cursor cannot be resolved against retained history. Clients must
    /// drop their cache and request the full history.
    #[error("EUNKNOWN")]
    UnknownCursor,

    /// Ephemeral channels have no log.
    #[error("Channel {0} is not persistent")]
    NotPersistent(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The task computing a shared result went away before finishing.
    #[error("Index computation interrupted")]
    Interrupted,
}

impl StoreError {
    pub fn is_unknown_cursor(&self) -> bool {
        matches!(self, StoreError::UnknownCursor)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(Arc::new(e))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
