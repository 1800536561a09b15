use std::io;

use thiserror::Error;

use crate::core::Handle;

pub type Result<T> = std::result::Result<T, ShmemLibError>;

#[derive(Debug, Error)]
pub enum ShmemLibError {
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    // raw_sync reports failures as Box<dyn Error> which is neither Send nor Sync,
    // so only the message is kept.
    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Timed out waiting for lock '{label}'")]
    LockTimeout { label: String },

    #[error("Lock '{label}' is still held after forcing its release")]
    LockRecoveryFailed { label: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Mutex was poisoned")]
    PoisonedLock,

    #[error("Shared memory has not been initialized")]
    NotInitialized,

    #[error("Shared memory is not valid (status: {status:?}, heartbeat active: {heartbeat_active})")]
    InvalidSegment {
        status: crate::core::SegmentStatus,
        heartbeat_active: bool,
    },

    #[error("Shared memory layout mismatch: {0}")]
    Mismatch(String),

    #[error("Shared memory exhausted: requested {requested} bytes, {available} bytes free")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Invalid handle {0}")]
    InvalidHandle(Handle),

    #[error("Topic directory is full ({capacity} topics)")]
    DirectoryFull { capacity: usize },

    #[error("Topic '{topic}' reached its subscriber limit ({capacity})")]
    SubscriberLimit { topic: String, capacity: usize },

    #[error("Topic name '{name}' exceeds {max} bytes")]
    NameTooLong { name: String, max: usize },

    #[error("Topic '{topic}' holds {stored} byte payloads, requested type is {requested} bytes")]
    PayloadMismatch {
        topic: String,
        stored: usize,
        requested: usize,
    },

    #[error("Topic '{0}' is being disposed")]
    TopicDisposed(String),

    #[error("Subscription {0} is no longer registered")]
    InvalidSubscription(Handle),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ShmemLibError {
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> Self {
        ShmemLibError::Lock(err.to_string())
    }

    /// Failures that are expected to clear up on their own: contended locks and
    /// a segment whose owner is restarting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShmemLibError::LockTimeout { .. }
                | ShmemLibError::LockRecoveryFailed { .. }
                | ShmemLibError::InvalidSegment { .. }
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for ShmemLibError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        ShmemLibError::PoisonedLock
    }
}
