use bytemuck::{Pod, Zeroable};

use crate::core::{Handle, Timestamp, INVALID_TIMESTAMP};

pub type SeqNum = u64;

/// Payload types must be plain data: copied byte-for-byte into the segment and
/// read back by processes that never ran their constructors.
pub trait Payload: Pod + Send + Sync {}

impl<T: Pod + Send + Sync> Payload for T {}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Message<T> {
    pub payload: T,
    /// Publish time in monotonic milliseconds; [`INVALID_TIMESTAMP`] asks
    /// `publish_message` to stamp the current time.
    pub timestamp: Timestamp,
    pub sequence: SeqNum,
}

impl<T> Message<T> {
    pub fn new(payload: T) -> Message<T> {
        Message {
            payload,
            timestamp: INVALID_TIMESTAMP,
            sequence: 0,
        }
    }

    pub fn with_timestamp(payload: T, timestamp: Timestamp) -> Message<T> {
        Message {
            payload,
            timestamp,
            sequence: 0,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MessageEntry {
    pub handle: Handle,
    pub seq: SeqNum,
    pub timestamp: Timestamp,
}
