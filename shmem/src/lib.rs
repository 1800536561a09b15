pub mod core;
pub mod directory;
mod errors;
pub mod heartbeat;
pub mod laser;
pub mod manager;
pub mod subscription;
pub mod topic;

#[cfg(test)]
mod tests;

pub use crate::core::{
    now_ms, AccessMode, Handle, HeapStats, LockPolicy, OwnedHandle, Segment, SegmentStatus,
    ShmemConfig, Timestamp,
};
pub use directory::TopicDirectory;
pub use errors::{Result, ShmemLibError};
pub use heartbeat::Heartbeat;
pub use laser::{LaserPoint, LaserScan, LASER_SCAN_TOPIC};
pub use manager::SharedMemory;
pub use subscription::{Subscription, SubscriptionOptions, SubscriptionQos};
pub use topic::{Message, Payload, SeqNum, Topic, TopicQos};
