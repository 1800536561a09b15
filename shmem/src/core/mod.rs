use std::fmt;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, ShmemLibError};

pub(crate) mod heap;
pub(crate) mod lock;
pub mod segment;

pub use heap::HeapStats;
pub use lock::LockPolicy;
pub use segment::{OwnedHandle, Segment};

pub static DEFAULT_SEGMENT_NAME: &str = "shmem-broker";
pub const DEFAULT_SEGMENT_SIZE: usize = 32 * 1024 * 1024;

pub const MAX_LOG_ENTRIES: usize = 10_000;
pub const LOCK_TIMEOUT_MS: u64 = 1_000;
pub const STALE_LOCK_MS: u64 = 10_000;
pub const DEFAULT_SUBSCRIPTION_TIMEOUT_SECS: u64 = 30;
pub const HEARTBEAT_INTERVAL_MS: u64 = 100;
pub const HEARTBEAT_GRACE_MS: u64 = 3_000;

pub const MAX_TOPIC_NAME_LEN: usize = 63;
pub const MAX_TOPICS: usize = 128;
pub const MAX_SUBSCRIBERS: usize = 64;

const MIN_SEGMENT_SIZE: usize = 64 * 1024;

/// Milliseconds on the host-wide monotonic clock.
pub type Timestamp = i64;

pub const INVALID_TIMESTAMP: Timestamp = 0;

/// Reads `CLOCK_MONOTONIC`, which every process on the host shares, so values
/// written by one participant can be compared by another.
pub fn now_ms() -> Timestamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000 + ts.tv_nsec as i64 / 1_000_000
}

/// Portable reference to an object inside the segment: its byte offset from the
/// segment base. Offset 0 is the segment header, so it doubles as the null handle.
#[repr(transparent)]
#[derive(Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub(crate) fn from_offset(offset: u64) -> Handle {
        Handle(offset)
    }

    pub fn offset(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Attach to an existing segment, never create one.
    User = 0,
    /// Create the segment, or adopt a compatible one left behind.
    Owner = 1,
    /// Always discard any existing segment and create a fresh one.
    VolatileOwner = 2,
}

impl AccessMode {
    pub fn is_owner(self) -> bool {
        matches!(self, AccessMode::Owner | AccessMode::VolatileOwner)
    }
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Success = 0,
    /// The segment could not be created or opened.
    NotOpened = 1,
    /// The segment exists but was written by an incompatible build.
    Mismatch = 2,
    /// The segment was just reopened; earlier handles may be stale.
    Reopened = 3,
}

/// Topic names are stored inline so the directory and topic state need no
/// further allocation.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub(crate) struct ShmName {
    len: u32,
    bytes: [u8; MAX_TOPIC_NAME_LEN + 1],
}

impl ShmName {
    pub(crate) fn new(name: &str) -> Result<ShmName> {
        if name.is_empty() {
            return Err(ShmemLibError::InvalidConfig(
                "topic name must not be empty".to_string(),
            ));
        }
        if name.len() > MAX_TOPIC_NAME_LEN {
            return Err(ShmemLibError::NameTooLong {
                name: name.to_string(),
                max: MAX_TOPIC_NAME_LEN,
            });
        }
        let mut stored = ShmName::zeroed();
        stored.bytes[..name.len()].copy_from_slice(name.as_bytes());
        stored.len = name.len() as u32;
        Ok(stored)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        let len = (self.len as usize).min(MAX_TOPIC_NAME_LEN);
        &self.bytes[..len]
    }

    pub(crate) fn matches(&self, name: &str) -> bool {
        self.as_bytes() == name.as_bytes()
    }

    pub(crate) fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub name: String,
    pub size: usize,
    pub lock_timeout_ms: u64,
    pub stale_lock_ms: u64,
    pub max_log_entries: usize,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_grace_ms: u64,
    /// How long an attaching process waits for a creator to finish laying out
    /// a brand-new segment.
    pub attach_timeout_ms: u64,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            name: DEFAULT_SEGMENT_NAME.to_string(),
            size: DEFAULT_SEGMENT_SIZE,
            lock_timeout_ms: LOCK_TIMEOUT_MS,
            stale_lock_ms: STALE_LOCK_MS,
            max_log_entries: MAX_LOG_ENTRIES,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_grace_ms: HEARTBEAT_GRACE_MS,
            attach_timeout_ms: 1_000,
        }
    }
}

impl ShmemConfig {
    pub fn named(name: impl Into<String>) -> ShmemConfig {
        ShmemConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim_start_matches('/').is_empty() {
            return Err(ShmemLibError::InvalidConfig(
                "segment name must not be empty".to_string(),
            ));
        }
        if self.size < MIN_SEGMENT_SIZE {
            return Err(ShmemLibError::InvalidConfig(format!(
                "segment size {} is below the minimum of {} bytes",
                self.size, MIN_SEGMENT_SIZE
            )));
        }
        if self.max_log_entries == 0 {
            return Err(ShmemLibError::InvalidConfig(
                "max_log_entries must be at least 1".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(ShmemLibError::InvalidConfig(
                "lock_timeout_ms and heartbeat_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_grace_ms <= self.heartbeat_interval_ms {
            return Err(ShmemLibError::InvalidConfig(format!(
                "heartbeat_grace_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_grace_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_millis(self.lock_timeout_ms),
            stale_after: Duration::from_millis(self.stale_lock_ms),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub(crate) fn os_id(&self) -> String {
        if self.name.starts_with('/') {
            self.name.clone()
        } else {
            format!("/{}", self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_deployed_constants() {
        let cfg = ShmemConfig::default();
        assert_eq!(cfg.max_log_entries, 10_000);
        assert_eq!(cfg.stale_lock_ms, 10_000);
        assert_eq!(cfg.lock_timeout_ms, 1_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() -> std::result::Result<(), toml::de::Error> {
        let cfg: ShmemConfig = toml::from_str(
            r#"
            name = "lidar"
            stale_lock_ms = 500
            "#,
        )?;
        assert_eq!(cfg.name, "lidar");
        assert_eq!(cfg.stale_lock_ms, 500);
        assert_eq!(cfg.size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(cfg.os_id(), "/lidar");
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = ShmemConfig::named("/");
        assert!(cfg.validate().is_err());
        cfg.name = "ok".to_string();
        cfg.size = 1024;
        assert!(cfg.validate().is_err());
        cfg.size = DEFAULT_SEGMENT_SIZE;
        cfg.heartbeat_grace_ms = cfg.heartbeat_interval_ms;
        assert!(matches!(
            cfg.validate(),
            Err(ShmemLibError::InvalidConfig(_))
        ));
    }

    #[test]
    fn names_are_bounded() {
        assert!(ShmName::new("sensors/laser_scan").is_ok());
        assert!(ShmName::new("").is_err());
        let long = "x".repeat(MAX_TOPIC_NAME_LEN + 1);
        assert!(matches!(
            ShmName::new(&long),
            Err(ShmemLibError::NameTooLong { .. })
        ));
        let name = ShmName::new("odom").unwrap();
        assert!(name.matches("odom"));
        assert!(!name.matches("odometry"));
        assert_eq!(name.to_string_lossy(), "odom");
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = now_ms();
        std::thread::sleep(Duration::from_millis(5));
        assert!(now_ms() >= a + 4);
    }
}
