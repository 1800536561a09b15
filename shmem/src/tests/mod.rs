//! Broker scenarios. Each test maps its own segment, so they run in parallel;
//! separate `SharedMemory` instances stand in for separate processes.

use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{AccessMode, SharedMemory, ShmemConfig};

mod recovery_tests;

pub(crate) fn test_config(tag: &str) -> ShmemConfig {
    static SEGMENT_COUNTER: AtomicUsize = AtomicUsize::new(0);
    let mut config = ShmemConfig::named(format!(
        "sb-{}-{}-{}",
        tag,
        process::id(),
        SEGMENT_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    config.size = 8 * 1024 * 1024;
    config
}

pub(crate) fn owner(config: &ShmemConfig) -> SharedMemory {
    let shm = SharedMemory::new();
    shm.init(AccessMode::VolatileOwner, config.clone())
        .expect("owner should create the segment");
    shm
}

pub(crate) fn user(config: &ShmemConfig) -> SharedMemory {
    let shm = SharedMemory::new();
    shm.init(AccessMode::User, config.clone())
        .expect("user should open the segment");
    shm
}
