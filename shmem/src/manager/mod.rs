//! Process-wide entry point to the broker.
//!
//! Call [`SharedMemory::init`] once before any topic is touched, and
//! [`SharedMemory::destroy`] only after every topic and subscription obtained
//! through it is gone. The owner role runs the heartbeat; users watch it and
//! must call [`SharedMemory::make_it_valid`] when [`SharedMemory::is_valid`]
//! turns false.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use bytemuck::Zeroable;
use once_cell::sync::Lazy;
use tracing::{error, info, warn};

use crate::core::{AccessMode, Handle, Segment, SegmentStatus, ShmemConfig};
use crate::directory::TopicDirectory;
use crate::errors::{Result, ShmemLibError};
use crate::heartbeat::{Heartbeat, SegmentCounter};

static GLOBAL: Lazy<SharedMemory> = Lazy::new(SharedMemory::new);

struct Attached {
    segment: Arc<Segment>,
    heartbeat: Heartbeat,
}

struct ManagerState {
    setup: Option<(AccessMode, ShmemConfig)>,
    attached: Option<Attached>,
    status: SegmentStatus,
}

pub struct SharedMemory {
    state: Mutex<ManagerState>,
}

impl Default for SharedMemory {
    fn default() -> Self {
        SharedMemory::new()
    }
}

fn attach(access: AccessMode, config: &ShmemConfig) -> Result<Segment> {
    match access {
        AccessMode::User => Segment::open(config),
        AccessMode::Owner => match Segment::open(config) {
            Ok(mut segment) => {
                segment.set_owner(true);
                info!(segment = %config.name, "adopted existing segment");
                Ok(segment)
            }
            Err(ShmemLibError::Mismatch(reason)) => {
                warn!(segment = %config.name, %reason, "existing segment is incompatible, recreating it");
                Segment::remove(config)?;
                Segment::create(config)
            }
            Err(_) => Segment::create(config),
        },
        AccessMode::VolatileOwner => {
            Segment::remove(config)?;
            Segment::create(config)
        }
    }
}

fn status_of(err: &ShmemLibError) -> SegmentStatus {
    match err {
        ShmemLibError::Mismatch(_) => SegmentStatus::Mismatch,
        _ => SegmentStatus::NotOpened,
    }
}

impl SharedMemory {
    pub fn new() -> SharedMemory {
        SharedMemory {
            state: Mutex::new(ManagerState {
                setup: None,
                attached: None,
                status: SegmentStatus::NotOpened,
            }),
        }
    }

    /// The instance shared by the whole process.
    pub fn global() -> &'static SharedMemory {
        &GLOBAL
    }

    /// Creates or opens the segment according to `access`. Any segment this
    /// instance held before is released first.
    pub fn init(&self, access: AccessMode, config: ShmemConfig) -> Result<SegmentStatus> {
        config.validate()?;
        let mut state = self.state.lock()?;
        Self::detach(&mut state);
        state.setup = Some((access, config));
        Self::connect(&mut state)
    }

    fn connect(state: &mut ManagerState) -> Result<SegmentStatus> {
        let (access, config) = state.setup.clone().ok_or(ShmemLibError::NotInitialized)?;
        let segment = match attach(access, &config) {
            Ok(segment) => Arc::new(segment),
            Err(e) => {
                state.status = status_of(&e);
                error!(segment = %config.name, ?access, error = %e, "cannot attach shared memory");
                return Err(e);
            }
        };
        let mut heartbeat = Heartbeat::start(
            access.is_owner(),
            SegmentCounter(Arc::clone(&segment)),
            config.heartbeat_interval(),
            config.heartbeat_grace(),
        )?;
        if !heartbeat.wait_active(config.heartbeat_grace()) {
            heartbeat.stop();
            state.status = SegmentStatus::NotOpened;
            warn!(segment = %config.name, "segment has no live owner");
            return Err(ShmemLibError::InvalidSegment {
                status: SegmentStatus::NotOpened,
                heartbeat_active: false,
            });
        }
        state.attached = Some(Attached { segment, heartbeat });
        state.status = SegmentStatus::Success;
        Ok(SegmentStatus::Success)
    }

    fn detach(state: &mut ManagerState) {
        if let Some(mut attached) = state.attached.take() {
            attached.heartbeat.stop();
            if Arc::strong_count(&attached.segment) > 1 {
                warn!(
                    segment = attached.segment.name(),
                    "segment released while topics still reference it"
                );
            }
        }
        state.status = SegmentStatus::NotOpened;
    }

    pub fn status(&self) -> Result<SegmentStatus> {
        Ok(self.state.lock()?.status)
    }

    /// True while a segment is attached and its owner is alive.
    pub fn is_valid(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state
                .attached
                .as_ref()
                .map_or(false, |a| a.heartbeat.is_active()),
            Err(_) => false,
        }
    }

    /// Reopens the segment if it is missing or its owner stopped beating.
    /// Returns [`SegmentStatus::Reopened`] after a reopen; handles obtained
    /// before it are stale.
    pub fn make_it_valid(&self) -> Result<SegmentStatus> {
        if self.is_valid() {
            return Ok(SegmentStatus::Success);
        }
        self.reopen()
    }

    pub fn reopen(&self) -> Result<SegmentStatus> {
        let mut state = self.state.lock()?;
        if state.setup.is_none() {
            return Err(ShmemLibError::NotInitialized);
        }
        Self::detach(&mut state);
        Self::connect(&mut state)?;
        state.status = SegmentStatus::Reopened;
        if let Some(attached) = state.attached.as_ref() {
            info!(segment = attached.segment.name(), "shared memory reopened");
        }
        Ok(SegmentStatus::Reopened)
    }

    /// Stops the heartbeat and releases the segment. An owner unlinks it once
    /// the last topic accessor is gone.
    pub fn destroy(&self) {
        match self.state.lock() {
            Ok(mut state) => Self::detach(&mut state),
            Err(poisoned) => Self::detach(&mut poisoned.into_inner()),
        }
    }

    /// The attached segment, refused while the owner's heartbeat is missing.
    pub fn segment(&self) -> Result<Arc<Segment>> {
        let state = self.state.lock()?;
        let attached = state.attached.as_ref().ok_or(ShmemLibError::NotInitialized)?;
        if !attached.heartbeat.is_active() {
            return Err(ShmemLibError::InvalidSegment {
                status: state.status,
                heartbeat_active: false,
            });
        }
        Ok(Arc::clone(&attached.segment))
    }

    pub fn topic_directory(&self) -> Result<TopicDirectory> {
        Ok(TopicDirectory::new(self.segment()?))
    }

    pub fn create_anonymous_object<T: Zeroable>(&self) -> Result<Handle> {
        self.segment()?.create_anonymous_object::<T>()
    }

    pub fn destroy_anonymous_object<T>(&self, handle: Handle) -> Result<()> {
        self.segment()?.destroy_anonymous_object::<T>(handle)
    }

    pub fn handle_from_address<T>(&self, ptr: *const T) -> Result<Handle> {
        self.segment()?.handle_from_address(ptr)
    }

    /// The address is only valid until the segment is reopened or destroyed.
    pub fn address_from_handle<T>(&self, handle: Handle) -> Result<NonNull<T>> {
        self.segment()?.address_from_handle(handle)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.destroy();
    }
}
