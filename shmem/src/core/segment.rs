//! The shared memory segment: one named mapping holding a header, the heap
//! and, through the heap, every broker object.
//!
//! Objects are addressed by [`Handle`]s (offsets from the mapping base). All
//! handle/address translation goes through this type so that no process ever
//! keeps another process's addresses.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytemuck::Zeroable;
use shared_memory::{Shmem, ShmemConf};
use tracing::{debug, info, warn};

use super::heap::{Heap, HeapState, HeapStats, HEAP_ALIGN};
use super::lock::{LockPolicy, SharedLock};
use super::{Handle, ShmemConfig};
use crate::errors::{Result, ShmemLibError};

const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"SHMBRKR1");
const LAYOUT_VERSION: u32 = 1;
const READY: u32 = 0x00C0_FFEE;

#[repr(C)]
pub(crate) struct SegmentHeader {
    magic: u64,
    version: u32,
    pointer_width: u32,
    size: u64,
    fingerprint: u64,
    ready: AtomicU32,
    heartbeat: AtomicU32,
    owner_pid: AtomicU32,
    _reserved: u32,
    generation: AtomicU64,
    directory: u64,
    heap: HeapState,
}

/// Changes whenever the size of a shared structure changes, so builds with
/// different layouts refuse each other's segments.
fn layout_fingerprint() -> u64 {
    let sizes = [
        mem::size_of::<SegmentHeader>(),
        mem::size_of::<SharedLock>(),
        crate::directory::state_size(),
        crate::topic::state_size(),
        mem::size_of::<crate::topic::MessageEntry>(),
        mem::size_of::<crate::subscription::SubscriptionState>(),
    ];
    sizes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, size| {
        (hash ^ *size as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

pub struct Segment {
    shmem: Shmem,
    base: NonNull<u8>,
    len: usize,
    name: String,
    policy: LockPolicy,
    max_log_entries: usize,
}

// The mapping is shared by design; every mutation of its contents happens
// under an in-segment lock or through atomics.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn wrap(shmem: Shmem, config: &ShmemConfig) -> Result<Segment> {
        let base = NonNull::new(shmem.as_ptr())
            .ok_or_else(|| ShmemLibError::Mismatch("mapping returned a null address".to_string()))?;
        let len = shmem.len();
        if len < mem::size_of::<SegmentHeader>() {
            return Err(ShmemLibError::Mismatch(format!(
                "mapping of {} bytes cannot hold the segment header",
                len
            )));
        }
        Ok(Segment {
            shmem,
            base,
            len,
            name: config.name.clone(),
            policy: config.lock_policy(),
            max_log_entries: config.max_log_entries,
        })
    }

    /// Creates and formats a new segment; fails if one with the same name exists.
    pub(crate) fn create(config: &ShmemConfig) -> Result<Segment> {
        config.validate()?;
        let shmem = ShmemConf::new()
            .size(config.size)
            .os_id(config.os_id())
            .create()?;
        let segment = Segment::wrap(shmem, config)?;
        unsafe { segment.format()? };
        info!(segment = %segment.name, size = segment.len, "created shared memory segment");
        Ok(segment)
    }

    /// Opens an existing segment and checks that it was laid out by a
    /// compatible build.
    pub(crate) fn open(config: &ShmemConfig) -> Result<Segment> {
        config.validate()?;
        let shmem = ShmemConf::new().os_id(config.os_id()).open()?;
        let segment = Segment::wrap(shmem, config)?;
        segment.wait_ready(config.attach_timeout())?;
        segment.verify()?;
        info!(segment = %segment.name, size = segment.len, "opened shared memory segment");
        Ok(segment)
    }

    /// Unlinks a segment left behind by someone else. Returns whether one existed.
    pub(crate) fn remove(config: &ShmemConfig) -> Result<bool> {
        match ShmemConf::new().os_id(config.os_id()).open() {
            Ok(mut shmem) => {
                shmem.set_owner(true);
                drop(shmem);
                info!(segment = %config.name, "removed existing shared memory segment");
                Ok(true)
            }
            Err(e) => {
                debug!(segment = %config.name, error = %e, "no segment to remove");
                Ok(false)
            }
        }
    }

    unsafe fn format(&self) -> Result<()> {
        let header = self.base.as_ptr() as *mut SegmentHeader;
        ptr::write_bytes(header as *mut u8, 0, mem::size_of::<SegmentHeader>());
        (*header).magic = SEGMENT_MAGIC;
        (*header).version = LAYOUT_VERSION;
        (*header).pointer_width = (mem::size_of::<usize>() * 8) as u32;
        (*header).size = self.len as u64;
        (*header).fingerprint = layout_fingerprint();
        (*header)
            .owner_pid
            .store(libc::getpid() as u32, Ordering::Relaxed);

        let heap_start = mem::size_of::<SegmentHeader>() as u64;
        Heap::init(
            self.base,
            ptr::addr_of_mut!((*header).heap),
            heap_start,
            self.len as u64,
        )?;
        let directory = crate::directory::create_state(self)?;
        (*header).directory = directory.offset();
        (*header).ready.store(READY, Ordering::Release);
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        while self.header().ready.load(Ordering::Acquire) != READY {
            if started.elapsed() > timeout {
                return Err(ShmemLibError::Mismatch(
                    "segment was never fully initialized".to_string(),
                ));
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn verify(&self) -> Result<()> {
        let header = self.header();
        if header.magic != SEGMENT_MAGIC {
            return Err(ShmemLibError::Mismatch(format!(
                "bad magic {:#x}",
                header.magic
            )));
        }
        if header.version != LAYOUT_VERSION {
            return Err(ShmemLibError::Mismatch(format!(
                "layout version {} (expected {})",
                header.version, LAYOUT_VERSION
            )));
        }
        let width = (mem::size_of::<usize>() * 8) as u32;
        if header.pointer_width != width {
            return Err(ShmemLibError::Mismatch(format!(
                "{}-bit segment opened by a {}-bit process",
                header.pointer_width, width
            )));
        }
        if header.fingerprint != layout_fingerprint() {
            return Err(ShmemLibError::Mismatch(
                "shared structure layout differs".to_string(),
            ));
        }
        if header.size as usize > self.len {
            return Err(ShmemLibError::Mismatch(format!(
                "header claims {} bytes, mapping has {}",
                header.size, self.len
            )));
        }
        Ok(())
    }

    pub(crate) fn set_owner(&mut self, owner: bool) {
        self.shmem.set_owner(owner);
        if owner {
            self.header()
                .owner_pid
                .store(unsafe { libc::getpid() } as u32, Ordering::Relaxed);
        }
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pid of the process that created or last adopted the segment.
    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid.load(Ordering::Relaxed)
    }

    pub fn lock_policy(&self) -> &LockPolicy {
        &self.policy
    }

    pub(crate) fn max_log_entries(&self) -> usize {
        self.max_log_entries
    }

    pub(crate) fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base.as_ptr() as *const SegmentHeader) }
    }

    pub(crate) fn heartbeat_counter(&self) -> &AtomicU32 {
        &self.header().heartbeat
    }

    pub(crate) fn directory_handle(&self) -> Handle {
        Handle::from_offset(self.header().directory)
    }

    /// Source of topic generations; never returns 0.
    pub(crate) fn next_generation(&self) -> u64 {
        self.header().generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn handle_from_address<T>(&self, ptr: *const T) -> Result<Handle> {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        let offset = addr.wrapping_sub(base);
        if addr <= base || offset + mem::size_of::<T>() > self.len {
            return Err(ShmemLibError::InvalidHandle(Handle::from_offset(
                offset as u64,
            )));
        }
        Ok(Handle::from_offset(offset as u64))
    }

    pub fn address_from_handle<T>(&self, handle: Handle) -> Result<NonNull<T>> {
        let ptr = self.bytes_at(handle, mem::size_of::<T>())?;
        if (ptr.as_ptr() as usize) % mem::align_of::<T>() != 0 {
            return Err(ShmemLibError::InvalidHandle(handle));
        }
        Ok(ptr.cast())
    }

    pub(crate) fn bytes_at(&self, handle: Handle, len: usize) -> Result<NonNull<u8>> {
        let offset = handle.offset() as usize;
        let in_bounds = offset
            .checked_add(len)
            .map_or(false, |end| end <= self.len);
        if handle.is_null() || !in_bounds {
            return Err(ShmemLibError::InvalidHandle(handle));
        }
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    /// # Safety
    /// The handle must refer to a live `T`.
    pub(crate) unsafe fn get<T>(&self, handle: Handle) -> Result<&T> {
        Ok(&*self.address_from_handle::<T>(handle)?.as_ptr())
    }

    /// # Safety
    /// The handle must refer to a live `T` and the caller must hold the lock
    /// that guards it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut<T>(&self, handle: Handle) -> Result<&mut T> {
        Ok(&mut *self.address_from_handle::<T>(handle)?.as_ptr())
    }

    fn heap(&self) -> Heap<'_> {
        Heap::new(self.base, &self.header().heap, &self.policy)
    }

    pub(crate) fn allocate(&self, size: usize, align: usize) -> Result<Handle> {
        self.heap()
            .allocate(size, align)
            .map(Handle::from_offset)
    }

    pub(crate) fn free(&self, handle: Handle) -> Result<()> {
        self.heap().free(handle.offset())
    }

    /// Allocates `size` zeroed bytes that are released again unless
    /// [`OwnedHandle::into_handle`] is called.
    pub(crate) fn allocate_owned(&self, size: usize, align: usize) -> Result<OwnedHandle<'_, u8>> {
        let handle = self.allocate(size, align)?;
        let owned = OwnedHandle::adopt(self, handle);
        let ptr = self.bytes_at(handle, size)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(owned)
    }

    /// Allocates a zeroed `T`, released on drop unless kept.
    pub fn create_owned<T: Zeroable>(&self) -> Result<OwnedHandle<'_, T>> {
        if mem::align_of::<T>() > HEAP_ALIGN {
            return Err(ShmemLibError::InvalidConfig(format!(
                "{} needs {}-byte alignment, at most {} is supported",
                std::any::type_name::<T>(),
                mem::align_of::<T>(),
                HEAP_ALIGN
            )));
        }
        let block = self.allocate_owned(mem::size_of::<T>(), mem::align_of::<T>())?;
        Ok(OwnedHandle::adopt(self, block.into_handle()))
    }

    pub fn create_anonymous_object<T: Zeroable>(&self) -> Result<Handle> {
        self.create_owned::<T>().map(OwnedHandle::into_handle)
    }

    pub fn destroy_anonymous_object<T>(&self, handle: Handle) -> Result<()> {
        self.address_from_handle::<T>(handle)?;
        self.free(handle)
    }

    pub fn heap_stats(&self) -> Result<HeapStats> {
        self.heap().stats()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.shmem.is_owner() {
            info!(segment = %self.name, "unlinking shared memory segment");
        }
    }
}

/// An allocation that is released when dropped, unless it is handed over with
/// [`OwnedHandle::into_handle`].
pub struct OwnedHandle<'a, T> {
    segment: &'a Segment,
    handle: Option<Handle>,
    _marker: PhantomData<*mut T>,
}

impl<'a, T> OwnedHandle<'a, T> {
    pub(crate) fn adopt(segment: &'a Segment, handle: Handle) -> OwnedHandle<'a, T> {
        OwnedHandle {
            segment,
            handle: Some(handle),
            _marker: PhantomData,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.unwrap_or(Handle::NULL)
    }

    pub fn as_ptr(&self) -> Result<NonNull<T>> {
        self.segment.address_from_handle(self.handle())
    }

    pub fn into_handle(mut self) -> Handle {
        self.handle.take().unwrap_or(Handle::NULL)
    }
}

impl<T> Drop for OwnedHandle<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.segment.free(handle) {
                warn!(%handle, error = %e, "failed to release shared allocation");
            }
        }
    }
}
