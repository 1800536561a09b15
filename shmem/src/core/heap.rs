//! First-fit allocator over the segment's heap area.
//!
//! Blocks carry a 16 byte header (`size`, `next`). Free blocks are chained in
//! address order through `next` so neighbours can be merged on release;
//! allocated blocks hold `ALLOCATED_TAG` there, which lets `free` reject
//! foreign or already-released handles.

use std::ptr::NonNull;

use super::lock::{LockPolicy, LockWait, ShmMutex};
use crate::errors::{Result, ShmemLibError};

pub(crate) const HEAP_ALIGN: usize = 16;
const BLOCK_HEADER: u64 = 16;
const MIN_SPLIT: u64 = 64;
const ALLOCATED_TAG: u64 = 0xA110_CA7E_D0D0_CAFE;

#[repr(C)]
struct BlockHeader {
    size: u64,
    next: u64,
}

#[repr(C)]
pub(crate) struct HeapTable {
    start: u64,
    end: u64,
    free_head: u64,
    used: u64,
    allocations: u64,
}

pub(crate) type HeapState = ShmMutex<HeapTable>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: usize,
    pub used: usize,
    pub free: usize,
    pub allocations: usize,
    pub free_blocks: usize,
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Heap operations bound to one process's view of the segment.
pub(crate) struct Heap<'a> {
    base: NonNull<u8>,
    state: &'a HeapState,
    policy: &'a LockPolicy,
}

impl<'a> Heap<'a> {
    /// Formats `[start, end)` as a single free block.
    ///
    /// # Safety
    /// `state` and the range must lie inside the mapping at `base`, and no other
    /// process may be using them yet.
    pub(crate) unsafe fn init(
        base: NonNull<u8>,
        state: *mut HeapState,
        start: u64,
        end: u64,
    ) -> Result<()> {
        let start = align_up(start, HEAP_ALIGN as u64);
        let end = end & !(HEAP_ALIGN as u64 - 1);
        if end <= start + BLOCK_HEADER + MIN_SPLIT {
            return Err(ShmemLibError::InvalidConfig(format!(
                "heap range {}..{} is too small",
                start, end
            )));
        }
        let first = base.as_ptr().add(start as usize) as *mut BlockHeader;
        (*first).size = end - start;
        (*first).next = 0;
        ShmMutex::init(
            state,
            HeapTable {
                start,
                end,
                free_head: start,
                used: 0,
                allocations: 0,
            },
        )
    }

    pub(crate) fn new(base: NonNull<u8>, state: &'a HeapState, policy: &'a LockPolicy) -> Heap<'a> {
        Heap {
            base,
            state,
            policy,
        }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn block(&self, offset: u64) -> &mut BlockHeader {
        &mut *(self.base.as_ptr().add(offset as usize) as *mut BlockHeader)
    }

    /// Returns the offset of `size` usable bytes, aligned to [`HEAP_ALIGN`].
    pub(crate) fn allocate(&self, size: usize, align: usize) -> Result<u64> {
        if align > HEAP_ALIGN {
            return Err(ShmemLibError::InvalidConfig(format!(
                "alignment {} exceeds the supported {} bytes",
                align, HEAP_ALIGN
            )));
        }
        let need = align_up(size.max(1) as u64 + BLOCK_HEADER, HEAP_ALIGN as u64);
        let mut table = self.state.lock(self.policy, LockWait::Timed, "heap")?;

        let mut prev = 0u64;
        let mut cur = table.free_head;
        while cur != 0 {
            let (blk_size, blk_next) = unsafe {
                let blk = self.block(cur);
                (blk.size, blk.next)
            };
            if blk_size >= need {
                let taken = if blk_size - need >= MIN_SPLIT {
                    let rest = cur + need;
                    unsafe {
                        let tail = self.block(rest);
                        tail.size = blk_size - need;
                        tail.next = blk_next;
                    }
                    self.link(&mut table, prev, rest);
                    need
                } else {
                    self.link(&mut table, prev, blk_next);
                    blk_size
                };
                unsafe {
                    let blk = self.block(cur);
                    blk.size = taken;
                    blk.next = ALLOCATED_TAG;
                }
                table.used += taken;
                table.allocations += 1;
                return Ok(cur + BLOCK_HEADER);
            }
            prev = cur;
            cur = blk_next;
        }

        Err(ShmemLibError::OutOfMemory {
            requested: size,
            available: (table.end - table.start - table.used) as usize,
        })
    }

    fn link(&self, table: &mut HeapTable, prev: u64, next: u64) {
        if prev == 0 {
            table.free_head = next;
        } else {
            unsafe { self.block(prev).next = next };
        }
    }

    pub(crate) fn free(&self, offset: u64) -> Result<()> {
        let mut table = self.state.lock(self.policy, LockWait::Timed, "heap")?;
        let invalid = || ShmemLibError::InvalidHandle(super::Handle::from_offset(offset));

        if offset < table.start + BLOCK_HEADER
            || offset >= table.end
            || offset % HEAP_ALIGN as u64 != 0
        {
            return Err(invalid());
        }
        let at = offset - BLOCK_HEADER;
        let size = unsafe {
            let blk = self.block(at);
            if blk.next != ALLOCATED_TAG || blk.size < BLOCK_HEADER || at + blk.size > table.end {
                return Err(invalid());
            }
            blk.size
        };
        table.used -= size;
        table.allocations -= 1;

        let mut prev = 0u64;
        let mut cur = table.free_head;
        while cur != 0 && cur < at {
            prev = cur;
            cur = unsafe { self.block(cur).next };
        }
        unsafe { self.block(at).next = cur };
        self.link(&mut table, prev, at);

        unsafe {
            if cur != 0 && at + size == cur {
                let (next_size, next_next) = {
                    let nb = self.block(cur);
                    (nb.size, nb.next)
                };
                let blk = self.block(at);
                blk.size += next_size;
                blk.next = next_next;
            }
            if prev != 0 {
                let (prev_size, at_size, at_next) = {
                    let pb = self.block(prev);
                    let ab = self.block(at);
                    (pb.size, ab.size, ab.next)
                };
                if prev + prev_size == at {
                    let pb = self.block(prev);
                    pb.size = prev_size + at_size;
                    pb.next = at_next;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn stats(&self) -> Result<HeapStats> {
        let table = self.state.lock(self.policy, LockWait::Timed, "heap")?;
        let mut free_blocks = 0;
        let mut cur = table.free_head;
        while cur != 0 {
            free_blocks += 1;
            cur = unsafe { self.block(cur).next };
        }
        let capacity = (table.end - table.start) as usize;
        Ok(HeapStats {
            capacity,
            used: table.used as usize,
            free: capacity - table.used as usize,
            allocations: table.allocations as usize,
            free_blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    struct Arena {
        words: Vec<u128>,
        policy: LockPolicy,
    }

    impl Arena {
        fn new(bytes: usize) -> Arena {
            let mut arena = Arena {
                words: vec![0u128; bytes / 16],
                policy: LockPolicy::default(),
            };
            let base = arena.base();
            let heap_start = mem::size_of::<HeapState>() as u64;
            unsafe {
                Heap::init(base, base.as_ptr() as *mut HeapState, heap_start, bytes as u64).unwrap();
            }
            arena
        }

        fn base(&mut self) -> NonNull<u8> {
            NonNull::new(self.words.as_mut_ptr() as *mut u8).unwrap()
        }

        fn heap(&self) -> Heap<'_> {
            let base = NonNull::new(self.words.as_ptr() as *mut u8).unwrap();
            let state = unsafe { &*(base.as_ptr() as *const HeapState) };
            Heap::new(base, state, &self.policy)
        }
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let arena = Arena::new(64 * 1024);
        let heap = arena.heap();
        let a = heap.allocate(24, 8).unwrap();
        let b = heap.allocate(100, 16).unwrap();
        assert_eq!(a % HEAP_ALIGN as u64, 0);
        assert_eq!(b % HEAP_ALIGN as u64, 0);
        assert!(b >= a + 24);
        let stats = heap.stats().unwrap();
        assert_eq!(stats.allocations, 2);
        assert!(stats.used >= 124);
    }

    #[test]
    fn released_blocks_coalesce() {
        let arena = Arena::new(64 * 1024);
        let heap = arena.heap();
        let before = heap.stats().unwrap();
        let blocks: Vec<u64> = (0..8).map(|_| heap.allocate(200, 8).unwrap()).collect();
        for (i, b) in blocks.iter().enumerate() {
            if i % 2 == 0 {
                heap.free(*b).unwrap();
            }
        }
        for (i, b) in blocks.iter().enumerate() {
            if i % 2 == 1 {
                heap.free(*b).unwrap();
            }
        }
        let after = heap.stats().unwrap();
        assert_eq!(after.used, 0);
        assert_eq!(after.free_blocks, before.free_blocks);
        // The whole heap is one block again.
        assert!(heap.allocate(before.free - 64, 8).is_ok());
    }

    #[test]
    fn exhaustion_is_reported() {
        let arena = Arena::new(8 * 1024);
        let heap = arena.heap();
        match heap.allocate(1024 * 1024, 8) {
            Err(ShmemLibError::OutOfMemory { requested, .. }) => assert_eq!(requested, 1024 * 1024),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn double_free_is_rejected() {
        let arena = Arena::new(8 * 1024);
        let heap = arena.heap();
        let a = heap.allocate(32, 8).unwrap();
        heap.free(a).unwrap();
        assert!(matches!(heap.free(a), Err(ShmemLibError::InvalidHandle(_))));
        assert!(matches!(heap.free(a + 16), Err(ShmemLibError::InvalidHandle(_))));
    }

    #[test]
    fn oversized_alignment_is_rejected() {
        let arena = Arena::new(8 * 1024);
        assert!(arena.heap().allocate(64, 64).is_err());
    }
}
