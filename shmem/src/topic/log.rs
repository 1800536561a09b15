//! Fixed-capacity containers laid out inside the segment: the ring holding a
//! topic's message entries and the stack of recycled payload slots.

use std::mem;
use std::ptr::NonNull;
use std::slice;

use super::message::MessageEntry;
use crate::core::Handle;

#[repr(C)]
struct RingHeader {
    capacity: u64,
    head: u64,
    len: u64,
    _reserved: u64,
}

/// Ring of [`MessageEntry`]s, oldest first.
pub(crate) struct MessageLog<'a> {
    header: &'a mut RingHeader,
    entries: &'a mut [MessageEntry],
}

impl<'a> MessageLog<'a> {
    pub(crate) fn bytes_for(capacity: usize) -> usize {
        mem::size_of::<RingHeader>() + capacity * mem::size_of::<MessageEntry>()
    }

    /// # Safety
    /// `ptr` must address [`MessageLog::bytes_for`]`(capacity)` zeroed bytes.
    pub(crate) unsafe fn init(ptr: NonNull<u8>, capacity: usize) {
        let header = &mut *(ptr.as_ptr() as *mut RingHeader);
        header.capacity = capacity as u64;
        header.head = 0;
        header.len = 0;
    }

    /// # Safety
    /// `ptr` must address an initialized log, and the caller must hold the
    /// owning topic's lock for as long as the view is alive.
    pub(crate) unsafe fn attach(ptr: NonNull<u8>) -> MessageLog<'a> {
        let header = &mut *(ptr.as_ptr() as *mut RingHeader);
        let first = ptr.as_ptr().add(mem::size_of::<RingHeader>()) as *mut MessageEntry;
        let entries = slice::from_raw_parts_mut(first, header.capacity as usize);
        MessageLog { header, entries }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.header.capacity as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.header.len as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.header.len == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    fn slot(&self, index: usize) -> usize {
        (self.header.head as usize + index) % self.capacity()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&MessageEntry> {
        if index >= self.len() {
            return None;
        }
        Some(&self.entries[self.slot(index)])
    }

    pub(crate) fn front(&self) -> Option<&MessageEntry> {
        self.get(0)
    }

    pub(crate) fn back(&self) -> Option<&MessageEntry> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    pub(crate) fn back_mut(&mut self) -> Option<&mut MessageEntry> {
        let index = self.len().checked_sub(1)?;
        let slot = self.slot(index);
        Some(&mut self.entries[slot])
    }

    /// Appends unless full; a rejected entry is handed back.
    pub(crate) fn push_back(&mut self, entry: MessageEntry) -> Result<(), MessageEntry> {
        if self.is_full() {
            return Err(entry);
        }
        let slot = self.slot(self.len());
        self.entries[slot] = entry;
        self.header.len += 1;
        Ok(())
    }

    pub(crate) fn pop_front(&mut self) -> Option<MessageEntry> {
        if self.is_empty() {
            return None;
        }
        let entry = self.entries[self.header.head as usize];
        self.header.head = (self.header.head + 1) % self.header.capacity;
        self.header.len -= 1;
        Some(entry)
    }

    /// Index of the entry following `last_seen`, relying on the sequence
    /// numbers in the log being contiguous. Anything older than the log
    /// resolves to the oldest entry.
    pub(crate) fn index_after(&self, last_seen: u64) -> Option<usize> {
        let first = self.front()?.seq;
        let last = self.back()?.seq;
        let target = last_seen + 1;
        if target <= first {
            return Some(0);
        }
        if target > last {
            return None;
        }
        let index = (target - first) as usize;
        debug_assert_eq!(self.get(index).map(|e| e.seq), Some(target));
        Some(index)
    }
}

#[repr(C)]
struct StackHeader {
    capacity: u64,
    len: u64,
}

/// Bounded LIFO of free payload slots.
pub(crate) struct HandleStack<'a> {
    header: &'a mut StackHeader,
    items: &'a mut [Handle],
}

impl<'a> HandleStack<'a> {
    pub(crate) fn bytes_for(capacity: usize) -> usize {
        mem::size_of::<StackHeader>() + capacity * mem::size_of::<Handle>()
    }

    /// # Safety
    /// `ptr` must address [`HandleStack::bytes_for`]`(capacity)` zeroed bytes.
    pub(crate) unsafe fn init(ptr: NonNull<u8>, capacity: usize) {
        let header = &mut *(ptr.as_ptr() as *mut StackHeader);
        header.capacity = capacity as u64;
        header.len = 0;
    }

    /// # Safety
    /// Same contract as [`MessageLog::attach`].
    pub(crate) unsafe fn attach(ptr: NonNull<u8>) -> HandleStack<'a> {
        let header = &mut *(ptr.as_ptr() as *mut StackHeader);
        let first = ptr.as_ptr().add(mem::size_of::<StackHeader>()) as *mut Handle;
        let items = slice::from_raw_parts_mut(first, header.capacity as usize);
        HandleStack { header, items }
    }

    pub(crate) fn len(&self) -> usize {
        self.header.len as usize
    }

    /// Returns `false` when the stack is full.
    pub(crate) fn push(&mut self, handle: Handle) -> bool {
        let len = self.len();
        if len >= self.items.len() {
            return false;
        }
        self.items[len] = handle;
        self.header.len += 1;
        true
    }

    pub(crate) fn pop(&mut self) -> Option<Handle> {
        let len = self.len().checked_sub(1)?;
        self.header.len = len as u64;
        Some(self.items[len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(bytes: usize) -> Vec<u64> {
        vec![0u64; (bytes + 7) / 8]
    }

    fn entry(seq: u64) -> MessageEntry {
        MessageEntry {
            handle: Handle::from_offset(seq * 16),
            seq,
            timestamp: seq as i64,
        }
    }

    #[test]
    fn ring_wraps_and_keeps_order() {
        let mut mem = buffer(MessageLog::bytes_for(3));
        let ptr = NonNull::new(mem.as_mut_ptr() as *mut u8).unwrap();
        unsafe { MessageLog::init(ptr, 3) };
        let mut log = unsafe { MessageLog::attach(ptr) };

        for seq in 1..=3 {
            log.push_back(entry(seq)).unwrap();
        }
        assert!(log.is_full());
        assert_eq!(log.push_back(entry(4)), Err(entry(4)));
        assert_eq!(log.pop_front().map(|e| e.seq), Some(1));
        log.push_back(entry(4)).unwrap();

        let seqs: Vec<u64> = (0..log.len()).map(|i| log.get(i).unwrap().seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(log.back().map(|e| e.seq), Some(4));
    }

    #[test]
    fn index_after_uses_sequence_arithmetic() {
        let mut mem = buffer(MessageLog::bytes_for(8));
        let ptr = NonNull::new(mem.as_mut_ptr() as *mut u8).unwrap();
        unsafe { MessageLog::init(ptr, 8) };
        let mut log = unsafe { MessageLog::attach(ptr) };
        assert_eq!(log.index_after(0), None);

        for seq in 5..=9 {
            log.push_back(entry(seq)).unwrap();
        }
        assert_eq!(log.index_after(0), Some(0));
        assert_eq!(log.index_after(4), Some(0));
        assert_eq!(log.index_after(6), Some(2));
        assert_eq!(log.index_after(8), Some(4));
        assert_eq!(log.index_after(9), None);
    }

    #[test]
    fn stack_is_bounded() {
        let mut mem = buffer(HandleStack::bytes_for(2));
        let ptr = NonNull::new(mem.as_mut_ptr() as *mut u8).unwrap();
        unsafe { HandleStack::init(ptr, 2) };
        let mut stack = unsafe { HandleStack::attach(ptr) };

        assert!(stack.push(Handle::from_offset(16)));
        assert!(stack.push(Handle::from_offset(32)));
        assert!(!stack.push(Handle::from_offset(48)));
        assert_eq!(stack.pop(), Some(Handle::from_offset(32)));
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.pop(), Some(Handle::from_offset(16)));
        assert_eq!(stack.pop(), None);
    }
}
