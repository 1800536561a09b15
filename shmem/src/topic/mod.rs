//! Named, typed message streams living in the segment.
//!
//! A topic's shared state is a [`TopicState`]: identity fields that never
//! change after creation plus a [`TopicCore`] behind the topic lock. The core
//! points at a ring of [`MessageEntry`]s, a stack of recycled payload slots
//! and the subscription states of every current reader. All bookkeeping is
//! done while holding the lock, through [`LockedTopic`].

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::lock::{LockWait, ShmMutex, ShmMutexGuard};
use crate::core::{
    now_ms, Handle, OwnedHandle, Segment, ShmName, Timestamp, INVALID_TIMESTAMP, MAX_SUBSCRIBERS,
};
use crate::errors::{Result, ShmemLibError};
use crate::subscription::{Subscription, SubscriptionOptions, SubscriptionQos, SubscriptionState};

mod log;
mod message;

use log::{HandleStack, MessageLog};
pub use message::{Message, MessageEntry, Payload, SeqNum};

const TOPIC_MAGIC: u64 = u64::from_le_bytes(*b"SHMTOPIC");
const RECYCLE_BUDGET_BYTES: usize = 100 * 1024;
const MIN_RECYCLE_SLOTS: usize = 10;

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicQos {
    /// One slot, overwritten by every publish.
    Singleton = 0,
    /// A bounded log; the oldest entry is dropped when it is full.
    Queue = 1,
}

impl TopicQos {
    pub(crate) fn from_raw(raw: u32) -> Option<TopicQos> {
        match raw {
            0 => Some(TopicQos::Singleton),
            1 => Some(TopicQos::Queue),
            _ => None,
        }
    }
}

#[repr(C)]
pub(crate) struct TopicState {
    magic: AtomicU64,
    generation: u64,
    disposing: AtomicU32,
    qos: u32,
    payload_size: u64,
    payload_align: u64,
    name: ShmName,
    core: ShmMutex<TopicCore>,
}

#[repr(C)]
struct TopicCore {
    last_seq: SeqNum,
    log: Handle,
    log_capacity: u64,
    recycle: Handle,
    recycle_capacity: u64,
    subscriber_count: u64,
    subscribers: [Handle; MAX_SUBSCRIBERS],
}

pub(crate) fn state_size() -> usize {
    mem::size_of::<TopicState>()
}

/// Number of retired payload slots kept for reuse: about 100 KiB worth, and
/// never fewer than ten.
pub(crate) fn recycle_capacity(payload_size: usize) -> usize {
    (RECYCLE_BUDGET_BYTES / payload_size.max(1)).max(MIN_RECYCLE_SLOTS)
}

/// Lays out a new topic. The caller holds the directory lock, so nobody else
/// can reach the state before it is complete.
pub(crate) fn create_state(
    segment: &Segment,
    name: &ShmName,
    qos: TopicQos,
    payload_size: usize,
    payload_align: usize,
) -> Result<Handle> {
    let (log_capacity, stack_capacity) = match qos {
        TopicQos::Singleton => (1, 0),
        TopicQos::Queue => (segment.max_log_entries(), recycle_capacity(payload_size)),
    };

    let state = segment.allocate_owned(state_size(), mem::align_of::<TopicState>())?;
    let log_bytes = MessageLog::bytes_for(log_capacity);
    let log = segment.allocate_owned(log_bytes, mem::align_of::<MessageEntry>())?;
    unsafe { MessageLog::init(segment.bytes_at(log.handle(), log_bytes)?, log_capacity) };
    let recycle = if stack_capacity > 0 {
        let stack_bytes = HandleStack::bytes_for(stack_capacity);
        let stack = segment.allocate_owned(stack_bytes, mem::align_of::<Handle>())?;
        unsafe { HandleStack::init(segment.bytes_at(stack.handle(), stack_bytes)?, stack_capacity) };
        Some(stack)
    } else {
        None
    };

    let ptr = segment.address_from_handle::<TopicState>(state.handle())?.as_ptr();
    unsafe {
        ptr::addr_of_mut!((*ptr).generation).write(segment.next_generation());
        ptr::addr_of_mut!((*ptr).qos).write(qos as u32);
        ptr::addr_of_mut!((*ptr).payload_size).write(payload_size as u64);
        ptr::addr_of_mut!((*ptr).payload_align).write(payload_align as u64);
        ptr::addr_of_mut!((*ptr).name).write(*name);
        ShmMutex::init(
            ptr::addr_of_mut!((*ptr).core),
            TopicCore {
                last_seq: 0,
                log: log.handle(),
                log_capacity: log_capacity as u64,
                recycle: recycle.as_ref().map_or(Handle::NULL, |s| s.handle()),
                recycle_capacity: stack_capacity as u64,
                subscriber_count: 0,
                subscribers: [Handle::NULL; MAX_SUBSCRIBERS],
            },
        )?;
        (*ptr).magic.store(TOPIC_MAGIC, Ordering::Release);
    }

    log.into_handle();
    if let Some(stack) = recycle {
        stack.into_handle();
    }
    Ok(state.into_handle())
}

/// Tears a topic down: subscriptions, messages, recycled slots and finally
/// the state itself. Accessors still pointing at it fail with
/// [`ShmemLibError::TopicDisposed`] afterwards.
///
/// Nothing is touched unless the topic lock is taken, so a failed call
/// leaves the topic whole and the caller may keep it registered.
pub(crate) fn destroy_state(segment: &Segment, handle: Handle) -> Result<()> {
    let state = unsafe { segment.get::<TopicState>(handle)? };
    if state.magic.load(Ordering::Acquire) != TOPIC_MAGIC {
        return Err(ShmemLibError::TopicDisposed(handle.to_string()));
    }
    let name = state.name.to_string_lossy();
    let qos = TopicQos::from_raw(state.qos).unwrap_or(TopicQos::Queue);
    {
        let core = state
            .core
            .lock(segment.lock_policy(), LockWait::Timed, &name)?;
        if state.magic.load(Ordering::Acquire) != TOPIC_MAGIC {
            return Err(ShmemLibError::TopicDisposed(name));
        }
        state.disposing.store(1, Ordering::Release);
        let mut topic = LockedTopic {
            segment,
            state,
            qos,
            name: &name,
            core,
        };
        topic.discard_all()?;
        state.magic.store(0, Ordering::Release);
    }
    if let Err(e) = segment.free(handle) {
        error!(topic = %name, error = %e, "failed to free topic state");
    }
    info!(topic = %name, "topic destroyed");
    Ok(())
}

fn write_payload<T: Payload>(segment: &Segment, slot: Handle, payload: &T) -> Result<()> {
    let dst = segment.address_from_handle::<T>(slot)?;
    unsafe { ptr::write(dst.as_ptr(), *payload) };
    Ok(())
}

fn read_payload<T: Payload>(segment: &Segment, entry: &MessageEntry) -> Result<Message<T>> {
    let src = segment.address_from_handle::<T>(entry.handle)?;
    Ok(Message {
        payload: unsafe { ptr::read(src.as_ptr()) },
        timestamp: entry.timestamp,
        sequence: entry.seq,
    })
}

/// A topic whose lock is held for the lifetime of the value.
struct LockedTopic<'a> {
    segment: &'a Segment,
    state: &'a TopicState,
    qos: TopicQos,
    name: &'a str,
    core: ShmMutexGuard<'a, TopicCore>,
}

impl<'a> LockedTopic<'a> {
    fn check_live(&self) -> Result<()> {
        if self.state.disposing.load(Ordering::Acquire) != 0 {
            return Err(ShmemLibError::TopicDisposed(self.name.to_string()));
        }
        Ok(())
    }

    fn log(&mut self) -> Result<MessageLog<'_>> {
        let bytes = MessageLog::bytes_for(self.core.log_capacity as usize);
        let at = self.segment.bytes_at(self.core.log, bytes)?;
        Ok(unsafe { MessageLog::attach(at) })
    }

    fn recycle(&mut self) -> Result<Option<HandleStack<'_>>> {
        if self.core.recycle.is_null() {
            return Ok(None);
        }
        let bytes = HandleStack::bytes_for(self.core.recycle_capacity as usize);
        let at = self.segment.bytes_at(self.core.recycle, bytes)?;
        Ok(Some(unsafe { HandleStack::attach(at) }))
    }

    /// Registered subscriptions; a count beyond the table is clamped.
    fn subscriber_len(&self) -> usize {
        (self.core.subscriber_count as usize).min(MAX_SUBSCRIBERS)
    }

    fn subscribers(&self) -> &[Handle] {
        &self.core.subscribers[..self.subscriber_len()]
    }

    fn with_subscription<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut SubscriptionState) -> R,
    ) -> Result<R> {
        if !self.subscribers().contains(&handle) {
            debug!(topic = %self.name, subscription = %handle, "invalid subscription handle");
            return Err(ShmemLibError::InvalidSubscription(handle));
        }
        let sub = unsafe { self.segment.get_mut::<SubscriptionState>(handle)? };
        Ok(f(sub))
    }

    fn add_subscription(&mut self, handle: Handle) -> Result<()> {
        let count = self.subscriber_len();
        if count >= MAX_SUBSCRIBERS {
            return Err(ShmemLibError::SubscriberLimit {
                topic: self.name.to_string(),
                capacity: MAX_SUBSCRIBERS,
            });
        }
        self.core.subscribers[count] = handle;
        self.core.subscriber_count = count as u64 + 1;
        Ok(())
    }

    fn unlink_subscription(&mut self, index: usize) -> Handle {
        let last = self.subscriber_len() - 1;
        let handle = self.core.subscribers[index];
        self.core.subscribers.swap(index, last);
        self.core.subscribers[last] = Handle::NULL;
        self.core.subscriber_count = last as u64;
        handle
    }

    /// Removes and frees a subscription; `false` if it was not registered.
    fn remove_subscription(&mut self, handle: Handle) -> bool {
        let index = match self.subscribers().iter().position(|h| *h == handle) {
            Some(index) => index,
            None => return false,
        };
        self.unlink_subscription(index);
        if let Err(e) = self.segment.free(handle) {
            warn!(topic = %self.name, subscription = %handle, error = %e, "failed to free subscription");
        }
        true
    }

    fn release_slot(&mut self, slot: Handle) -> Result<()> {
        let recycled = match self.recycle()? {
            Some(mut stack) => stack.push(slot),
            None => false,
        };
        if !recycled {
            self.segment.free(slot)?;
        }
        Ok(())
    }

    fn retire_first(&mut self) -> Result<bool> {
        match self.log()?.pop_front() {
            Some(entry) => self.release_slot(entry.handle).map(|_| true),
            None => Ok(false),
        }
    }

    /// Drops every entry each subscriber has already consumed.
    fn retire_messages(&mut self) -> Result<()> {
        let mut watermark = self.core.last_seq;
        for handle in self.subscribers() {
            if let Ok(sub) = unsafe { self.segment.get::<SubscriptionState>(*handle) } {
                watermark = watermark.min(sub.last_seq);
            }
        }
        loop {
            match self.log()?.front().map(|e| e.seq) {
                Some(seq) if seq <= watermark => {
                    self.retire_first()?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// Removes subscriptions idle for longer than their timeout.
    fn sweep_subscriptions(&mut self, now: Timestamp) -> Result<()> {
        let mut removed = false;
        let mut index = 0;
        while index < self.subscriber_len() {
            let handle = self.core.subscribers[index];
            match unsafe { self.segment.get::<SubscriptionState>(handle) } {
                Ok(sub) if sub.is_expired(now) => {
                    warn!(
                        topic = %self.name,
                        subscription = %handle,
                        idle_ms = now - sub.last_activity,
                        "subscription timed out, removing it"
                    );
                    self.remove_subscription(handle);
                    removed = true;
                }
                Ok(_) => index += 1,
                Err(e) => {
                    error!(topic = %self.name, subscription = %handle, error = %e, "inconsistent subscription entry");
                    self.unlink_subscription(index);
                }
            }
        }
        if removed && self.qos == TopicQos::Queue {
            self.retire_messages()?;
        }
        Ok(())
    }

    fn publish<T: Payload>(&mut self, payload: &T, timestamp: Timestamp) -> Result<SeqNum> {
        let segment = self.segment;
        let now = now_ms();
        let timestamp = if timestamp == INVALID_TIMESTAMP {
            now
        } else {
            timestamp
        };
        let seq = self.core.last_seq + 1;

        if self.qos == TopicQos::Singleton {
            let mut log = self.log()?;
            if let Some(entry) = log.back_mut() {
                write_payload(segment, entry.handle, payload)?;
                entry.seq = seq;
                entry.timestamp = timestamp;
                self.core.last_seq = seq;
                self.sweep_subscriptions(now)?;
                return Ok(seq);
            }
        }

        let reused = match self.recycle()? {
            Some(mut stack) => stack.pop(),
            None => None,
        };
        let slot: OwnedHandle<'_, u8> = match reused {
            Some(handle) => OwnedHandle::adopt(segment, handle),
            None => segment.allocate_owned(mem::size_of::<T>(), mem::align_of::<T>())?,
        };
        write_payload(segment, slot.handle(), payload)?;

        while self.log()?.is_full() {
            if !self.retire_first()? {
                break;
            }
        }
        let entry = MessageEntry {
            handle: slot.handle(),
            seq,
            timestamp,
        };
        let appended = self.log()?.push_back(entry);
        if appended.is_err() {
            return Err(ShmemLibError::Mismatch(format!(
                "message log of {} is unusable",
                self.name
            )));
        }
        slot.into_handle();
        self.core.last_seq = seq;

        self.sweep_subscriptions(now)?;
        Ok(seq)
    }

    fn subscribe(&mut self, options: &SubscriptionOptions) -> Result<Handle> {
        let segment = self.segment;
        let state = segment.create_owned::<SubscriptionState>()?;
        let sub = SubscriptionState::new(options, self.core.last_seq, now_ms());
        unsafe { ptr::write(state.as_ptr()?.as_ptr(), sub) };
        self.add_subscription(state.handle())?;
        Ok(state.into_handle())
    }

    fn read<T: Payload>(&mut self, sub: Handle) -> Result<Option<Message<T>>> {
        let segment = self.segment;
        let (mode, last_seen) = self.with_subscription(sub, |s| (s.qos(), s.last_seq))?;
        let found = {
            let log = self.log()?;
            match mode {
                SubscriptionQos::AtMostOnce => log.back().filter(|e| e.seq != last_seen).copied(),
                SubscriptionQos::All => log
                    .index_after(last_seen)
                    .and_then(|i| log.get(i))
                    .copied(),
            }
        };
        let message = match found {
            Some(entry) => Some(read_payload::<T>(segment, &entry)?),
            None => None,
        };

        let now = now_ms();
        let consumed = message.as_ref().map(|m| m.sequence);
        self.with_subscription(sub, |s| {
            if let Some(seq) = consumed {
                s.last_seq = seq;
            }
            s.last_activity = now;
        })?;
        if consumed.is_some() && self.qos == TopicQos::Queue {
            self.retire_messages()?;
        }
        Ok(message)
    }

    fn read_all<T: Payload>(&mut self, sub: Handle) -> Result<Vec<Message<T>>> {
        let segment = self.segment;
        let last_seen = self.with_subscription(sub, |s| s.last_seq)?;
        let mut messages = Vec::new();
        {
            let log = self.log()?;
            if let Some(first) = log.index_after(last_seen) {
                messages.reserve(log.len() - first);
                for index in first..log.len() {
                    if let Some(entry) = log.get(index) {
                        messages.push(read_payload::<T>(segment, entry)?);
                    }
                }
            }
        }

        let now = now_ms();
        let newest = messages.last().map(|m| m.sequence);
        self.with_subscription(sub, |s| {
            if let Some(seq) = newest {
                s.last_seq = seq;
            }
            s.last_activity = now;
        })?;
        if newest.is_some() && self.qos == TopicQos::Queue {
            self.retire_messages()?;
        }
        Ok(messages)
    }

    fn unsubscribe(&mut self, sub: Handle) -> Result<bool> {
        let removed = self.remove_subscription(sub);
        if removed && self.qos == TopicQos::Queue {
            self.retire_messages()?;
        }
        Ok(removed)
    }

    fn discard_all(&mut self) -> Result<()> {
        let segment = self.segment;
        while self.subscriber_len() > 0 {
            let handle = self.unlink_subscription(0);
            if let Err(e) = segment.free(handle) {
                warn!(topic = %self.name, subscription = %handle, error = %e, "failed to free subscription");
            }
        }

        let mut slots = Vec::new();
        {
            let mut log = self.log()?;
            while let Some(entry) = log.pop_front() {
                slots.push(entry.handle);
            }
        }
        if let Some(mut stack) = self.recycle()? {
            while let Some(handle) = stack.pop() {
                slots.push(handle);
            }
        }
        slots.push(self.core.log);
        if !self.core.recycle.is_null() {
            slots.push(self.core.recycle);
        }
        self.core.log = Handle::NULL;
        self.core.log_capacity = 0;
        self.core.recycle = Handle::NULL;
        self.core.recycle_capacity = 0;

        for handle in slots {
            if let Err(e) = segment.free(handle) {
                warn!(topic = %self.name, %handle, error = %e, "failed to free topic storage");
            }
        }
        Ok(())
    }
}

/// Process-local accessor for one topic, typed by its payload.
pub struct Topic<T> {
    segment: Arc<Segment>,
    handle: Handle,
    generation: u64,
    name: String,
    qos: TopicQos,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Topic {
            segment: Arc::clone(&self.segment),
            handle: self.handle,
            generation: self.generation,
            name: self.name.clone(),
            qos: self.qos,
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("qos", &self.qos)
            .field("handle", &self.handle)
            .finish()
    }
}

impl<T: Payload> Topic<T> {
    pub(crate) fn attach(segment: Arc<Segment>, handle: Handle) -> Result<Topic<T>> {
        let state = unsafe { segment.get::<TopicState>(handle)? };
        if state.magic.load(Ordering::Acquire) != TOPIC_MAGIC {
            return Err(ShmemLibError::TopicDisposed(handle.to_string()));
        }
        let name = state.name.to_string_lossy();
        if state.payload_size != mem::size_of::<T>() as u64
            || state.payload_align != mem::align_of::<T>() as u64
        {
            return Err(ShmemLibError::PayloadMismatch {
                topic: name,
                stored: state.payload_size as usize,
                requested: mem::size_of::<T>(),
            });
        }
        let qos = TopicQos::from_raw(state.qos).ok_or_else(|| {
            ShmemLibError::Mismatch(format!("topic {} has unknown qos {}", name, state.qos))
        })?;
        let generation = state.generation;
        Ok(Topic {
            segment,
            handle,
            generation,
            name,
            qos,
            _payload: PhantomData,
        })
    }

    fn state(&self) -> Result<&TopicState> {
        let state = unsafe { self.segment.get::<TopicState>(self.handle)? };
        if state.magic.load(Ordering::Acquire) != TOPIC_MAGIC || state.generation != self.generation {
            return Err(ShmemLibError::TopicDisposed(self.name.clone()));
        }
        Ok(state)
    }

    fn with_locked<R>(
        &self,
        wait: LockWait,
        f: impl FnOnce(&mut LockedTopic<'_>) -> Result<R>,
    ) -> Result<R> {
        let state = self.state()?;
        let core = state.core.lock(self.segment.lock_policy(), wait, &self.name)?;
        // Destroyed while we were waiting.
        self.state()?;
        let mut topic = LockedTopic {
            segment: &self.segment,
            state,
            qos: self.qos,
            name: &self.name,
            core,
        };
        f(&mut topic)
    }

    /// Publishes `payload` stamped with the current time and returns its
    /// sequence number.
    pub fn publish(&self, payload: &T) -> Result<SeqNum> {
        self.publish_at(payload, INVALID_TIMESTAMP)
    }

    /// Publishes with the message's own timestamp, unless it is unset.
    pub fn publish_message(&self, message: &Message<T>) -> Result<SeqNum> {
        self.publish_at(&message.payload, message.timestamp)
    }

    fn publish_at(&self, payload: &T, timestamp: Timestamp) -> Result<SeqNum> {
        self.with_locked(LockWait::Timed, |topic| {
            topic.check_live()?;
            topic.publish(payload, timestamp)
        })
    }

    /// Registers a new reader whose cursor starts at the current sequence
    /// number, so it only sees messages published from now on.
    pub fn subscribe(&self, options: SubscriptionOptions) -> Result<Subscription<T>> {
        let handle = self.with_locked(LockWait::Timed, |topic| {
            topic.check_live()?;
            topic.subscribe(&options)
        })?;
        debug!(topic = %self.name, subscription = %handle, qos = ?options.qos, "subscribed");
        Ok(Subscription::new(handle, self.clone()))
    }

    pub fn has_subscription(&self) -> Result<bool> {
        Ok(self.subscriber_count()? > 0)
    }

    pub fn subscriber_count(&self) -> Result<usize> {
        self.with_locked(LockWait::Timed, |topic| Ok(topic.subscriber_len()))
    }

    pub fn message_count(&self) -> Result<usize> {
        self.with_locked(LockWait::Timed, |topic| Ok(topic.log()?.len()))
    }

    pub fn last_sequence(&self) -> Result<SeqNum> {
        self.with_locked(LockWait::Timed, |topic| Ok(topic.core.last_seq))
    }

    pub fn is_disposed(&self) -> bool {
        self.state()
            .map(|s| s.disposing.load(Ordering::Acquire) != 0)
            .unwrap_or(true)
    }

    pub fn id(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qos(&self) -> TopicQos {
        self.qos
    }

    pub(crate) fn read(&self, sub: Handle, wait: LockWait) -> Result<Option<Message<T>>> {
        self.with_locked(wait, |topic| topic.read(sub))
    }

    pub(crate) fn read_all(&self, sub: Handle) -> Result<Vec<Message<T>>> {
        self.with_locked(LockWait::Timed, |topic| topic.read_all(sub))
    }

    pub(crate) fn unsubscribe(&self, sub: Handle) -> Result<bool> {
        let removed = self.with_locked(LockWait::Timed, |topic| topic.unsubscribe(sub))?;
        if removed {
            debug!(topic = %self.name, subscription = %sub, "unsubscribed");
        }
        Ok(removed)
    }

    pub(crate) fn cursor_of(&self, sub: Handle) -> Result<SeqNum> {
        self.with_locked(LockWait::Timed, |topic| topic.with_subscription(sub, |s| s.last_seq))
    }

    pub(crate) fn destroy(&self) -> Result<()> {
        self.state()?;
        destroy_state(&self.segment, self.handle)
    }

    /// Takes the topic lock and never gives it back, as a crashed holder would.
    #[cfg(test)]
    pub(crate) fn abandon_lock(&self) -> Result<()> {
        let state = self.state()?;
        let guard = state
            .core
            .lock(self.segment.lock_policy(), LockWait::Timed, &self.name)?;
        mem::forget(guard);
        Ok(())
    }

    /// Overwrites the stored subscriber count, as a torn write would.
    #[cfg(test)]
    pub(crate) fn set_raw_subscriber_count(&self, count: u64) -> Result<()> {
        self.with_locked(LockWait::Timed, |topic| {
            topic.core.subscriber_count = count;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_capacity_scales_with_payload() {
        assert_eq!(recycle_capacity(8), 12_800);
        assert_eq!(recycle_capacity(100 * 1024), MIN_RECYCLE_SLOTS);
        assert_eq!(recycle_capacity(0), RECYCLE_BUDGET_BYTES);
        assert_eq!(recycle_capacity(1024 * 1024), MIN_RECYCLE_SLOTS);
    }

    #[test]
    fn qos_round_trips_through_raw() {
        assert_eq!(TopicQos::from_raw(TopicQos::Queue as u32), Some(TopicQos::Queue));
        assert_eq!(TopicQos::from_raw(7), None);
    }
}
