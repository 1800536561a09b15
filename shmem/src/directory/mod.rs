//! Name to topic registry stored in the segment.

use std::mem;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info};

use crate::core::lock::{LockWait, ShmMutex, ShmMutexGuard};
use crate::core::{Handle, Segment, ShmName, MAX_TOPICS};
use crate::errors::{Result, ShmemLibError};
use crate::subscription::{Subscription, SubscriptionOptions};
use crate::topic::{self, Payload, Topic, TopicQos};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct DirectoryEntry {
    name: ShmName,
    qos: u32,
    topic: Handle,
}

#[repr(C)]
#[derive(Zeroable)]
pub(crate) struct DirectoryTable {
    count: u64,
    entries: [DirectoryEntry; MAX_TOPICS],
}

impl DirectoryTable {
    fn entries(&self) -> &[DirectoryEntry] {
        &self.entries[..(self.count as usize).min(MAX_TOPICS)]
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.name.matches(name))
    }

    fn remove(&mut self, index: usize) -> DirectoryEntry {
        let last = self.entries().len() - 1;
        let entry = self.entries[index];
        self.entries.swap(index, last);
        self.entries[last] = DirectoryEntry::zeroed();
        self.count = last as u64;
        entry
    }
}

type DirectoryState = ShmMutex<DirectoryTable>;

pub(crate) fn state_size() -> usize {
    mem::size_of::<DirectoryState>()
}

/// Allocates the empty directory while the segment is being formatted.
pub(crate) fn create_state(segment: &Segment) -> Result<Handle> {
    let state = segment.allocate_owned(state_size(), mem::align_of::<DirectoryState>())?;
    let ptr = segment.address_from_handle::<DirectoryState>(state.handle())?;
    unsafe { ShmMutex::init(ptr.as_ptr(), DirectoryTable::zeroed())? };
    Ok(state.into_handle())
}

/// Process-local view of the segment's topic directory.
#[derive(Clone)]
pub struct TopicDirectory {
    segment: Arc<Segment>,
}

impl TopicDirectory {
    pub fn new(segment: Arc<Segment>) -> TopicDirectory {
        TopicDirectory { segment }
    }

    fn lock(&self) -> Result<ShmMutexGuard<'_, DirectoryTable>> {
        let state = unsafe { self.segment.get::<DirectoryState>(self.segment.directory_handle())? };
        state.lock(self.segment.lock_policy(), LockWait::Timed, "directory")
    }

    pub fn contains_topic(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.find(name).is_some())
    }

    /// Looks `name` up and creates the topic on a miss. An existing topic
    /// keeps the QoS it was created with.
    pub fn get_or_create_topic<T: Payload>(&self, name: &str, qos: TopicQos) -> Result<Topic<T>> {
        let stored = ShmName::new(name)?;
        let mut table = self.lock()?;
        let handle = match table.find(name) {
            Some(index) => table.entries[index].topic,
            None => {
                let count = table.entries().len();
                if count >= MAX_TOPICS {
                    return Err(ShmemLibError::DirectoryFull {
                        capacity: MAX_TOPICS,
                    });
                }
                let handle = topic::create_state(
                    &self.segment,
                    &stored,
                    qos,
                    mem::size_of::<T>(),
                    mem::align_of::<T>(),
                )?;
                table.entries[count] = DirectoryEntry {
                    name: stored,
                    qos: qos as u32,
                    topic: handle,
                };
                table.count = count as u64 + 1;
                info!(topic = name, ?qos, %handle, "created topic");
                handle
            }
        };
        Topic::attach(Arc::clone(&self.segment), handle)
    }

    /// Gets or creates the topic and subscribes to it.
    pub fn subscribe<T: Payload>(
        &self,
        name: &str,
        qos: TopicQos,
        options: SubscriptionOptions,
    ) -> Result<Subscription<T>> {
        self.get_or_create_topic::<T>(name, qos)?.subscribe(options)
    }

    /// Unregisters and destroys a topic. Returns `false` if there was none.
    ///
    /// Accessors and subscriptions other processes still hold for it fail
    /// with [`ShmemLibError::TopicDisposed`] from then on.
    ///
    /// The entry is only unregistered once the topic itself was torn down, so
    /// a topic whose lock cannot be taken stays reachable for another try.
    pub fn delete_topic(&self, name: &str) -> Result<bool> {
        let mut table = self.lock()?;
        let index = match table.find(name) {
            Some(index) => index,
            None => {
                debug!(topic = name, "no such topic to delete");
                return Ok(false);
            }
        };
        topic::destroy_state(&self.segment, table.entries[index].topic)?;
        table.remove(index);
        Ok(true)
    }

    /// Deletes the topic behind an accessor, provided it is still the one
    /// registered under its name.
    pub fn delete<T: Payload>(&self, topic: Topic<T>) -> Result<()> {
        let mut table = self.lock()?;
        let index = table
            .entries()
            .iter()
            .position(|e| e.topic == topic.id())
            .ok_or_else(|| ShmemLibError::TopicDisposed(topic.name().to_string()))?;
        topic.destroy()?;
        table.remove(index);
        Ok(())
    }

    /// Takes the directory lock and never gives it back, as a crashed holder
    /// would.
    #[cfg(test)]
    pub(crate) fn abandon_lock(&self) -> Result<()> {
        mem::forget(self.lock()?);
        Ok(())
    }

    pub fn topic_names(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .entries()
            .iter()
            .map(|e| e.name.to_string_lossy())
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries().len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}
