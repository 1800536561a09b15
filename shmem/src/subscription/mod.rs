//! Per-reader cursors into a topic's log.

use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::lock::LockWait;
use crate::core::{Handle, Timestamp, DEFAULT_SUBSCRIPTION_TIMEOUT_SECS};
use crate::errors::{Result, ShmemLibError};
use crate::topic::{Message, Payload, SeqNum, Topic};

/// Stored in place of a timeout for subscriptions that never expire.
const TIMEOUT_INFINITE: i64 = -1;

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionQos {
    /// Only the newest message, and only once.
    AtMostOnce = 0,
    /// Every message after the cursor, in order.
    All = 1,
}

impl SubscriptionQos {
    pub(crate) fn from_raw(raw: u32) -> Option<SubscriptionQos> {
        match raw {
            0 => Some(SubscriptionQos::AtMostOnce),
            1 => Some(SubscriptionQos::All),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    pub qos: SubscriptionQos,
    /// Inactivity after which a publisher's sweep removes the subscription.
    /// `None` never expires.
    pub timeout: Option<Duration>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        SubscriptionOptions {
            qos: SubscriptionQos::AtMostOnce,
            timeout: Some(Duration::from_secs(DEFAULT_SUBSCRIPTION_TIMEOUT_SECS)),
        }
    }
}

impl SubscriptionOptions {
    pub fn all() -> SubscriptionOptions {
        SubscriptionOptions {
            qos: SubscriptionQos::All,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> SubscriptionOptions {
        self.timeout = timeout;
        self
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct SubscriptionState {
    qos: u32,
    _pad: u32,
    timeout_ms: i64,
    pub(crate) last_seq: SeqNum,
    pub(crate) last_activity: Timestamp,
}

impl SubscriptionState {
    pub(crate) fn new(options: &SubscriptionOptions, last_seq: SeqNum, now: Timestamp) -> Self {
        let timeout_ms = options
            .timeout
            .map_or(TIMEOUT_INFINITE, |t| t.as_millis().min(i64::MAX as u128) as i64);
        SubscriptionState {
            qos: options.qos as u32,
            _pad: 0,
            timeout_ms,
            last_seq,
            last_activity: now,
        }
    }

    pub(crate) fn qos(&self) -> SubscriptionQos {
        SubscriptionQos::from_raw(self.qos).unwrap_or(SubscriptionQos::AtMostOnce)
    }

    pub(crate) fn is_expired(&self, now: Timestamp) -> bool {
        self.timeout_ms != TIMEOUT_INFINITE && now - self.last_activity > self.timeout_ms
    }
}

/// A reader's handle on one topic. Dropping it unsubscribes.
pub struct Subscription<T: Payload> {
    handle: Handle,
    topic: Option<Topic<T>>,
}

impl<T: Payload> Subscription<T> {
    pub(crate) fn new(handle: Handle, topic: Topic<T>) -> Subscription<T> {
        Subscription {
            handle,
            topic: Some(topic),
        }
    }

    fn topic_or_err(&self) -> Result<&Topic<T>> {
        self.topic
            .as_ref()
            .ok_or(ShmemLibError::InvalidSubscription(self.handle))
    }

    /// Next message for this subscriber, waiting at most the lock timeout for
    /// the topic. `Ok(None)` means there is nothing new.
    pub fn read(&self) -> Result<Option<Message<T>>> {
        self.topic_or_err()?.read(self.handle, LockWait::Timed)
    }

    /// Like [`Subscription::read`] but gives up at once if the topic is busy.
    pub fn try_read(&self) -> Result<Option<Message<T>>> {
        self.topic_or_err()?.read(self.handle, LockWait::Try)
    }

    /// Every message after the cursor, oldest first; moves the cursor to the newest.
    pub fn read_all(&self) -> Result<Vec<Message<T>>> {
        self.topic_or_err()?.read_all(self.handle)
    }

    /// Leaves the topic. Calling it again does nothing.
    ///
    /// The local side is detached even when the topic cannot be locked; the
    /// shared state is then left for the publisher's timeout sweep.
    pub fn unsubscribe(&mut self) -> Result<()> {
        match self.topic.take() {
            Some(topic) => topic.unsubscribe(self.handle).map(|_| ()),
            None => Ok(()),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.topic.is_some()
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn topic(&self) -> Option<&Topic<T>> {
        self.topic.as_ref()
    }

    pub fn last_sequence(&self) -> Result<SeqNum> {
        self.topic_or_err()?.cursor_of(self.handle)
    }
}

impl<T: Payload> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Err(e) = self.unsubscribe() {
            match e {
                ShmemLibError::TopicDisposed(_) => {
                    debug!(subscription = %self.handle, "topic already gone")
                }
                e => warn!(subscription = %self.handle, error = %e, "unsubscribe on drop failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = SubscriptionOptions::default();
        assert_eq!(options.qos, SubscriptionQos::AtMostOnce);
        assert_eq!(options.timeout, Some(Duration::from_secs(30)));
        assert_eq!(SubscriptionOptions::all().qos, SubscriptionQos::All);
    }

    #[test]
    fn expiry_respects_timeout() {
        let options = SubscriptionOptions::default().with_timeout(Some(Duration::from_secs(1)));
        let state = SubscriptionState::new(&options, 3, 1_000);
        assert_eq!(state.last_seq, 3);
        assert!(!state.is_expired(2_000));
        assert!(state.is_expired(2_001));

        let forever = SubscriptionState::new(&options.with_timeout(None), 0, 1_000);
        assert!(!forever.is_expired(i64::MAX));
    }

    #[test]
    fn options_from_toml() -> std::result::Result<(), toml::de::Error> {
        let options: SubscriptionOptions = toml::from_str(
            r#"
            qos = "All"
            "#,
        )?;
        assert_eq!(options.qos, SubscriptionQos::All);
        assert_eq!(options.timeout, Some(Duration::from_secs(30)));
        Ok(())
    }
}
