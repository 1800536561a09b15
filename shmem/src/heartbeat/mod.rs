//! Liveness signal of the segment owner.
//!
//! The owner bumps a counter in the segment header at a fixed interval. Every
//! other participant watches it. An observer reports the owner alive only
//! after it has seen the counter move, and dead again once the counter has
//! not moved for the grace period.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::Segment;
use crate::errors::Result;

/// Gives the heartbeat thread the header counter of a segment it keeps mapped.
pub struct SegmentCounter(pub Arc<Segment>);

impl Deref for SegmentCounter {
    type Target = AtomicU32;

    fn deref(&self) -> &AtomicU32 {
        self.0.heartbeat_counter()
    }
}

struct Shared {
    running: AtomicBool,
    active: AtomicBool,
}

pub struct Heartbeat {
    is_owner: bool,
    interval: Duration,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start<C>(is_owner: bool, counter: C, interval: Duration, grace: Duration) -> Result<Heartbeat>
    where
        C: Deref<Target = AtomicU32> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            active: AtomicBool::new(is_owner),
        });
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("shmem-heartbeat".to_string())
            .spawn(move || {
                if is_owner {
                    beat(&worker_shared, &counter, interval)
                } else {
                    watch(&worker_shared, &counter, interval, grace)
                }
            })?;
        debug!(is_owner, ?interval, ?grace, "heartbeat started");
        Ok(Heartbeat {
            is_owner,
            interval,
            shared,
            thread: Some(thread),
        })
    }

    /// Whether the owner's counter moved within the grace period. Always true
    /// on the owner while the heartbeat runs.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Blocks until the owner has been seen beating, for at most `timeout`.
    pub fn wait_active(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_active() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || self.thread.is_none() {
                return false;
            }
            thread::sleep(self.interval.min(deadline - now));
        }
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("heartbeat thread panicked");
            }
            self.shared.active.store(false, Ordering::Release);
            debug!(is_owner = self.is_owner, "heartbeat stopped");
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

fn beat(shared: &Shared, counter: &AtomicU32, interval: Duration) {
    while shared.running.load(Ordering::Acquire) {
        counter.fetch_add(1, Ordering::Release);
        thread::park_timeout(interval);
    }
}

fn watch(shared: &Shared, counter: &AtomicU32, interval: Duration, grace: Duration) {
    let started = Instant::now();
    let mut last_value = counter.load(Ordering::Acquire);
    // None until the counter has moved at least once.
    let mut last_change: Option<Instant> = None;
    while shared.running.load(Ordering::Acquire) {
        thread::park_timeout(interval);
        let value = counter.load(Ordering::Acquire);
        if value != last_value {
            last_value = value;
            last_change = Some(Instant::now());
        }
        let alive = last_change.map_or(false, |t| t.elapsed() <= grace);
        let was_alive = shared.active.swap(alive, Ordering::AcqRel);
        if was_alive && !alive {
            let silent_for = last_change.unwrap_or(started).elapsed();
            warn!(?silent_for, "segment owner heartbeat lost");
        } else if !was_alive && alive {
            info!("segment owner heartbeat observed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(10);
    const GRACE: Duration = Duration::from_millis(100);

    #[test]
    fn owner_advances_counter() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut owner = Heartbeat::start(true, Arc::clone(&counter), INTERVAL, GRACE).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(owner.is_active());
        assert!(counter.load(Ordering::Acquire) >= 2);
        owner.stop();
        assert!(!owner.is_active());
    }

    #[test]
    fn observer_notices_silence() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut owner = Heartbeat::start(true, Arc::clone(&counter), INTERVAL, GRACE).unwrap();
        let observer = Heartbeat::start(false, Arc::clone(&counter), INTERVAL, GRACE).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert!(observer.is_active());

        owner.stop();
        thread::sleep(GRACE + Duration::from_millis(100));
        assert!(!observer.is_active());
        assert!(!observer.is_owner());
    }

    #[test]
    fn observer_starts_inactive_until_a_beat() {
        let counter = Arc::new(AtomicU32::new(7));
        let observer = Heartbeat::start(false, Arc::clone(&counter), INTERVAL, GRACE).unwrap();
        assert!(!observer.is_active());
        assert!(!observer.wait_active(Duration::from_millis(60)));

        counter.fetch_add(1, Ordering::Release);
        assert!(observer.wait_active(GRACE));
        assert!(observer.is_active());
    }
}
