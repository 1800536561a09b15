use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

use shared_memory::ShmemConf;

use super::{owner, test_config, user};
use crate::{
    AccessMode, Segment, SegmentStatus, SharedMemory, ShmemLibError, SubscriptionOptions, TopicQos,
};

#[test]
fn stale_topic_lock_is_forced_open() -> Result<(), Box<dyn Error>> {
    let mut config = test_config("stale");
    config.lock_timeout_ms = 50;
    config.stale_lock_ms = 300;
    let crashed = owner(&config);
    let survivor = user(&config);

    let holder = crashed
        .topic_directory()?
        .get_or_create_topic::<u64>("twist", TopicQos::Singleton)?;
    let topic = survivor
        .topic_directory()?
        .get_or_create_topic::<u64>("twist", TopicQos::Singleton)?;

    thread::spawn(move || holder.abandon_lock())
        .join()
        .expect("holder thread")?;

    // Recently taken: still considered alive.
    let err = topic.publish(&1).err().expect("lock should be busy");
    assert!(matches!(err, ShmemLibError::LockTimeout { .. }));
    assert!(err.is_transient());

    thread::sleep(Duration::from_millis(350));
    let started = Instant::now();
    assert_eq!(topic.publish(&2)?, 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(topic.last_sequence()?, 1);
    Ok(())
}

#[test]
fn try_read_gives_up_on_a_busy_topic() -> Result<(), Box<dyn Error>> {
    let mut config = test_config("tryread");
    config.lock_timeout_ms = 500;
    let shm = owner(&config);
    let topic = shm
        .topic_directory()?
        .get_or_create_topic::<u64>("joints", TopicQos::Singleton)?;
    let sub = topic.subscribe(SubscriptionOptions::default())?;
    topic.publish(&5)?;

    let holder = topic.clone();
    thread::spawn(move || holder.abandon_lock())
        .join()
        .expect("holder thread")?;

    let started = Instant::now();
    assert!(matches!(sub.try_read(), Err(ShmemLibError::LockTimeout { .. })));
    assert!(started.elapsed() < Duration::from_millis(400));
    Ok(())
}

#[test]
fn user_notices_owner_loss_and_reopens() -> Result<(), Box<dyn Error>> {
    let mut config = test_config("reopen");
    config.heartbeat_interval_ms = 10;
    config.heartbeat_grace_ms = 100;

    let first_owner = owner(&config);
    let client = user(&config);
    assert!(client.is_valid());
    assert_eq!(client.make_it_valid()?, SegmentStatus::Success);

    first_owner.destroy();
    drop(first_owner);
    thread::sleep(Duration::from_millis(300));
    assert!(!client.is_valid());
    let err = client.topic_directory().err().expect("segment should be refused");
    assert!(matches!(err, ShmemLibError::InvalidSegment { .. }));
    assert!(err.is_transient());

    // Nothing to reopen until a new owner shows up.
    assert!(client.make_it_valid().is_err());
    assert_eq!(client.status()?, SegmentStatus::NotOpened);

    let second_owner = SharedMemory::new();
    second_owner.init(AccessMode::Owner, config.clone())?;
    second_owner
        .topic_directory()?
        .get_or_create_topic::<u64>("after_restart", TopicQos::Queue)?;

    assert_eq!(client.make_it_valid()?, SegmentStatus::Reopened);
    assert_eq!(client.status()?, SegmentStatus::Reopened);
    assert!(client.is_valid());
    assert!(client.topic_directory()?.contains_topic("after_restart")?);
    Ok(())
}

#[test]
fn reopen_requires_init() {
    let shm = SharedMemory::new();
    assert!(matches!(shm.reopen(), Err(ShmemLibError::NotInitialized)));
    assert!(matches!(
        shm.make_it_valid(),
        Err(ShmemLibError::NotInitialized)
    ));
}

#[test]
fn sub_second_lock_timeout_is_waited_out() -> Result<(), Box<dyn Error>> {
    let mut config = test_config("subsec");
    config.lock_timeout_ms = 999;
    config.stale_lock_ms = 60_000;
    let shm = owner(&config);
    let topic = shm
        .topic_directory()?
        .get_or_create_topic::<u64>("cmd_vel", TopicQos::Queue)?;

    let holder = topic.clone();
    thread::spawn(move || holder.abandon_lock())
        .join()
        .expect("holder thread")?;

    let started = Instant::now();
    let err = topic.publish(&1).err().expect("lock should be busy");
    let waited = started.elapsed();
    assert!(matches!(err, ShmemLibError::LockTimeout { .. }));
    assert!(waited >= Duration::from_millis(990), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(3), "waited {:?}", waited);
    Ok(())
}

#[test]
fn stale_directory_lock_is_forced_open() -> Result<(), Box<dyn Error>> {
    let mut config = test_config("dirlock");
    config.lock_timeout_ms = 50;
    config.stale_lock_ms = 300;
    let crashed = owner(&config);
    let survivor = user(&config);

    let holder = crashed.topic_directory()?;
    thread::spawn(move || holder.abandon_lock())
        .join()
        .expect("holder thread")?;

    let dir = survivor.topic_directory()?;
    assert!(matches!(
        dir.get_or_create_topic::<u64>("tf", TopicQos::Queue),
        Err(ShmemLibError::LockTimeout { .. })
    ));

    thread::sleep(Duration::from_millis(350));
    let started = Instant::now();
    let topic = dir.get_or_create_topic::<u64>("tf", TopicQos::Queue)?;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(topic.publish(&9)?, 1);
    assert!(crashed.topic_directory()?.contains_topic("tf")?);
    Ok(())
}

#[test]
fn failed_delete_keeps_the_topic_registered() -> Result<(), Box<dyn Error>> {
    let mut config = test_config("keepdel");
    config.lock_timeout_ms = 50;
    config.stale_lock_ms = 300;
    let shm = owner(&config);
    let dir = shm.topic_directory()?;
    let topic = dir.get_or_create_topic::<u64>("nav_goal", TopicQos::Queue)?;

    let holder = topic.clone();
    thread::spawn(move || holder.abandon_lock())
        .join()
        .expect("holder thread")?;

    assert!(matches!(
        dir.delete_topic("nav_goal"),
        Err(ShmemLibError::LockTimeout { .. })
    ));
    assert!(dir.contains_topic("nav_goal")?);
    assert!(!topic.is_disposed());

    thread::sleep(Duration::from_millis(350));
    assert!(dir.delete_topic("nav_goal")?);
    assert!(!dir.contains_topic("nav_goal")?);
    assert!(topic.is_disposed());
    Ok(())
}

#[test]
fn foreign_segment_is_reported_then_replaced() -> Result<(), Box<dyn Error>> {
    let mut config = test_config("foreign");
    config.attach_timeout_ms = 50;
    config.heartbeat_interval_ms = 10;
    config.heartbeat_grace_ms = 200;

    // Same name, never laid out by this broker. Whoever replaces it unlinks it.
    let mut foreign = ShmemConf::new()
        .size(config.size)
        .os_id(config.os_id())
        .create()?;
    foreign.set_owner(false);

    let client = SharedMemory::new();
    let err = client
        .init(AccessMode::User, config.clone())
        .err()
        .expect("foreign segment should be refused");
    assert!(matches!(err, ShmemLibError::Mismatch(_)));
    assert_eq!(client.status()?, SegmentStatus::Mismatch);
    assert!(!client.is_valid());

    let replacement = SharedMemory::new();
    assert_eq!(
        replacement.init(AccessMode::Owner, config.clone())?,
        SegmentStatus::Success
    );
    replacement
        .topic_directory()?
        .get_or_create_topic::<u64>("battery_state", TopicQos::Singleton)?;

    assert_eq!(client.make_it_valid()?, SegmentStatus::Reopened);
    assert!(client.is_valid());
    assert!(client.topic_directory()?.contains_topic("battery_state")?);
    drop(foreign);
    Ok(())
}

#[test]
fn segment_without_a_live_owner_is_refused() -> Result<(), Box<dyn Error>> {
    let mut config = test_config("orphan");
    config.heartbeat_interval_ms = 10;
    config.heartbeat_grace_ms = 150;

    // Laid out by an owner that died before its heartbeat ever ran.
    let _orphan = Segment::create(&config)?;

    let client = SharedMemory::new();
    let started = Instant::now();
    let err = client
        .init(AccessMode::User, config.clone())
        .err()
        .expect("ownerless segment should be refused");
    assert!(matches!(err, ShmemLibError::InvalidSegment { .. }));
    assert!(err.is_transient());
    assert!(started.elapsed() >= Duration::from_millis(140));
    assert_eq!(client.status()?, SegmentStatus::NotOpened);
    assert!(!client.is_valid());
    assert!(client.make_it_valid().is_err());
    assert!(!client.is_valid());

    let adopter = SharedMemory::new();
    assert_eq!(
        adopter.init(AccessMode::Owner, config.clone())?,
        SegmentStatus::Success
    );
    assert_eq!(client.make_it_valid()?, SegmentStatus::Reopened);
    assert!(client.is_valid());
    Ok(())
}
