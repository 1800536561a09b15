use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use shmem_broker::{
    AccessMode, LaserScan, SegmentStatus, SharedMemory, ShmemConfig, ShmemLibError, Subscription,
    SubscriptionOptions,
};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "scan-subscriber.toml")]
    config: String,
    /// Stop after receiving this many scans.
    #[clap(short = 'n', long = "count")]
    count: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct SubscriberConfig {
    shmem: ShmemConfig,
    subscription: SubscriptionOptions,
    /// Sleep between reads that found nothing new.
    poll_interval_ms: u64,
    /// Sleep between attempts to reattach after the owner went away.
    reopen_interval_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        SubscriberConfig {
            shmem: ShmemConfig::default(),
            subscription: SubscriptionOptions::default(),
            poll_interval_ms: 1,
            reopen_interval_ms: 500,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts: Opts = Opts::parse();
    let cfg: SubscriberConfig = confy::load_path(&opts.config)?;
    let closing = watch_signals()?;

    let shm = SharedMemory::global();
    shm.init(AccessMode::User, cfg.shmem.clone())?;
    let result = run(shm, &cfg, &opts, &closing);
    shm.destroy();
    result
}

fn watch_signals() -> Result<Arc<AtomicBool>, Box<dyn Error>> {
    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    let flag = Arc::clone(&closing);
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "stopping");
            flag.store(true, Ordering::SeqCst);
        }
    });
    Ok(closing)
}

fn subscribe(
    shm: &SharedMemory,
    options: SubscriptionOptions,
) -> shmem_broker::Result<Subscription<LaserScan>> {
    let topic = LaserScan::topic(&shm.topic_directory()?)?;
    topic.subscribe(options)
}

struct ReadStats {
    received: u64,
    missed: u64,
    last_sequence: u64,
}

impl ReadStats {
    fn record(&mut self, sequence: u64, scan: &LaserScan) {
        if self.last_sequence != 0 && sequence > self.last_sequence + 1 {
            self.missed += sequence - self.last_sequence - 1;
        }
        self.last_sequence = sequence;
        self.received += 1;
        if self.received % 100 == 0 {
            let valid = scan.points().iter().filter(|p| p.is_valid()).count();
            eprint!(
                "\rTotal {} scans (sequence: {}, points: {}/{}, skipped: {})",
                self.received,
                sequence,
                valid,
                scan.len(),
                self.missed
            );
        }
    }
}

fn run(
    shm: &SharedMemory,
    cfg: &SubscriberConfig,
    opts: &Opts,
    closing: &AtomicBool,
) -> Result<(), Box<dyn Error>> {
    let poll = Duration::from_millis(cfg.poll_interval_ms);
    let reopen = Duration::from_millis(cfg.reopen_interval_ms);
    let mut subscription = subscribe(shm, cfg.subscription)?;
    let stats = &mut ReadStats {
        received: 0,
        missed: 0,
        last_sequence: 0,
    };

    let start = Instant::now();
    while !closing.load(Ordering::SeqCst) && opts.count.map_or(true, |n| stats.received < n) {
        if !shm.is_valid() {
            match shm.make_it_valid() {
                Ok(SegmentStatus::Reopened) => {
                    info!("segment reopened, subscribing again");
                    subscription = subscribe(shm, cfg.subscription)?;
                    stats.last_sequence = 0;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "waiting for the owner");
                    thread::sleep(reopen);
                    continue;
                }
            }
        }

        match subscription.read() {
            Ok(Some(message)) => stats.record(message.sequence, &message.payload),
            Ok(None) => thread::sleep(poll),
            Err(ShmemLibError::InvalidSubscription(handle)) => {
                warn!(%handle, "subscription expired, subscribing again");
                subscription = subscribe(shm, cfg.subscription)?;
            }
            Err(e) if e.is_transient() => {
                debug!(error = %e, "read skipped");
                thread::sleep(poll);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let duration = start.elapsed();
    let rate = (stats.received as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?} scans read/s. Total time: {:#?}",
        rate as u64, duration
    );
    Ok(())
}
