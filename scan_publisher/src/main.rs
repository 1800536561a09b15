use std::error::Error;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shmem_broker::laser::LASER_SCAN_CAPACITY;
use shmem_broker::{AccessMode, LaserPoint, LaserScan, SharedMemory, ShmemConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "scan-publisher.toml")]
    config: String,
    /// Stop after publishing this many scans.
    #[clap(short = 'n', long = "count")]
    count: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct PublisherConfig {
    shmem: ShmemConfig,
    access: AccessMode,
    /// Scans per second; 0 publishes as fast as possible.
    rate_hz: u32,
    points_per_scan: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            shmem: ShmemConfig::default(),
            access: AccessMode::Owner,
            rate_hz: 20,
            points_per_scan: 720,
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
    let cfg: PublisherConfig = confy::load_path(&opts.config)?;
    let closing = watch_signals()?;

    let shm = SharedMemory::global();
    let status = shm.init(cfg.access, cfg.shmem.clone())?;
    info!(segment = %cfg.shmem.name, ?status, "shared memory ready");
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

/// A slowly breathing circular room, so readers can see the data move.
fn fill_scan(scan: &mut LaserScan, frame: u64, points: usize) {
    scan.clear();
    let phase = frame as f32 * 0.05;
    for i in 0..points {
        let angle = i as f32 * TAU / points as f32;
        let distance = 2.0 + 0.25 * (angle * 3.0 + phase).sin();
        let point = LaserPoint::new(angle, distance, i % 97 != 0).with_quality(200);
        if !scan.push(point) {
            break;
        }
    }
}

fn run(
    shm: &SharedMemory,
    cfg: &PublisherConfig,
    opts: &Opts,
    closing: &AtomicBool,
) -> Result<(), Box<dyn Error>> {
    let topic = LaserScan::topic(&shm.topic_directory()?)?;
    let period = if cfg.rate_hz == 0 {
        None
    } else {
        Some(Duration::from_secs(1) / cfg.rate_hz)
    };
    let points = cfg.points_per_scan.min(LASER_SCAN_CAPACITY);
    if points < cfg.points_per_scan {
        warn!(
            requested = cfg.points_per_scan,
            points, "scan size clamped to capacity"
        );
    }

    // Scans are large; keep the one we reuse off the stack.
    let mut scan = Box::new(LaserScan::new());
    let start = Instant::now();
    let mut published = 0u64;
    while !closing.load(Ordering::SeqCst) && opts.count.map_or(true, |n| published < n) {
        let tick = Instant::now();
        fill_scan(&mut scan, published, points);
        match topic.publish(&scan) {
            Ok(sequence) => {
                published += 1;
                if sequence % 100 == 0 {
                    eprint!("\rTotal {} scans (sequence: {})", published, sequence);
                }
            }
            Err(e) if e.is_transient() => warn!(error = %e, "scan dropped"),
            Err(e) => return Err(e.into()),
        }
        if let Some(rest) = period.and_then(|p| p.checked_sub(tick.elapsed())) {
            thread::sleep(rest);
        }
    }

    let duration = start.elapsed();
    let rate = (published as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?} scans published/s. Total time: {:#?}",
        rate as u64, duration
    );
    Ok(())
}
