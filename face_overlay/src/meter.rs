use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{task::JoinHandle, time::interval};

/// Counters of the detection poller.
#[derive(Default)]
pub struct Meter {
    ticks: AtomicU64,
    detections: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

/// Totals since the meter was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MeterSnapshot {
    pub ticks: u64,
    pub detections: u64,
    #[serde(rename = "skipped_ticks")]
    pub skipped: u64,
    pub failures: u64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            ticks: AtomicU64::new(0),
            detections: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_detected(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_failed(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

pub fn spawn_meter_logger(meter: Arc<Meter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;
        let mut last = meter.snapshot();

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let current = meter.snapshot();
            let elapsed = start.elapsed().as_secs_f32();
            let ticks = current.ticks - last.ticks;
            let detections = current.detections - last.detections;
            let skipped = current.skipped - last.skipped;
            let failures = current.failures - last.failures;
            last = current;

            if ticks > 0 {
                log::info!(
                    "Ticks per second: {:.2}, detections per second: {:.2}, skipped: {skipped}",
                    ticks as f32 / elapsed,
                    detections as f32 / elapsed
                );
            }
            if failures > 0 {
                log::warn!("{failures} detections failed in the last {elapsed:.1}s");
            }
        }
    })
}
