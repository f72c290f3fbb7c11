//! Detection poller.
//!
//! While capture is active, a timer fires every [`POLL_INTERVAL`]. A tick is
//! skipped if its capture session is over, the detector is not loaded yet,
//! no frame is available or an earlier detection is still running. Otherwise
//! the latest frame is passed to the detector and the result drawn on the
//! overlay, unless capture was stopped in the meantime.
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use crate::{
    detector::DetectorReceiver, meter::Meter, overlay::OverlaySurface, FrameReceiver,
    POLL_INTERVAL,
};

/// State shared between the controller, the timer and running detections.
pub struct TickContext {
    frames: FrameReceiver,
    detector: DetectorReceiver,
    surface: Arc<OverlaySurface>,
    meter: Arc<Meter>,
    session: AtomicU64,
    in_flight: AtomicBool,
    active_timers: AtomicUsize,
}

impl TickContext {
    pub fn new(
        frames: FrameReceiver,
        detector: DetectorReceiver,
        surface: Arc<OverlaySurface>,
        meter: Arc<Meter>,
    ) -> Self {
        Self {
            frames,
            detector,
            surface,
            meter,
            session: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            active_timers: AtomicUsize::new(0),
        }
    }

    /// Start a new capture session and return its id.
    pub fn begin_session(&self) -> u64 {
        self.session.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Invalidate the current capture session.
    pub fn end_session(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
    }

    fn is_current(&self, session: u64) -> bool {
        self.session.load(Ordering::SeqCst) == session
    }

    pub fn frames(&self) -> FrameReceiver {
        self.frames.clone()
    }

    pub fn surface(&self) -> &Arc<OverlaySurface> {
        &self.surface
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn models_ready(&self) -> bool {
        self.detector.borrow().is_some()
    }

    pub fn detection_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of running poll timers.
    pub fn active_timers(&self) -> usize {
        self.active_timers.load(Ordering::SeqCst)
    }
}

/// Handle of a running poll timer.
///
/// The timer is aborted when the handle is cancelled or dropped.
pub struct TimerHandle {
    handle: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Abort the timer and wait until it is gone.
    pub async fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            // The only possible error is the cancellation itself
            handle.await.ok();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Counts a timer as active for as long as it lives.
struct TimerGuard(Arc<TickContext>);

impl TimerGuard {
    fn new(ctx: Arc<TickContext>) -> Self {
        ctx.active_timers.fetch_add(1, Ordering::SeqCst);
        Self(ctx)
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.active_timers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a detection as running for as long as it lives.
struct InFlightGuard(Arc<TickContext>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Spawn the poll timer of a capture session.
pub fn spawn_poller(ctx: Arc<TickContext>, session: u64) -> TimerHandle {
    let guard = TimerGuard::new(Arc::clone(&ctx));

    let handle = tokio::spawn(async move {
        let _guard = guard;
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            tick(&ctx, session);
        }
    });

    TimerHandle {
        handle: Some(handle),
    }
}

fn tick(ctx: &Arc<TickContext>, session: u64) {
    ctx.meter.tick();

    if !ctx.is_current(session) {
        return skip(ctx, "Capture is not active");
    }
    let Some(detector) = ctx.detector.borrow().clone() else {
        return skip(ctx, "Models not loaded yet");
    };
    let Some(frame) = ctx.frames.borrow().clone() else {
        return skip(ctx, "Video not ready for face detection");
    };
    if ctx.in_flight.swap(true, Ordering::SeqCst) {
        return skip(ctx, "Previous detection still running");
    }

    let in_flight = InFlightGuard(Arc::clone(ctx));
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let _in_flight = in_flight;

        match detector.detect(frame).await {
            Ok(detections) => {
                ctx.meter.tick_detected();
                log::debug!("Found {} faces", detections.len());

                // Drawing and PNG encoding hold the canvas lock
                let draw_ctx = Arc::clone(&ctx);
                let drawn = tokio::task::spawn_blocking(move || {
                    draw_ctx
                        .surface
                        .draw_when(|| draw_ctx.is_current(session), detections)
                })
                .await;
                match drawn {
                    Ok(true) => {}
                    Ok(false) => log::debug!("Discarding detections of stopped capture"),
                    Err(e) => log::error!("Overlay drawing task failed: {e}"),
                }
            }
            Err(e) => {
                ctx.meter.tick_failed();
                log::warn!("Face detection failed: {e:#}");
            }
        }
    });
}

fn skip(ctx: &TickContext, reason: &str) {
    ctx.meter.tick_skipped();
    log::debug!("{reason}, skipping tick");
}
