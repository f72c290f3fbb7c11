//! Capture state and its transitions.
//!
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{watch, Mutex};

use crate::{
    capture::{CaptureSession, OpenCamera},
    detector::DetectorReceiver,
    frame_channel,
    meter::{Meter, MeterSnapshot},
    overlay::OverlaySurface,
    poller::{spawn_poller, TickContext, TimerHandle},
    FrameReceiver, FrameSender,
};

enum CaptureState {
    Inactive,
    Active {
        session: CaptureSession,
        timer: TimerHandle,
    },
}

/// Owner of the capture state.
///
/// Activating capture opens the camera and starts the poll timer. Deactivating
/// stops both, empties the frame buffer and clears the overlay. Transitions
/// are serialized, so there is never more than one timer. Dropping the
/// controller releases camera and timer as well.
///
/// After [`CaptureController::shutdown`] capture stays inactive and viewer
/// streams waiting on [`CaptureController::closed`] end.
pub struct CaptureController {
    open_camera: OpenCamera,
    frames_tx: FrameSender,
    ctx: Arc<TickContext>,
    state: Mutex<CaptureState>,
    active: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl CaptureController {
    pub fn new(
        open_camera: OpenCamera,
        detector: DetectorReceiver,
        surface: Arc<OverlaySurface>,
        meter: Arc<Meter>,
    ) -> Self {
        let (frames_tx, frames_rx) = frame_channel();
        let ctx = Arc::new(TickContext::new(frames_rx, detector, surface, meter));

        Self {
            open_camera,
            frames_tx,
            ctx,
            state: Mutex::new(CaptureState::Inactive),
            active: AtomicBool::new(false),
            shutdown_tx: watch::channel(false).0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Flip the capture state and return the new one.
    pub async fn toggle(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if matches!(*state, CaptureState::Inactive) {
            self.activate(&mut state).await?;
        } else {
            self.deactivate(&mut state).await;
        }

        Ok(self.is_active())
    }

    /// Activate capture, if not active yet.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(*state, CaptureState::Inactive) {
            self.activate(&mut state).await?;
        }

        Ok(())
    }

    /// Deactivate capture, if active.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.deactivate(&mut state).await;
    }

    /// Stop capture for good and end all viewer streams.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.shutdown_tx.send_replace(true);
        self.deactivate(&mut state).await;
        log::info!("Capture controller shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Resolves once the controller is shut down.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        async move {
            while !*shutdown_rx.borrow_and_update() {
                if shutdown_rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    async fn activate(&self, state: &mut CaptureState) -> Result<()> {
        if self.is_shut_down() {
            bail!("capture controller is shut down");
        }

        let open_camera = Arc::clone(&self.open_camera);
        let capture_fn = tokio::task::spawn_blocking(move || open_camera())
            .await?
            .map_err(|e| anyhow!(e))
            .context("failed to open camera")?;

        let session_id = self.ctx.begin_session();
        let session = CaptureSession::start(capture_fn, Arc::clone(&self.frames_tx));
        let timer = spawn_poller(Arc::clone(&self.ctx), session_id);

        *state = CaptureState::Active { session, timer };
        self.active.store(true, Ordering::SeqCst);
        log::info!("Capture started");

        Ok(())
    }

    async fn deactivate(&self, state: &mut CaptureState) {
        if let CaptureState::Active { session, timer } =
            std::mem::replace(state, CaptureState::Inactive)
        {
            self.active.store(false, Ordering::SeqCst);
            self.ctx.end_session();

            // Reset before the first await, the caller may be cancelled there
            session.request_stop();
            self.frames_tx.send_replace(None);
            self.ctx.surface().clear();

            timer.cancel().await;
            session.stop().await;
            log::info!("Capture stopped");
        }
    }

    /// Receiver of the latest camera frame.
    pub fn frames(&self) -> FrameReceiver {
        self.ctx.frames()
    }

    pub fn surface(&self) -> &Arc<OverlaySurface> {
        self.ctx.surface()
    }

    pub fn models_ready(&self) -> bool {
        self.ctx.models_ready()
    }

    pub fn detection_in_flight(&self) -> bool {
        self.ctx.detection_in_flight()
    }

    pub fn active_timers(&self) -> usize {
        self.ctx.active_timers()
    }

    pub fn meter(&self) -> MeterSnapshot {
        self.ctx.meter().snapshot()
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        // Results of detections still running must not be drawn anymore
        self.ctx.end_session();
    }
}
