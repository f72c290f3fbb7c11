//! Capture session pumping camera frames into the frame buffer.
//!
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use webcam::{sensors::CaptureFn, CaptureConstraints};

use crate::FrameSender;

/// Pause before retrying after a failed capture.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Opens the camera whenever capture is activated.
pub type OpenCamera = Arc<dyn Fn() -> Result<CaptureFn, webcam::Error> + Send + Sync>;

/// Open a V4L2 camera with the given constraints.
pub fn v4l_camera(constraints: CaptureConstraints) -> OpenCamera {
    Arc::new(move || webcam::sensors::open_camera(&constraints))
}

/// Running capture of an opened camera.
///
/// Frames are captured on the blocking thread pool and replace the content of
/// the frame buffer. Stopping the session releases the camera.
pub struct CaptureSession {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureSession {
    pub fn start(capture_fn: CaptureFn, frames_tx: FrameSender) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        let stop_ = Arc::clone(&stop);
        let handle = tokio::task::spawn_blocking(move || {
            let mut num_frames: u64 = 0;
            while !stop_.load(Ordering::SeqCst) {
                match capture_fn() {
                    Some(frame) => {
                        num_frames += 1;
                        // Checked under the channel lock, a stopped session never
                        // overwrites the emptied buffer
                        let frame = Arc::new(frame);
                        frames_tx.send_if_modified(|slot| {
                            if stop_.load(Ordering::SeqCst) {
                                return false;
                            }
                            *slot = Some(frame);
                            true
                        });
                    }
                    None => {
                        log::error!("Unable to capture frame, trying again...");
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }

            drop(capture_fn);
            log::info!("Camera released after {num_frames} frames");
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the capture task to stop without waiting for it.
    ///
    /// No frame is published to the buffer afterwards.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop capturing and wait until the camera is released.
    pub async fn stop(mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("Capture task failed: {e}");
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.request_stop();
    }
}
