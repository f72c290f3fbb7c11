//! Boundary to the face pipeline.
//!
use std::sync::Arc;

use anyhow::Result;
use common::Detection;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::SharedFrame;

pub type DetectFuture = BoxFuture<'static, Result<Vec<Detection>>>;

/// Anything that turns a frame into face detections.
///
/// Detection is asynchronous and may fail. Results are ordered as the
/// pipeline reports them.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: SharedFrame) -> DetectFuture;
}

pub type SharedDetector = Arc<dyn Detector>;

/// Slot holding the detector once the models are loaded.
///
/// An empty slot means the pipeline is not ready yet.
pub type DetectorSender = watch::Sender<Option<SharedDetector>>;
pub type DetectorReceiver = watch::Receiver<Option<SharedDetector>>;

pub fn detector_channel() -> (DetectorSender, DetectorReceiver) {
    watch::channel(None)
}
