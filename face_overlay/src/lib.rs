//! Live webcam viewer with a face detection overlay, served to the browser.
//!
//! The camera feed and a transparent overlay are streamed as two separate
//! multipart streams. The page stacks the overlay on top of the video. A
//! fixed-period poller runs the face pipeline on the latest frame and redraws
//! the overlay.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use image::RgbImage;
use tokio::sync::watch;

pub mod capture;
pub mod controller;
pub mod detector;
pub mod endpoints;
pub mod meter;
pub mod models;
pub mod nn;
pub mod overlay;
pub mod page;
pub mod poller;
pub mod utils;

/// Period of the detection poller.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Size of the video and of the overlay canvas on top of it.
pub const VIDEO_WIDTH: u32 = 640;
pub const VIDEO_HEIGHT: u32 = 480;

/// Decoded camera frame shared between the stream and the poller.
pub type SharedFrame = Arc<RgbImage>;

/// Single-slot buffer holding the latest frame, empty while no frame is ready.
pub type FrameSender = Arc<watch::Sender<Option<SharedFrame>>>;
pub type FrameReceiver = watch::Receiver<Option<SharedFrame>>;

/// Create an empty frame buffer.
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    let (tx, rx) = watch::channel(None);
    (Arc::new(tx), rx)
}

/// Wrap an encoded image as part of a `multipart/x-mixed-replace` stream.
pub fn as_stream_item(content_type: &str, data: &[u8]) -> Bytes {
    Bytes::from(
        [
            format!("--frame\r\nContent-Type: {content_type}\r\n\r\n").as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}
