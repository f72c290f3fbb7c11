//! Endpoints of HTTP server.
//!
use std::{convert::Infallible, sync::Arc};

use axum::{
    body::StreamBody,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use common::Detection;
use futures::StreamExt;
use image::RgbImage;
use serde::Serialize;
use tokio_stream::wrappers::WatchStream;

use crate::{as_stream_item, controller::CaptureController, meter::MeterSnapshot, page};

/// JPEG quality of the video stream.
const JPEG_QUALITY: i32 = 80;

/// Current state of the viewer.
#[derive(Debug, Serialize)]
pub struct Status {
    pub active: bool,
    pub models_ready: bool,
    pub active_timers: usize,
    #[serde(flatten)]
    pub meter: MeterSnapshot,
}

/// Build the router serving the viewer.
pub fn router(controller: Arc<CaptureController>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/toggle", post(toggle))
        .route("/video_stream", get(video_stream))
        .route("/overlay_stream", get(overlay_stream))
        .route("/detections", get(detections))
        .route("/status", get(status))
        .route("/healthcheck", get(healthcheck))
        .layer(Extension(controller))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

pub async fn index(Extension(controller): Extension<Arc<CaptureController>>) -> Html<String> {
    Html(page::render(controller.is_active()))
}

/// Flip the capture state and go back to the page.
pub async fn toggle(
    Extension(controller): Extension<Arc<CaptureController>>,
) -> Result<Redirect, (StatusCode, String)> {
    match controller.toggle().await {
        Ok(active) => {
            log::info!("Capture toggled, active: {active}");
            Ok(Redirect::to("/"))
        }
        Err(e) => {
            log::error!("Failed to toggle capture: {e:#}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))
        }
    }
}

// Endpoint of the camera frames.
pub async fn video_stream(
    Extension(controller): Extension<Arc<CaptureController>>,
) -> impl IntoResponse {
    log::info!("Video stream requested");

    let stream = WatchStream::new(controller.frames())
        .filter_map(|frame| async move {
            let frame = frame?;
            match tokio::task::spawn_blocking(move || encode_jpeg(&frame)).await {
                Ok(Ok(item)) => Some(Ok::<_, Infallible>(item)),
                Ok(Err(e)) => {
                    log::warn!("Failed to encode frame: {e:#}");
                    None
                }
                Err(e) => {
                    log::error!("Frame encoding task failed: {e}");
                    None
                }
            }
        })
        .take_until(controller.closed());

    multipart_response(StreamBody::new(stream))
}

// Endpoint of the overlay, PNG encoded to keep it transparent.
pub async fn overlay_stream(
    Extension(controller): Extension<Arc<CaptureController>>,
) -> impl IntoResponse {
    log::info!("Overlay stream requested");

    let stream = WatchStream::new(controller.surface().subscribe())
        .filter_map(|png| async move {
            png.map(|png| Ok::<_, Infallible>(as_stream_item("image/png", &png)))
        })
        .take_until(controller.closed());

    multipart_response(StreamBody::new(stream))
}

/// Detections shown on the overlay right now.
pub async fn detections(
    Extension(controller): Extension<Arc<CaptureController>>,
) -> Json<Vec<Detection>> {
    Json(controller.surface().detections().as_ref().clone())
}

pub async fn status(Extension(controller): Extension<Arc<CaptureController>>) -> Json<Status> {
    Json(Status {
        active: controller.is_active(),
        models_ready: controller.models_ready(),
        active_timers: controller.active_timers(),
        meter: controller.meter(),
    })
}

fn encode_jpeg(frame: &RgbImage) -> anyhow::Result<Bytes> {
    let buf = turbojpeg::compress_image(frame, JPEG_QUALITY, turbojpeg::Subsamp::Sub2x2)?;
    Ok(as_stream_item("image/jpeg", &buf))
}

/// Set body and headers for multipart streaming.
fn multipart_response(body: impl IntoResponse) -> impl IntoResponse {
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}
