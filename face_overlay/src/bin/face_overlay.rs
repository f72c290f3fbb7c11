//! Face overlay viewer binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use common::DetectorOptions;
use env_logger::TimestampPrecision;
use face_overlay::{
    capture::v4l_camera,
    controller::CaptureController,
    detector::detector_channel,
    endpoints::router,
    meter::{spawn_meter_logger, Meter},
    models::{spawn_model_loader, ModelLoader},
    overlay::{load_font, Overlay, OverlaySurface},
    utils::default_models_dir,
    VIDEO_HEIGHT, VIDEO_WIDTH,
};
use webcam::CaptureConstraints;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the viewer on
    #[clap(long, env = "SERVER_ADDRESS", default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Public URL of the app, models are fetched from `<public-url>/models`
    #[clap(
        long,
        env = "PUBLIC_URL",
        default_value = "http://127.0.0.1:8080/facial-rec-app"
    )]
    public_url: String,

    /// Directory to cache the downloaded models in
    #[clap(long, env = "MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// Video device of the camera
    #[clap(long, env = "VIDEO_DEVICE", default_value = "/dev/video0")]
    device: String,

    /// Font for the text fields of the overlay
    #[clap(
        long,
        env = "OVERLAY_FONT",
        default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"
    )]
    font: PathBuf,

    /// Minimum score of a face detection
    #[clap(long, default_value_t = 0.5)]
    score_threshold: f32,

    /// Maximum overlap of two face detections before one is suppressed
    #[clap(long, default_value_t = 0.5)]
    max_iou: f32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let font = match load_font(&args.font) {
        Ok(font) => Some(font),
        Err(e) => {
            log::warn!("No overlay font, text fields are skipped: {e:#}");
            None
        }
    };
    let surface = Arc::new(OverlaySurface::new(Overlay::new(
        VIDEO_WIDTH,
        VIDEO_HEIGHT,
        font,
    )));

    // Models are loaded in the background, the page is usable right away
    let (detector_tx, detector_rx) = detector_channel();
    let loader = ModelLoader::new(
        &args.public_url,
        args.models_dir.unwrap_or_else(default_models_dir),
    );
    log::info!("Fetching models from {}", loader.models_url());
    let options = DetectorOptions {
        score_threshold: args.score_threshold,
        max_iou: args.max_iou,
    };
    spawn_model_loader(loader, options, detector_tx);

    let meter = Arc::new(Meter::new());
    spawn_meter_logger(Arc::clone(&meter));

    let controller = Arc::new(CaptureController::new(
        v4l_camera(CaptureConstraints::user_facing(&args.device)),
        detector_rx,
        surface,
        meter,
    ));

    let app = router(Arc::clone(&controller));

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Unable to listen for shutdown signal: {e}");
            }
            // Releases the camera and ends the open viewer streams
            controller.shutdown().await;
        })
        .await?;

    Ok(())
}
