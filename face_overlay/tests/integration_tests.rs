use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use axum::{extract::Path, http::StatusCode, routing::get, Router};
use common::{DetectorOptions, FaceBox, FaceDetection};
use face_overlay::{
    capture::OpenCamera,
    controller::CaptureController,
    detector::{detector_channel, DetectFuture, Detector, DetectorSender},
    endpoints::router,
    meter::Meter,
    models::{LoadedModels, ModelLoader, Net},
    nn::FacePipeline,
    overlay::{Overlay, OverlaySurface},
    poller::{spawn_poller, TickContext},
    frame_channel, SharedFrame, VIDEO_HEIGHT, VIDEO_WIDTH,
};
use futures::FutureExt;
use image::RgbImage;
use tokio::sync::Semaphore;
use webcam::sensors::CaptureFn;

/// Camera producing blank frames at roughly 200 fps.
fn synthetic_camera() -> OpenCamera {
    Arc::new(|| -> Result<CaptureFn, webcam::Error> {
        let capture_fn: CaptureFn = Box::new(|| {
            std::thread::sleep(Duration::from_millis(5));
            Some(RgbImage::new(VIDEO_WIDTH, VIDEO_HEIGHT))
        });
        Ok(capture_fn)
    })
}

fn face() -> common::Detection {
    common::Detection::new(FaceDetection {
        score: 0.9,
        bbox: FaceBox {
            x: 100.0,
            y: 80.0,
            width: 120.0,
            height: 150.0,
        },
    })
}

/// Detector reporting fixed detections, optionally after a delay.
struct FixedDetector {
    detections: Vec<common::Detection>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl FixedDetector {
    fn new(detections: Vec<common::Detection>, delay: Duration) -> Self {
        Self {
            detections,
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Detector for FixedDetector {
    fn detect(&self, _frame: SharedFrame) -> DetectFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let detections = self.detections.clone();
        let delay = self.delay;
        let running = Arc::clone(&self.running);
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(detections)
        }
        .boxed()
    }
}

/// Detector blocking until a permit is released.
struct GatedDetector {
    gate: Arc<Semaphore>,
}

impl Detector for GatedDetector {
    fn detect(&self, _frame: SharedFrame) -> DetectFuture {
        let gate = Arc::clone(&self.gate);
        async move {
            let _permit = gate.acquire().await?;
            Ok(vec![face()])
        }
        .boxed()
    }
}

fn surface() -> Arc<OverlaySurface> {
    Arc::new(OverlaySurface::new(Overlay::new(
        VIDEO_WIDTH,
        VIDEO_HEIGHT,
        None,
    )))
}

fn controller_with(open_camera: OpenCamera) -> (CaptureController, DetectorSender) {
    let (detector_tx, detector_rx) = detector_channel();
    let controller = CaptureController::new(
        open_camera,
        detector_rx,
        surface(),
        Arc::new(Meter::new()),
    );
    (controller, detector_tx)
}

async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let waiting = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(timeout, waiting).await.is_ok()
}

fn overlay_is_empty(surface: &OverlaySurface) -> bool {
    surface.snapshot().pixels().all(|pixel| pixel[3] == 0)
}

#[tokio::test]
async fn toggle_on_and_off_leaves_no_timer() -> anyhow::Result<()> {
    let (controller, _detector_tx) = controller_with(synthetic_camera());
    assert!(!controller.is_active());
    assert_eq!(controller.active_timers(), 0);

    assert!(controller.toggle().await?);
    assert!(controller.is_active());
    assert_eq!(controller.active_timers(), 1);

    let frames = controller.frames();
    assert!(wait_until(Duration::from_secs(2), || frames.borrow().is_some()).await);

    assert!(!controller.toggle().await?);
    assert!(!controller.is_active());
    assert_eq!(controller.active_timers(), 0);
    assert!(controller.frames().borrow().is_none());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn poller_ticks_every_interval() {
    let (frames_tx, frames_rx) = frame_channel();
    let (detector_tx, detector_rx) = detector_channel();
    let detector = FixedDetector::new(vec![], Duration::ZERO);
    let calls = Arc::clone(&detector.calls);
    detector_tx.send_replace(Some(Arc::new(detector)));
    frames_tx.send_replace(Some(Arc::new(RgbImage::new(VIDEO_WIDTH, VIDEO_HEIGHT))));

    let meter = Arc::new(Meter::new());
    let ctx = Arc::new(TickContext::new(
        frames_rx,
        detector_rx,
        surface(),
        Arc::clone(&meter),
    ));
    let session = ctx.begin_session();
    let timer = spawn_poller(Arc::clone(&ctx), session);

    // First tick fires immediately
    tokio::time::sleep(Duration::from_millis(1050)).await;
    timer.cancel().await;

    let ticks = meter.snapshot().ticks;
    assert!((10..=11).contains(&ticks), "{ticks} ticks");
    assert_eq!(calls.load(Ordering::SeqCst) as u64, ticks);
    assert_eq!(ctx.active_timers(), 0);
}

#[tokio::test]
async fn no_faces_keep_overlay_empty() -> anyhow::Result<()> {
    let (controller, detector_tx) = controller_with(synthetic_camera());
    detector_tx.send_replace(Some(Arc::new(FixedDetector::new(vec![], Duration::ZERO))));

    controller.start().await?;
    assert!(wait_until(Duration::from_secs(2), || controller.meter().detections >= 2).await);

    assert!(overlay_is_empty(controller.surface()));
    assert!(controller.surface().detections().is_empty());

    controller.stop().await;
    Ok(())
}

#[tokio::test]
async fn detections_are_drawn_and_cleared_on_stop() -> anyhow::Result<()> {
    let (controller, detector_tx) = controller_with(synthetic_camera());
    detector_tx.send_replace(Some(Arc::new(FixedDetector::new(
        vec![face()],
        Duration::ZERO,
    ))));
    let png = controller.surface().subscribe();

    controller.start().await?;
    assert!(wait_until(Duration::from_secs(2), || png.borrow().is_some()).await);
    assert_eq!(controller.surface().detections().len(), 1);
    assert!(!overlay_is_empty(controller.surface()));

    controller.stop().await;
    assert!(png.borrow().is_none());
    assert!(controller.surface().detections().is_empty());
    assert!(overlay_is_empty(controller.surface()));

    Ok(())
}

#[tokio::test]
async fn result_arriving_after_stop_is_discarded() -> anyhow::Result<()> {
    let (controller, detector_tx) = controller_with(synthetic_camera());
    let gate = Arc::new(Semaphore::new(0));
    detector_tx.send_replace(Some(Arc::new(GatedDetector {
        gate: Arc::clone(&gate),
    })));

    controller.start().await?;
    assert!(wait_until(Duration::from_secs(2), || controller.detection_in_flight()).await);

    controller.stop().await;
    gate.add_permits(1);
    assert!(wait_until(Duration::from_secs(2), || !controller.detection_in_flight()).await);

    assert!(controller.surface().detections().is_empty());
    assert!(overlay_is_empty(controller.surface()));
    assert_eq!(controller.meter().detections, 1);

    Ok(())
}

#[tokio::test]
async fn concurrent_toggles_keep_at_most_one_timer() -> anyhow::Result<()> {
    let (controller, _detector_tx) = controller_with(synthetic_camera());
    let controller = Arc::new(controller);

    let toggles = (0..9).map(|_| {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.toggle().await })
    });
    for toggled in futures::future::join_all(toggles).await {
        toggled??;
    }

    // Odd number of toggles ends active
    assert!(controller.is_active());
    assert_eq!(controller.active_timers(), 1);

    controller.stop().await;
    assert_eq!(controller.active_timers(), 0);

    Ok(())
}

#[tokio::test]
async fn no_detection_before_models_are_loaded() -> anyhow::Result<()> {
    let (controller, detector_tx) = controller_with(synthetic_camera());
    controller.start().await?;

    assert!(wait_until(Duration::from_secs(2), || controller.meter().skipped >= 3).await);
    assert!(!controller.models_ready());
    assert_eq!(controller.meter().detections, 0);

    let detector = FixedDetector::new(vec![], Duration::ZERO);
    let calls = Arc::clone(&detector.calls);
    detector_tx.send_replace(Some(Arc::new(detector)));
    assert!(controller.models_ready());
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) > 0).await);

    controller.stop().await;
    Ok(())
}

#[tokio::test]
async fn ticks_are_skipped_while_detection_runs() -> anyhow::Result<()> {
    let (controller, detector_tx) = controller_with(synthetic_camera());
    let detector = FixedDetector::new(vec![], Duration::from_millis(350));
    let calls = Arc::clone(&detector.calls);
    let max_running = Arc::clone(&detector.max_running);
    detector_tx.send_replace(Some(Arc::new(detector)));

    controller.start().await?;
    tokio::time::sleep(Duration::from_millis(900)).await;
    controller.stop().await;

    let calls = calls.load(Ordering::SeqCst);
    assert!((1..=3).contains(&calls), "{calls} detections");
    assert_eq!(max_running.load(Ordering::SeqCst), 1);
    assert!(controller.meter().skipped > 0);

    Ok(())
}

#[tokio::test]
async fn camera_failure_keeps_capture_inactive() {
    let (controller, _detector_tx) =
        controller_with(Arc::new(|| -> Result<CaptureFn, webcam::Error> {
            Err("no camera attached".into())
        }));

    let err = controller.toggle().await.unwrap_err();
    assert!(format!("{err:#}").contains("no camera attached"));
    assert!(!controller.is_active());
    assert_eq!(controller.active_timers(), 0);
}

/// Camera taking `delay` to capture every frame.
fn slow_camera(delay: Duration) -> OpenCamera {
    Arc::new(move || -> Result<CaptureFn, webcam::Error> {
        let capture_fn: CaptureFn = Box::new(move || {
            std::thread::sleep(delay);
            Some(RgbImage::new(VIDEO_WIDTH, VIDEO_HEIGHT))
        });
        Ok(capture_fn)
    })
}

#[tokio::test]
async fn cancelled_stop_still_empties_buffers() -> anyhow::Result<()> {
    let (controller, detector_tx) = controller_with(slow_camera(Duration::from_millis(300)));
    detector_tx.send_replace(Some(Arc::new(FixedDetector::new(
        vec![face()],
        Duration::ZERO,
    ))));
    let frames = controller.frames();
    let png = controller.surface().subscribe();

    controller.start().await?;
    assert!(wait_until(Duration::from_secs(3), || png.borrow().is_some()).await);

    // Releasing the camera takes longer than the caller waits
    tokio::time::timeout(Duration::from_millis(20), controller.stop())
        .await
        .ok();

    assert!(!controller.is_active());
    assert!(frames.borrow().is_none());
    assert!(png.borrow().is_none());
    assert!(controller.surface().detections().is_empty());
    assert!(overlay_is_empty(controller.surface()));

    // The capture still running does not publish its frame
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(frames.borrow().is_none());
    assert!(wait_until(Duration::from_secs(1), || controller.active_timers() == 0).await);

    Ok(())
}

/// Serve `app` on a free local port.
fn serve(app: Router) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let server = axum::Server::from_tcp(listener)?.serve(app.into_make_service());
    tokio::spawn(server);

    Ok(addr)
}

fn model_server() -> Router {
    Router::new().route(
        "/facial-rec-app/models/:name",
        get(|Path(name): Path<String>| async move {
            match Net::ALL.iter().any(|net| net.file_name() == name) {
                true => Ok(format!("weights of {name}")),
                false => Err(StatusCode::NOT_FOUND),
            }
        }),
    )
}

#[tokio::test]
async fn models_are_fetched_into_cache_dir() -> anyhow::Result<()> {
    let addr = serve(model_server())?;
    let models_dir = tempfile::tempdir()?;

    let loader = ModelLoader::new(
        &format!("http://{addr}/facial-rec-app"),
        models_dir.path(),
    );
    let loaded = loader.load_all().await;

    for net in Net::ALL {
        assert!(loaded.is_loaded(net), "{net} not loaded");
        let content = std::fs::read_to_string(models_dir.path().join(net.file_name()))?;
        assert_eq!(content, format!("weights of {}", net.file_name()));
    }

    Ok(())
}

#[tokio::test]
async fn cached_model_is_used_when_fetch_fails() -> anyhow::Result<()> {
    let models_dir = tempfile::tempdir()?;
    let cached = models_dir.path().join(Net::FaceDetector.file_name());
    std::fs::write(&cached, "cached weights")?;

    // Nothing serves the models
    let addr = serve(Router::new())?;
    let loader = ModelLoader::new(&format!("http://{addr}/facial-rec-app"), models_dir.path());

    assert_eq!(loader.load(Net::FaceDetector).await?, cached);
    assert!(loader.load(Net::AgeGender).await.is_err());
    assert_eq!(std::fs::read_to_string(&cached)?, "cached weights");

    Ok(())
}

#[tokio::test]
async fn viewer_endpoints() -> anyhow::Result<()> {
    let (controller, _detector_tx) = controller_with(synthetic_camera());
    let controller = Arc::new(controller);
    let addr = serve(router(Arc::clone(&controller)))?;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let base = format!("http://{addr}");

    let health = client.get(format!("{base}/healthcheck")).send().await?;
    assert_eq!(health.text().await?, "healthy");

    let page = client.get(format!("{base}/")).send().await?.text().await?;
    assert!(page.contains("Start Webcam"));

    let toggled = client.post(format!("{base}/toggle")).send().await?;
    assert_eq!(toggled.status(), reqwest::StatusCode::SEE_OTHER);
    assert!(controller.is_active());

    let page = client.get(format!("{base}/")).send().await?.text().await?;
    assert!(page.contains("Stop Webcam"));
    assert!(page.contains("overlay_stream"));

    let status = client.get(format!("{base}/status")).send().await?.text().await?;
    assert!(status.contains(r#""active":true"#), "{status}");
    assert!(status.contains(r#""active_timers":1"#), "{status}");

    let detections = client.get(format!("{base}/detections")).send().await?.text().await?;
    assert_eq!(detections, "[]");

    let video = client.get(format!("{base}/video_stream")).send().await?;
    assert_eq!(
        video.headers()[reqwest::header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );

    client.post(format!("{base}/toggle")).send().await?;
    assert!(!controller.is_active());
    assert_eq!(controller.active_timers(), 0);

    Ok(())
}

#[tokio::test]
async fn graceful_shutdown_ends_open_streams() -> anyhow::Result<()> {
    let (controller, _detector_tx) = controller_with(synthetic_camera());
    let controller = Arc::new(controller);
    controller.start().await?;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_controller = Arc::clone(&controller);
    let server = axum::Server::from_tcp(listener)?
        .serve(router(Arc::clone(&controller)).into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
            server_controller.shutdown().await;
        });
    let server = tokio::spawn(server);

    let mut video = reqwest::get(format!("http://{addr}/video_stream")).await?;
    let overlay = reqwest::get(format!("http://{addr}/overlay_stream")).await?;
    assert!(video.chunk().await?.is_some());

    shutdown_tx.send(()).ok();
    tokio::time::timeout(Duration::from_secs(3), server).await???;

    assert!(controller.is_shut_down());
    assert!(!controller.is_active());
    assert_eq!(controller.active_timers(), 0);
    assert!(controller.frames().borrow().is_none());
    assert!(controller.start().await.is_err());

    drop(overlay);
    Ok(())
}

/// Run the face pipeline with the models found in `FACE_OVERLAY_MODELS`.
#[test]
fn face_pipeline_on_blank_frame() -> anyhow::Result<()> {
    let Some(models_dir) = std::env::var_os("FACE_OVERLAY_MODELS").map(PathBuf::from) else {
        eprintln!("FACE_OVERLAY_MODELS not set, skipping");
        return Ok(());
    };

    let mut models = LoadedModels::default();
    for net in Net::ALL {
        let path = models_dir.join(net.file_name());
        if path.is_file() {
            models.set(net, path);
        }
    }
    if !models.is_loaded(Net::FaceDetector) {
        return Err(anyhow!("no face detector in {}", models_dir.display()));
    }

    let pipeline = FacePipeline::load(&models, DetectorOptions::default())?;
    let frame = RgbImage::from_pixel(VIDEO_WIDTH, VIDEO_HEIGHT, image::Rgb([128, 128, 128]));
    let detections = pipeline.run(&frame)?;

    for detection in detections {
        let bbox = detection.bbox();
        assert!(bbox.x >= 0.0 && bbox.y >= 0.0);
        assert!(bbox.right() <= VIDEO_WIDTH as f32);
        assert!(bbox.bottom() <= VIDEO_HEIGHT as f32);
    }

    Ok(())
}
