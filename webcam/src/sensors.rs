//! Sensors module.
//!
use image::RgbImage;
use rscam::{Camera, Config, IntervalInfo, ResolutionInfo};
use simple_error::simple_error;

use crate::{CaptureConstraints, Error};

/// Pixel format requested from the camera.
const FORMAT: &[u8] = b"MJPG";

/// Capture function of an opened camera.
///
/// Returns the next decoded frame, or `None` if capturing or decoding failed.
/// The camera is released when the function is dropped.
pub type CaptureFn = Box<dyn Fn() -> Option<RgbImage> + Send + Sync>;

/// Open a video device on a Linux machine according to the given constraints.
///
/// The camera is started with MJPG at the supported resolution closest to the
/// requested one and at the highest frame rate available for it. Frames are
/// always delivered at the requested size.
pub fn open_camera(constraints: &CaptureConstraints) -> Result<CaptureFn, Error> {
    if constraints.audio {
        log::warn!("Audio capture is not supported, ignoring");
    }

    let mut cam = Camera::new(&constraints.device)?;
    log_supported_formats(&cam);

    let target = (constraints.width, constraints.height);
    let resolution = get_closest_resolution(&cam, target)?;
    let frame_rate = get_max_frame_rate(&cam, resolution)?;

    log::info!(
        "Using camera {} ({:?}) at {}x{}, interval {}/{}s",
        &constraints.device,
        constraints.facing_mode,
        resolution.0,
        resolution.1,
        frame_rate.0,
        frame_rate.1
    );

    cam.start(&Config {
        interval: frame_rate,
        resolution,
        format: FORMAT,
        ..Default::default()
    })?;

    let callback = move || {
        let frame = match cam.capture() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Error capturing frame: {e}");
                return None;
            }
        };

        match decode_frame(&frame[..], target) {
            Ok(image) => Some(image),
            Err(e) => {
                log::warn!("Error decoding frame: {e}");
                None
            }
        }
    };
    Ok(Box::new(callback))
}

/// Decode an MJPG frame and bring it to the requested size.
pub fn decode_frame(jpeg: &[u8], (width, height): (u32, u32)) -> Result<RgbImage, Error> {
    let image: RgbImage = turbojpeg::decompress_image(jpeg)?;
    if image.dimensions() == (width, height) {
        return Ok(image);
    }

    Ok(image::imageops::resize(
        &image,
        width,
        height,
        image::imageops::FilterType::Triangle,
    ))
}

/// Get the supported resolution closest to `target` for MJPG.
fn get_closest_resolution(cam: &Camera, target: (u32, u32)) -> Result<(u32, u32), Error> {
    let resolution_info = cam.resolutions(FORMAT)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        ResolutionInfo::Discretes(resolutions) => closest_resolution(&resolutions, target),
        ResolutionInfo::Stepwise { min, max, step } => {
            Some(stepwise_resolution(min, max, step, target))
        }
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the maximum supported frame rate for MJPG at the given resolution.
fn get_max_frame_rate(cam: &Camera, resolution: (u32, u32)) -> Result<(u32, u32), Error> {
    let interval_info = cam.intervals(FORMAT, resolution)?;
    log::debug!("Found frame intervals: {:?}", &interval_info);
    match interval_info {
        IntervalInfo::Discretes(intervals) => shortest_interval(&intervals),
        // The shortest interval yields the highest frame rate
        IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

/// Pick the resolution whose pixel count is closest to the one of `target`.
///
/// An exact match always wins.
fn closest_resolution(resolutions: &[(u32, u32)], target: (u32, u32)) -> Option<(u32, u32)> {
    if resolutions.contains(&target) {
        return Some(target);
    }

    let target_pixels = (target.0 * target.1) as i64;
    resolutions
        .iter()
        .min_by_key(|res| ((res.0 * res.1) as i64 - target_pixels).abs())
        .copied()
}

/// Fit `target` into a stepwise resolution range.
fn stepwise_resolution(
    min: (u32, u32),
    max: (u32, u32),
    step: (u32, u32),
    target: (u32, u32),
) -> (u32, u32) {
    let fit = |min: u32, max: u32, step: u32, target: u32| {
        let clamped = target.clamp(min, max);
        match step {
            0 => clamped,
            step => min + (clamped - min) / step * step,
        }
    };

    (
        fit(min.0, max.0, step.0, target.0),
        fit(min.1, max.1, step.1, target.1),
    )
}

/// Pick the shortest frame interval, given as `(numerator, denominator)` seconds.
fn shortest_interval(intervals: &[(u32, u32)]) -> Option<(u32, u32)> {
    intervals
        .iter()
        .filter(|(numerator, denominator)| *numerator > 0 && *denominator > 0)
        .min_by(|a, b| {
            let a = a.0 as f64 / a.1 as f64;
            let b = b.0 as f64 / b.1 as f64;
            a.total_cmp(&b)
        })
        .copied()
}

fn log_supported_formats(cam: &Camera) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        String::from_utf8_lossy(FORMAT)
    );
}
