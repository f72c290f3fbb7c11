//! Overlay drawn on top of the video.
//!
//! The overlay is a transparent RGBA canvas of the video size. Every completed
//! detection clears it and draws, per face, the bounding box, the landmarks,
//! the expressions and an age/gender text field.
use std::{
    io::Cursor,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use bytes::Bytes;
use common::{utils::round, AgeGender, Detection, Expressions, FaceBox, Point};
use image::{codecs::png::PngEncoder, ColorType, ImageEncoder, Rgba, RgbaImage};
use imageproc::{
    drawing::{
        draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut,
        draw_line_segment_mut, draw_text_mut, text_size,
    },
    rect::Rect,
};
use rusttype::{Font, Scale};
use tokio::sync::watch;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);
const BOX_COLOR: Rgba<u8> = Rgba([0, 0, 255, 255]);
const LINE_COLOR: Rgba<u8> = Rgba([0, 255, 255, 255]);
const POINT_COLOR: Rgba<u8> = Rgba([255, 0, 255, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const TEXT_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 128]);

const BOX_LINE_WIDTH: i32 = 2;
const POINT_RADIUS: i32 = 1;
const FONT_SIZE: f32 = 14.0;
const PADDING: i32 = 4;

/// Expressions below this probability are not labelled.
const MIN_EXPRESSION_CONFIDENCE: f32 = 0.1;

/// Contours of the 68-point landmark layout as `(first, last, closed)`.
const LANDMARK_CONTOURS: [(usize, usize, bool); 8] = [
    // jaw
    (0, 16, false),
    // eyebrows
    (17, 21, false),
    (22, 26, false),
    // nose
    (27, 35, false),
    // eyes
    (36, 41, true),
    (42, 47, true),
    // mouth
    (48, 59, true),
    (60, 67, true),
];

/// Where a text field is attached to its anchor point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnchorPosition {
    /// The anchor is the top-left corner of the field.
    TopLeft,
    /// The anchor is the bottom-left corner of the field.
    BottomLeft,
}

pub struct Overlay {
    canvas: RgbaImage,
    font: Option<Font<'static>>,
}

impl Overlay {
    /// Create a transparent overlay.
    ///
    /// Without a font, text fields are skipped.
    pub fn new(width: u32, height: u32, font: Option<Font<'static>>) -> Self {
        Self {
            canvas: RgbaImage::from_pixel(width, height, TRANSPARENT),
            font,
        }
    }

    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    pub fn clear(&mut self) {
        for pixel in self.canvas.pixels_mut() {
            *pixel = TRANSPARENT;
        }
    }

    /// Replace the content of the overlay with the given detections.
    pub fn render(&mut self, detections: &[Detection]) {
        self.clear();

        for detection in detections {
            let bbox = detection.bbox();
            self.draw_box(bbox, detection.detection.score);
            self.draw_landmarks(&detection.landmarks);
            if let Some(expressions) = &detection.expressions {
                let lines = expression_lines(expressions);
                self.draw_text_field(&lines, bbox.bottom_left(), AnchorPosition::TopLeft);
            }
            if let Some(age_gender) = &detection.age_gender {
                let lines = age_gender_lines(age_gender);
                self.draw_text_field(&lines, bbox.bottom_right(), AnchorPosition::TopLeft);
            }
        }
    }

    /// Encode the overlay as PNG, keeping its transparency.
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        PngEncoder::new(&mut buf).write_image(
            self.canvas.as_raw(),
            self.canvas.width(),
            self.canvas.height(),
            ColorType::Rgba8,
        )?;

        Ok(buf.into_inner())
    }

    fn draw_box(&mut self, bbox: &FaceBox, score: f32) {
        for inset in 0..BOX_LINE_WIDTH {
            let width = bbox.width as i32 - 2 * inset;
            let height = bbox.height as i32 - 2 * inset;
            if width <= 0 || height <= 0 {
                break;
            }

            let rect = Rect::at(bbox.x as i32 + inset, bbox.y as i32 + inset)
                .of_size(width as u32, height as u32);
            draw_hollow_rect_mut(&mut self.canvas, rect, BOX_COLOR);
        }

        let label = [score_label(score)];
        self.draw_text_field(&label, bbox.top_left(), AnchorPosition::BottomLeft);
    }

    fn draw_landmarks(&mut self, landmarks: &[Point]) {
        if landmarks.len() == 68 {
            for (first, last, closed) in LANDMARK_CONTOURS {
                let contour = &landmarks[first..=last];
                for pair in contour.windows(2) {
                    self.draw_line(&pair[0], &pair[1]);
                }
                if closed {
                    self.draw_line(&contour[contour.len() - 1], &contour[0]);
                }
            }
        }

        for point in landmarks {
            draw_filled_circle_mut(
                &mut self.canvas,
                (point.x as i32, point.y as i32),
                POINT_RADIUS,
                POINT_COLOR,
            );
        }
    }

    fn draw_line(&mut self, from: &Point, to: &Point) {
        draw_line_segment_mut(&mut self.canvas, (from.x, from.y), (to.x, to.y), LINE_COLOR);
    }

    fn draw_text_field(&mut self, lines: &[String], anchor: Point, position: AnchorPosition) {
        let Some(font) = &self.font else {
            return;
        };
        if lines.is_empty() {
            return;
        }

        let scale = Scale::uniform(FONT_SIZE);
        let line_height = FONT_SIZE as i32;
        let text_width = lines
            .iter()
            .map(|line| text_size(scale, font, line).0)
            .max()
            .unwrap_or(0);
        let width = text_width + 2 * PADDING;
        let height = lines.len() as i32 * line_height + 2 * PADDING;

        let x = anchor.x as i32;
        let y = match position {
            AnchorPosition::TopLeft => anchor.y as i32,
            AnchorPosition::BottomLeft => anchor.y as i32 - height,
        };
        // Keep the field within the canvas
        let x = x.min(self.canvas.width() as i32 - width).max(0);
        let y = y.min(self.canvas.height() as i32 - height).max(0);

        draw_filled_rect_mut(
            &mut self.canvas,
            Rect::at(x, y).of_size(width as u32, height as u32),
            TEXT_BACKGROUND,
        );
        for (idx, line) in lines.iter().enumerate() {
            draw_text_mut(
                &mut self.canvas,
                TEXT_COLOR,
                x + PADDING,
                y + PADDING + idx as i32 * line_height,
                scale,
                font,
                line,
            );
        }
    }
}

/// Label of the detection score.
pub fn score_label(score: f32) -> String {
    format!("{}", round(score as f64, 2))
}

/// Lines of the expression text field, most probable first.
pub fn expression_lines(expressions: &Expressions) -> Vec<String> {
    expressions
        .sorted()
        .into_iter()
        .filter(|(_, probability)| *probability >= MIN_EXPRESSION_CONFIDENCE)
        .map(|(expression, probability)| {
            format!("{} ({})", expression, round(probability as f64, 2))
        })
        .collect()
}

/// Lines of the age/gender text field.
pub fn age_gender_lines(age_gender: &AgeGender) -> Vec<String> {
    vec![
        format!("{} years", round(age_gender.age as f64, 0)),
        format!(
            "{} ({})",
            age_gender.gender,
            round(age_gender.gender_probability as f64, 2)
        ),
    ]
}

/// Load a TrueType font from disk.
pub fn load_font(path: impl AsRef<Path>) -> Result<Font<'static>> {
    let path = path.as_ref();
    let font_data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Font::try_from_vec(font_data).with_context(|| format!("invalid font {}", path.display()))
}

/// The overlay shared between the poller, the controller and its viewers.
///
/// Every change is published as PNG to the overlay stream, together with the
/// detections it shows.
pub struct OverlaySurface {
    overlay: Mutex<Overlay>,
    png_tx: watch::Sender<Option<Bytes>>,
    detections_tx: watch::Sender<Arc<Vec<Detection>>>,
}

impl OverlaySurface {
    pub fn new(overlay: Overlay) -> Self {
        let (png_tx, _) = watch::channel(None);
        let (detections_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            overlay: Mutex::new(overlay),
            png_tx,
            detections_tx,
        }
    }

    /// Draw `detections` if `is_current` still holds once the canvas is locked.
    ///
    /// Returns whether the detections were drawn.
    pub fn draw_when(&self, is_current: impl FnOnce() -> bool, detections: Vec<Detection>) -> bool {
        let mut overlay = self.lock();
        if !is_current() {
            return false;
        }

        overlay.render(&detections);
        match overlay.encode_png() {
            Ok(png) => {
                self.png_tx.send_replace(Some(Bytes::from(png)));
            }
            Err(e) => log::warn!("Failed to encode overlay: {e:#}"),
        }
        self.detections_tx.send_replace(Arc::new(detections));

        true
    }

    /// Clear the overlay and withdraw it from viewers.
    pub fn clear(&self) {
        let mut overlay = self.lock();
        overlay.clear();
        self.png_tx.send_replace(None);
        self.detections_tx.send_replace(Arc::new(Vec::new()));
    }

    /// Copy of the current canvas.
    pub fn snapshot(&self) -> RgbaImage {
        self.lock().canvas().clone()
    }

    /// Detections currently shown.
    pub fn detections(&self) -> Arc<Vec<Detection>> {
        self.detections_tx.borrow().clone()
    }

    /// Subscribe to the PNG-encoded overlay, `None` while nothing is shown.
    pub fn subscribe(&self) -> watch::Receiver<Option<Bytes>> {
        self.png_tx.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Overlay> {
        self.overlay.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
