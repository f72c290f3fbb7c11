//! Face pipeline running pretrained ONNX networks.
//!
//! The face detector finds faces in the whole frame. Each face is then cropped
//! and passed through the optional extension networks:
//! - landmarks: `1x3x112x112` RGB scaled to `[0, 1]`, 136 outputs with the 68
//!   points as normalized `(x, y)` pairs within the crop.
//! - expressions: `1x1x64x64` grayscale in `[0, 255]`, 8 logits in FER+ order
//!   (neutral, happiness, surprise, sadness, anger, disgust, fear, contempt).
//! - age/gender: `1x3x96x96` RGB scaled to `[0, 1]`, age in years as first
//!   output and two gender logits (male, female) as second output.
use std::{path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use common::{
    AgeGender, Detection, DetectorOptions, Expressions, FaceBox, FaceDetection, Gender, Point,
};
use image::{imageops, RgbImage};
use ndarray::s;
use tract_onnx::prelude::*;

use crate::{
    detector::{DetectFuture, Detector},
    models::{LoadedModels, Net},
    SharedFrame,
};

type NnModel = TypedRunnableModel<TypedModel>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Input size of the face detector (Ultraface RFB-320).
const DETECTOR_WIDTH: u32 = 320;
const DETECTOR_HEIGHT: u32 = 240;

const LANDMARK_INPUT: u32 = 112;
const EXPRESSION_INPUT: u32 = 64;
const AGE_GENDER_INPUT: u32 = 96;

const NUM_LANDMARKS: usize = 68;

pub struct FacePipeline {
    face_detector: NnModel,
    landmarks: Option<NnModel>,
    expressions: Option<NnModel>,
    age_gender: Option<NnModel>,
    options: DetectorOptions,
}

impl FacePipeline {
    /// Build the pipeline from downloaded model files.
    ///
    /// Only the face detector is required. Extension networks that are missing
    /// or fail to load are skipped.
    pub fn load(models: &LoadedModels, options: DetectorOptions) -> Result<Self> {
        let detector_path = models
            .path(Net::FaceDetector)
            .context("face detector model not available")?;
        let face_detector = load_model(detector_path, DETECTOR_HEIGHT, DETECTOR_WIDTH, 3)
            .context("failed to load face detector")?;

        Ok(Self {
            face_detector,
            landmarks: load_optional(models, Net::FaceLandmark68, LANDMARK_INPUT, 3),
            expressions: load_optional(models, Net::FaceExpression, EXPRESSION_INPUT, 1),
            age_gender: load_optional(models, Net::AgeGender, AGE_GENDER_INPUT, 3),
            options,
        })
    }

    /// Run all available networks on a frame.
    pub fn run(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let faces = self.detect_faces(frame)?;
        let (width, height) = frame.dimensions();

        let mut detections = Vec::with_capacity(faces.len());
        for face in faces {
            let mut detection = Detection::new(face);
            if let Some(crop_box) = face.bbox.clamp_to(width, height) {
                let crop = crop_face(frame, &crop_box);
                self.extend(&mut detection, &crop, &crop_box);
            }
            detections.push(detection);
        }

        Ok(detections)
    }

    fn detect_faces(&self, frame: &RgbImage) -> Result<Vec<FaceDetection>> {
        let input = detector_input(frame);
        let raw_nn_out = self.face_detector.run(tvec!(input.into()))?;
        if raw_nn_out.len() < 2 {
            bail!("face detector returned {} outputs", raw_nn_out.len());
        }

        // Scores are (background, face) pairs per anchor
        let confidences = raw_nn_out[0]
            .to_array_view::<f32>()?
            .slice(s![0, .., 1])
            .to_vec();

        // Boxes are normalized (x_tl, y_tl, x_br, y_br) per anchor
        let bboxes: Vec<f32> = raw_nn_out[1].to_array_view::<f32>()?.iter().cloned().collect();
        let bboxes = bboxes
            .chunks_exact(4)
            .map(|x| [x[0], x[1], x[2], x[3]]);

        let candidates: Vec<_> = confidences
            .into_iter()
            .zip(bboxes)
            .filter(|(confidence, _)| *confidence > self.options.score_threshold)
            .collect();

        let selected = non_maximum_suppression(candidates, self.options.max_iou);
        Ok(faces_in_frame(selected, frame.dimensions()))
    }

    /// Fill in the results of the extension networks for one face.
    fn extend(&self, detection: &mut Detection, crop: &RgbImage, crop_box: &FaceBox) {
        if let Some(model) = &self.landmarks {
            match run_landmarks(model, crop, crop_box) {
                Ok(landmarks) => detection.landmarks = landmarks,
                Err(e) => log::warn!("Landmark prediction failed: {e:#}"),
            }
        }

        if let Some(model) = &self.expressions {
            match run_expressions(model, crop) {
                Ok(expressions) => detection.expressions = Some(expressions),
                Err(e) => log::warn!("Expression classification failed: {e:#}"),
            }
        }

        if let Some(model) = &self.age_gender {
            match run_age_gender(model, crop) {
                Ok(age_gender) => detection.age_gender = Some(age_gender),
                Err(e) => log::warn!("Age/gender prediction failed: {e:#}"),
            }
        }
    }
}

/// [`Detector`] running a [`FacePipeline`] on the blocking thread pool.
pub struct OnnxDetector {
    pipeline: Arc<FacePipeline>,
}

impl OnnxDetector {
    pub fn new(pipeline: FacePipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

impl Detector for OnnxDetector {
    fn detect(&self, frame: SharedFrame) -> DetectFuture {
        let pipeline = Arc::clone(&self.pipeline);
        Box::pin(async move { tokio::task::spawn_blocking(move || pipeline.run(&frame)).await? })
    }
}

/// Scale normalized boxes to the frame and clip them to its bounds.
///
/// Boxes lying completely outside of the frame are dropped.
fn faces_in_frame(
    selected: Vec<(f32, [f32; 4])>,
    (width, height): (u32, u32),
) -> Vec<FaceDetection> {
    let (w, h) = (width as f32, height as f32);
    selected
        .into_iter()
        .filter_map(|(score, bbox)| {
            FaceBox::from_corners(bbox[0] * w, bbox[1] * h, bbox[2] * w, bbox[3] * h)
                .clamp_to(width, height)
                .map(|bbox| FaceDetection { score, bbox })
        })
        .collect()
}

fn load_model(path: &Path, height: u32, width: u32, channels: usize) -> Result<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, channels, height as usize, width as usize),
    );
    let model = tract_onnx::onnx()
        .model_for_path(path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

fn load_optional(models: &LoadedModels, net: Net, size: u32, channels: usize) -> Option<NnModel> {
    let path = models.path(net)?;
    match load_model(path, size, size, channels) {
        Ok(model) => {
            log::info!("Loaded {net} model from {}", path.display());
            Some(model)
        }
        Err(e) => {
            log::error!("Failed to initialize {net} model: {e:#}");
            None
        }
    }
}

fn detector_input(frame: &RgbImage) -> Tensor {
    let resized: RgbImage = imageops::resize(
        frame,
        DETECTOR_WIDTH,
        DETECTOR_HEIGHT,
        imageops::FilterType::Triangle,
    );

    tract_ndarray::Array4::from_shape_fn(
        (1, 3, DETECTOR_HEIGHT as usize, DETECTOR_WIDTH as usize),
        |(_, c, y, x)| {
            // Note: Mean/std are from MobileNet, not from Ultraface, but work well
            let mean = [0.485, 0.456, 0.406][c];
            let std = [0.229, 0.224, 0.225][c];
            (resized[(x as _, y as _)][c] as f32 / 255.0 - mean) / std
        },
    )
    .into()
}

/// Square RGB input with values in `[0, 1]`.
fn rgb_input(crop: &RgbImage, size: u32) -> Tensor {
    let resized = imageops::resize(crop, size, size, imageops::FilterType::Triangle);
    tract_ndarray::Array4::from_shape_fn(
        (1, 3, size as usize, size as usize),
        |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
    )
    .into()
}

/// Square grayscale input with values in `[0, 255]`.
fn gray_input(crop: &RgbImage, size: u32) -> Tensor {
    let gray = imageops::grayscale(crop);
    let resized = imageops::resize(&gray, size, size, imageops::FilterType::Triangle);
    tract_ndarray::Array4::from_shape_fn((1, 1, size as usize, size as usize), |(_, _, y, x)| {
        resized[(x as _, y as _)][0] as f32
    })
    .into()
}

fn crop_face(frame: &RgbImage, crop_box: &FaceBox) -> RgbImage {
    imageops::crop_imm(
        frame,
        crop_box.x as u32,
        crop_box.y as u32,
        (crop_box.width as u32).max(1),
        (crop_box.height as u32).max(1),
    )
    .to_image()
}

fn run_landmarks(model: &NnModel, crop: &RgbImage, crop_box: &FaceBox) -> Result<Vec<Point>> {
    let raw_nn_out = model.run(tvec!(rgb_input(crop, LANDMARK_INPUT).into()))?;
    let coords: Vec<f32> = raw_nn_out
        .first()
        .context("landmark network returned no output")?
        .to_array_view::<f32>()?
        .iter()
        .cloned()
        .collect();

    landmarks_from_coords(&coords, crop_box)
}

fn run_expressions(model: &NnModel, crop: &RgbImage) -> Result<Expressions> {
    let raw_nn_out = model.run(tvec!(gray_input(crop, EXPRESSION_INPUT).into()))?;
    let logits: Vec<f32> = raw_nn_out
        .first()
        .context("expression network returned no output")?
        .to_array_view::<f32>()?
        .iter()
        .cloned()
        .collect();

    expressions_from_ferplus(&logits)
}

fn run_age_gender(model: &NnModel, crop: &RgbImage) -> Result<AgeGender> {
    let raw_nn_out = model.run(tvec!(rgb_input(crop, AGE_GENDER_INPUT).into()))?;
    if raw_nn_out.len() < 2 {
        bail!("age/gender network returned {} outputs", raw_nn_out.len());
    }

    let age = raw_nn_out[0]
        .to_array_view::<f32>()?
        .iter()
        .next()
        .copied()
        .context("empty age output")?;
    let gender_logits: Vec<f32> = raw_nn_out[1].to_array_view::<f32>()?.iter().cloned().collect();

    age_gender_from_outputs(age, &gender_logits)
}

/// Map normalized crop coordinates to frame coordinates.
fn landmarks_from_coords(coords: &[f32], crop_box: &FaceBox) -> Result<Vec<Point>> {
    if coords.len() != 2 * NUM_LANDMARKS {
        bail!(
            "expected {} landmark coordinates, got {}",
            2 * NUM_LANDMARKS,
            coords.len()
        );
    }

    Ok(coords
        .chunks_exact(2)
        .map(|p| {
            Point::new(
                crop_box.x + p[0] * crop_box.width,
                crop_box.y + p[1] * crop_box.height,
            )
        })
        .collect())
}

/// Convert FER+ logits into the seven expressions, dropping contempt.
fn expressions_from_ferplus(logits: &[f32]) -> Result<Expressions> {
    if logits.len() != 8 {
        bail!("expected 8 expression logits, got {}", logits.len());
    }

    let probs = softmax(logits);
    // neutral, happy, sad, angry, fearful, disgusted, surprised
    let mut selected = [
        probs[0], probs[1], probs[3], probs[4], probs[6], probs[5], probs[2],
    ];
    let total: f32 = selected.iter().sum();
    for prob in selected.iter_mut() {
        *prob /= total + EPS;
    }

    Ok(Expressions::from_probabilities(selected))
}

fn age_gender_from_outputs(age: f32, gender_logits: &[f32]) -> Result<AgeGender> {
    if gender_logits.len() != 2 {
        bail!("expected 2 gender logits, got {}", gender_logits.len());
    }

    let probs = softmax(gender_logits);
    let (gender, gender_probability) = match probs[0] >= probs[1] {
        true => (Gender::Male, probs[0]),
        false => (Gender::Female, probs[1]),
    };

    Ok(AgeGender {
        age: age.max(0.0),
        gender,
        gender_probability,
    })
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|x| x / (sum + EPS)).collect()
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Candidates are visited in the order of sinking confidence. A candidate is
/// kept only if its IoU with every already kept box is at most `max_iou`.
fn non_maximum_suppression(
    mut candidates: Vec<(f32, [f32; 4])>,
    max_iou: f32,
) -> Vec<(f32, [f32; 4])> {
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut selected: Vec<(f32, [f32; 4])> = vec![];
    'candidates: for (confidence, bbox) in candidates {
        for (_, selected_bbox) in selected.iter() {
            if iou(&bbox, selected_bbox) > max_iou {
                continue 'candidates;
            }
        }

        selected.push((confidence, bbox));
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the corner points of the overlap box are
    // swapped and its area is zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as `[x_top_left, y_top_left, x_bottom_right,
/// y_bottom_right]`. Ill-defined boxes have zero area.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
