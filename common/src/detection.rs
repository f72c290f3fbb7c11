//! Detection results produced by the face pipeline.
//!
//! All coordinates are in pixels of the analysed frame, with the origin in the
//! top-left corner.
use std::fmt;

use serde::{Deserialize, Serialize};

/// A point in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box of a face.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a box from its top-left and bottom-right corners.
    pub fn from_corners(x_tl: f32, y_tl: f32, x_br: f32, y_br: f32) -> Self {
        Self::new(x_tl, y_tl, (x_br - x_tl).max(0.0), (y_br - y_tl).max(0.0))
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn bottom_left(&self) -> Point {
        Point::new(self.x, self.bottom())
    }

    pub fn bottom_right(&self) -> Point {
        Point::new(self.right(), self.bottom())
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersect with a `width` x `height` frame.
    ///
    /// Returns `None` if nothing of the box lies within the frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceBox> {
        let x_tl = self.x.max(0.0);
        let y_tl = self.y.max(0.0);
        let x_br = self.right().min(width as f32);
        let y_br = self.bottom().min(height as f32);
        if x_br - x_tl < 1.0 || y_br - y_tl < 1.0 {
            return None;
        }

        Some(FaceBox::from_corners(x_tl, y_tl, x_br, y_br))
    }
}

/// Output of the face detector for a single face.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct FaceDetection {
    pub score: f32,
    #[serde(rename = "box")]
    pub bbox: FaceBox,
}

/// Facial expressions known to the expression classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Expression {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl Expression {
    pub const ALL: [Expression; 7] = [
        Expression::Neutral,
        Expression::Happy,
        Expression::Sad,
        Expression::Angry,
        Expression::Fearful,
        Expression::Disgusted,
        Expression::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Expression::Neutral => "neutral",
            Expression::Happy => "happy",
            Expression::Sad => "sad",
            Expression::Angry => "angry",
            Expression::Fearful => "fearful",
            Expression::Disgusted => "disgusted",
            Expression::Surprised => "surprised",
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probability per expression, indexed in the order of [`Expression::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Expressions {
    pub neutral: f32,
    pub happy: f32,
    pub sad: f32,
    pub angry: f32,
    pub fearful: f32,
    pub disgusted: f32,
    pub surprised: f32,
}

impl Expressions {
    pub fn from_probabilities(probs: [f32; 7]) -> Self {
        Self {
            neutral: probs[0],
            happy: probs[1],
            sad: probs[2],
            angry: probs[3],
            fearful: probs[4],
            disgusted: probs[5],
            surprised: probs[6],
        }
    }

    pub fn get(&self, expression: Expression) -> f32 {
        match expression {
            Expression::Neutral => self.neutral,
            Expression::Happy => self.happy,
            Expression::Sad => self.sad,
            Expression::Angry => self.angry,
            Expression::Fearful => self.fearful,
            Expression::Disgusted => self.disgusted,
            Expression::Surprised => self.surprised,
        }
    }

    /// Expressions with their probabilities, most probable first.
    pub fn sorted(&self) -> Vec<(Expression, f32)> {
        let mut sorted: Vec<_> = Expression::ALL
            .iter()
            .map(|expression| (*expression, self.get(*expression)))
            .collect();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        sorted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => f.write_str("male"),
            Gender::Female => f.write_str("female"),
        }
    }
}

/// Age and gender estimate of a face.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AgeGender {
    /// Estimated age in years.
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
}

/// Everything known about a single face after one pass of the pipeline.
///
/// Only `detection` is always present. The other fields stay empty when the
/// corresponding network is not loaded.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Detection {
    pub detection: FaceDetection,
    #[serde(default)]
    pub landmarks: Vec<Point>,
    #[serde(default)]
    pub expressions: Option<Expressions>,
    #[serde(default)]
    pub age_gender: Option<AgeGender>,
}

impl Detection {
    pub fn new(detection: FaceDetection) -> Self {
        Self {
            detection,
            landmarks: Vec::new(),
            expressions: None,
            age_gender: None,
        }
    }

    pub fn bbox(&self) -> &FaceBox {
        &self.detection.bbox
    }
}

/// Tuning of the face detector.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DetectorOptions {
    /// Minimum detection score for a face to be reported.
    pub score_threshold: f32,
    /// Maximum overlap of two reported faces before the weaker one is dropped.
    pub max_iou: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            max_iou: 0.5,
        }
    }
}
