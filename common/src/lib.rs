//! Common code shared between `face_overlay` and its consumers.
pub mod detection;
pub mod utils;

pub use detection::{
    AgeGender, Detection, DetectorOptions, Expression, Expressions, FaceBox, FaceDetection,
    Gender, Point,
};
