//! Camera access for the face overlay viewer.
pub mod sensors;

/// Error type.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Which way the requested camera should face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    /// Camera facing the user, e.g. a laptop webcam.
    User,
}

/// Constraints requested when opening the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Video device to use for the requested facing mode.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub facing_mode: FacingMode,
    pub audio: bool,
}

impl CaptureConstraints {
    /// Constraints for a user-facing 640x480 camera without audio.
    ///
    /// V4L2 does not report the direction a camera faces, so the user-facing
    /// camera is whichever device is configured here.
    pub fn user_facing(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            width: 640,
            height: 480,
            facing_mode: FacingMode::User,
            audio: false,
        }
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::user_facing("/dev/video0")
    }
}
