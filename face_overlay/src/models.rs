//! Fetching the networks of the face pipeline.
//!
//! The four networks are served as static files below `<public url>/models`.
//! They are downloaded one after the other into a local models directory and
//! handed to [`FacePipeline`](crate::nn::FacePipeline). Failures are logged
//! and leave the affected network unavailable.
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use common::DetectorOptions;
use reqwest::Client;
use tokio::task::JoinHandle;

use crate::{
    detector::DetectorSender,
    nn::{FacePipeline, OnnxDetector},
    utils::download_file,
};

/// Networks making up the face pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Net {
    FaceDetector,
    FaceLandmark68,
    FaceExpression,
    AgeGender,
}

impl Net {
    /// All networks, in loading order.
    pub const ALL: [Net; 4] = [
        Net::FaceDetector,
        Net::FaceLandmark68,
        Net::FaceExpression,
        Net::AgeGender,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Net::FaceDetector => "face_detector.onnx",
            Net::FaceLandmark68 => "face_landmark_68.onnx",
            Net::FaceExpression => "face_expression.onnx",
            Net::AgeGender => "age_gender.onnx",
        }
    }

    fn index(&self) -> usize {
        match self {
            Net::FaceDetector => 0,
            Net::FaceLandmark68 => 1,
            Net::FaceExpression => 2,
            Net::AgeGender => 3,
        }
    }
}

impl fmt::Display for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Net::FaceDetector => "face detector",
            Net::FaceLandmark68 => "68-point landmark",
            Net::FaceExpression => "expression",
            Net::AgeGender => "age/gender",
        };
        f.write_str(name)
    }
}

/// Local model files, `None` for networks that could not be fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedModels {
    paths: [Option<PathBuf>; 4],
}

impl LoadedModels {
    pub fn path(&self, net: Net) -> Option<&Path> {
        self.paths[net.index()].as_deref()
    }

    pub fn set(&mut self, net: Net, path: PathBuf) {
        self.paths[net.index()] = Some(path);
    }

    pub fn is_loaded(&self, net: Net) -> bool {
        self.paths[net.index()].is_some()
    }
}

/// URL below which the model files are served.
pub fn models_url(public_url: &str) -> String {
    format!("{}/models", public_url.trim_end_matches('/'))
}

pub struct ModelLoader {
    client: Client,
    models_url: String,
    models_dir: PathBuf,
}

impl ModelLoader {
    pub fn new(public_url: &str, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::new(),
            models_url: models_url(public_url),
            models_dir: models_dir.into(),
        }
    }

    pub fn models_url(&self) -> &str {
        &self.models_url
    }

    /// Fetch all networks sequentially.
    pub async fn load_all(&self) -> LoadedModels {
        if let Err(e) = tokio::fs::create_dir_all(&self.models_dir).await {
            log::error!(
                "Unable to create models directory {}: {e}",
                self.models_dir.display()
            );
        }

        let mut loaded = LoadedModels::default();
        for net in Net::ALL {
            match self.load(net).await {
                Ok(path) => loaded.set(net, path),
                Err(e) => log::error!("Failed to load {net} model: {e:#}"),
            }
        }

        loaded
    }

    /// Fetch a single network, falling back to a cached copy.
    pub async fn load(&self, net: Net) -> Result<PathBuf> {
        let url = format!("{}/{}", self.models_url, net.file_name());
        let filepath = self.models_dir.join(net.file_name());

        log::info!("Loading {net} model from {url}");
        match download_file(&self.client, &url, &filepath).await {
            Ok(()) => Ok(filepath),
            Err(e) if filepath.is_file() => {
                log::warn!(
                    "Failed to fetch {url} ({e:#}), using cached {}",
                    filepath.display()
                );
                Ok(filepath)
            }
            Err(e) => Err(e).with_context(|| format!("failed to fetch {url}")),
        }
    }
}

/// Load the models in the background and publish the detector once ready.
///
/// The detector slot stays empty if the face detector itself is unavailable.
pub fn spawn_model_loader(
    loader: ModelLoader,
    options: DetectorOptions,
    detector_tx: DetectorSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let models = loader.load_all().await;

        let pipeline =
            tokio::task::spawn_blocking(move || FacePipeline::load(&models, options)).await;
        match pipeline {
            Ok(Ok(pipeline)) => {
                log::info!("Face detection models loaded");
                detector_tx.send_replace(Some(Arc::new(OnnxDetector::new(pipeline))));
            }
            Ok(Err(e)) => log::error!("Face detection unavailable: {e:#}"),
            Err(e) => log::error!("Model loading task failed: {e}"),
        }
    })
}
