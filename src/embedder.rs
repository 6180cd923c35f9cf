//! The face-embedding capability the HTTP handler delegates to.
//!
//! The handler only knows [`FaceEmbedder`]; [`OrtEmbedder`] is the
//! production implementation backed by the RetinaFace + ArcFace pipeline.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use facembed_vision::{Face, Pipeline};
use image::DynamicImage;
use serde::Serialize;

use crate::config::Config;

/// Recognition model producing the vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionModel {
    ArcFace,
}

/// Detector used to locate faces before embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorBackend {
    RetinaFace,
}

impl fmt::Display for RecognitionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionModel::ArcFace => f.write_str("ArcFace"),
        }
    }
}

impl FromStr for RecognitionModel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "arcface" => Ok(RecognitionModel::ArcFace),
            _ => Err(anyhow!("unknown recognition model: {s}")),
        }
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorBackend::RetinaFace => f.write_str("retinaface"),
        }
    }
}

impl FromStr for DetectorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "retinaface" => Ok(DetectorBackend::RetinaFace),
            _ => Err(anyhow!("unknown detector backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepresentOptions {
    pub model: RecognitionModel,
    pub detector: DetectorBackend,
    /// When false, an image without faces yields an empty result instead of
    /// an error.
    pub enforce_detection: bool,
}

/// Face region in source image pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacialArea {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub left_eye: (f32, f32),
    pub right_eye: (f32, f32),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceRepresentation {
    pub embedding: Option<Vec<f32>>,
    pub facial_area: FacialArea,
    pub face_confidence: f32,
}

impl From<Face> for FaceRepresentation {
    fn from(face: Face) -> Self {
        let d = &face.detection;
        let facial_area = FacialArea {
            x: d.bbox[0],
            y: d.bbox[1],
            w: d.bbox[2],
            h: d.bbox[3],
            left_eye: d.left_eye(),
            right_eye: d.right_eye(),
        };
        Self {
            face_confidence: d.score.clamp(0.0, 1.0),
            facial_area,
            embedding: (!face.embedding.is_empty()).then_some(face.embedding),
        }
    }
}

pub trait FaceEmbedder: Send + Sync {
    /// One record per detected face, in the order the detector reports them.
    fn represent(
        &self,
        image: &DynamicImage,
        options: &RepresentOptions,
    ) -> Result<Vec<FaceRepresentation>>;
}

/// ONNX Runtime backed embedder.
///
/// Sessions run through `&mut`, so concurrent requests take turns on the
/// pipeline.
pub struct OrtEmbedder {
    pipeline: Mutex<Pipeline>,
    model: RecognitionModel,
    detector: DetectorBackend,
}

impl OrtEmbedder {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Mutex::new(pipeline),
            model: RecognitionModel::ArcFace,
            detector: DetectorBackend::RetinaFace,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        log::info!(
            "Loading models: detector {} recognizer {}",
            cfg.detector_model.display(),
            cfg.recognition_model.display()
        );
        let pipeline = Pipeline::new(&cfg.detector_model, &cfg.recognition_model, cfg.thresholds())?;
        Ok(Self::new(pipeline))
    }
}

/// Refuse options naming a model or detector other than the loaded pair.
fn ensure_loaded(
    model: RecognitionModel,
    detector: DetectorBackend,
    options: &RepresentOptions,
) -> Result<()> {
    if options.model != model {
        anyhow::bail!("model {} is not loaded (have {})", options.model, model);
    }
    if options.detector != detector {
        anyhow::bail!(
            "detector {} is not loaded (have {})",
            options.detector,
            detector
        );
    }
    Ok(())
}

/// Turn pipeline output into records, raising on an empty result only when
/// detection is enforced.
fn into_representations(
    faces: Vec<Face>,
    enforce_detection: bool,
) -> Result<Vec<FaceRepresentation>> {
    if faces.is_empty() && enforce_detection {
        anyhow::bail!(
            "Face could not be detected. Please confirm that the picture is a face photo \
             or consider to set enforce_detection param to False."
        );
    }
    Ok(faces.into_iter().map(FaceRepresentation::from).collect())
}

impl FaceEmbedder for OrtEmbedder {
    fn represent(
        &self,
        image: &DynamicImage,
        options: &RepresentOptions,
    ) -> Result<Vec<FaceRepresentation>> {
        ensure_loaded(self.model, self.detector, options)?;

        let faces = self
            .pipeline
            .lock()
            .map_err(|_| anyhow!("face pipeline lock poisoned"))?
            .represent(image)?;

        into_representations(faces, options.enforce_detection)
    }
}
