use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;

use crate::face::{self, Detection};

/// One detected face and its ArcFace vector.
#[derive(Debug, Clone)]
pub struct Face {
    pub detection: Detection,
    pub embedding: Vec<f32>,
}

/// Detection tuning passed to RetinaFace.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub score: f32,
    pub nms: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            score: 0.9,
            nms: 0.4,
        }
    }
}

/// Full pipeline: detect faces → align → encode
pub struct Pipeline {
    pub detector: Session,
    pub encoder: Session,
    pub thresholds: Thresholds,
}

impl Pipeline {
    pub fn new(detector_model: &Path, recognition_model: &Path, thresholds: Thresholds) -> Result<Self> {
        Ok(Self {
            detector: crate::model::detector_session(detector_model)?,
            encoder: crate::model::recog_session(recognition_model)?,
            thresholds,
        })
    }

    /// Embed every face in the image, in detection order.
    ///
    /// An image without faces yields an empty vector. A face that cannot be
    /// aligned or encoded keeps its place with an empty embedding.
    pub fn represent(&mut self, img: &DynamicImage) -> Result<Vec<Face>> {
        let detections = face::detect_faces(
            &mut self.detector,
            img,
            self.thresholds.score,
            self.thresholds.nms,
        )
        .context("detecting faces")?;

        log::debug!("{} face(s) detected", detections.len());

        Ok(embed_detections(detections, |detection| {
            let aligned = face::align_face(img, detection, face::ENCODER_INPUT_SIZE)
                .context("aligning face")?;
            face::encode_face(&mut self.encoder, &aligned).context("encoding face")
        }))
    }
}

/// Pair each detection with its vector; per-face failures are logged and
/// leave the embedding empty.
pub fn embed_detections<F>(detections: Vec<Detection>, mut embed: F) -> Vec<Face>
where
    F: FnMut(&Detection) -> Result<Vec<f32>>,
{
    detections
        .into_iter()
        .enumerate()
        .map(|(i, detection)| {
            let embedding = embed(&detection).unwrap_or_else(|e| {
                log::warn!("face {} (score {:.3}): {:#}", i, detection.score, e);
                Vec::new()
            });
            Face {
                detection,
                embedding,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(score: f32) -> Detection {
        Detection {
            bbox: [0.0, 0.0, 10.0, 10.0],
            score,
            landmarks: [0.0; 10],
        }
    }

    #[test]
    fn test_failed_face_keeps_its_slot() {
        let detections = vec![detection(0.99), detection(0.95), detection(0.9)];

        let faces = embed_detections(detections, |d| {
            if d.score == 0.95 {
                anyhow::bail!("degenerate eye landmarks");
            }
            Ok(vec![d.score, 1.0])
        });

        assert_eq!(faces.len(), 3);
        assert_eq!(faces[0].embedding, vec![0.99, 1.0]);
        assert!(faces[1].embedding.is_empty());
        assert_eq!(faces[1].detection.score, 0.95);
        assert_eq!(faces[2].embedding, vec![0.9, 1.0]);
    }

    #[test]
    fn test_real_alignment_failure_is_contained() {
        // Coincident eyes cannot be aligned
        let img = DynamicImage::new_rgb8(32, 32);
        let faces = embed_detections(vec![detection(0.97)], |d| {
            face::align_face(&img, d, face::ENCODER_INPUT_SIZE).map(|_| vec![0.5])
        });
        assert_eq!(faces.len(), 1);
        assert!(faces[0].embedding.is_empty());
    }
}
