//! RetinaFace post-processing: prior boxes and anchor-based decoding.
//!
//! The detector predicts, for every prior box, a location delta, a two-class
//! confidence and five landmark deltas:
//! - loc: [1, N, 4] - (dx, dy, dw, dh)
//! - conf: [1, N, 2] - (background, face), already softmaxed by the export
//! - landms: [1, N, 10] - 5 points x (dx, dy)
//!
//! Priors are laid out per stride (8, 16, 32), row-major over the feature map,
//! with two square sizes per location. Decoding follows the SSD convention:
//! cx = prior_cx + dx * 0.1 * prior_w
//! w  = prior_w * exp(dw * 0.2)

use anyhow::Result;
use ndarray::Array2;

const STEPS: [usize; 3] = [8, 16, 32];
const MIN_SIZES: [[f32; 2]; 3] = [[16.0, 32.0], [64.0, 128.0], [256.0, 512.0]];
const VARIANCE: [f32; 2] = [0.1, 0.2];

#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h (normalized [0,1])
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,x2,y2,...,x5,y5 (normalized [0,1])
}

/// Generate the prior boxes for a square input, as rows of `[cx, cy, w, h]`
/// normalized to the input size.
pub fn prior_boxes(input_size: usize) -> Array2<f32> {
    let size = input_size as f32;
    let mut data = Vec::new();

    for (&step, min_sizes) in STEPS.iter().zip(MIN_SIZES.iter()) {
        let feature_size = input_size.div_ceil(step);
        for i in 0..feature_size {
            for j in 0..feature_size {
                for &min_size in min_sizes {
                    let cx = (j as f32 + 0.5) * step as f32 / size;
                    let cy = (i as f32 + 0.5) * step as f32 / size;
                    let s = min_size / size;
                    data.extend_from_slice(&[cx, cy, s, s]);
                }
            }
        }
    }

    let rows = data.len() / 4;
    Array2::from_shape_vec((rows, 4), data).unwrap_or_else(|_| Array2::zeros((0, 4)))
}

/// Decode raw predictions against `priors`, keeping those scoring at least
/// `score_threshold`.
pub fn decode_detections(
    loc: &Array2<f32>,
    conf: &Array2<f32>,
    landms: &Array2<f32>,
    priors: &Array2<f32>,
    score_threshold: f32,
) -> Result<Vec<RawDetection>> {
    let num_priors = priors.nrows();
    for (name, arr) in [("loc", loc), ("conf", conf), ("landms", landms)] {
        if arr.nrows() != num_priors {
            anyhow::bail!(
                "Expected {} rows in {}, got {}",
                num_priors,
                name,
                arr.nrows()
            );
        }
    }

    let mut detections = Vec::new();

    for idx in 0..num_priors {
        let score = conf[[idx, 1]];
        if score < score_threshold {
            continue;
        }

        let (p_cx, p_cy, p_w, p_h) = (
            priors[[idx, 0]],
            priors[[idx, 1]],
            priors[[idx, 2]],
            priors[[idx, 3]],
        );

        let cx = p_cx + loc[[idx, 0]] * VARIANCE[0] * p_w;
        let cy = p_cy + loc[[idx, 1]] * VARIANCE[0] * p_h;
        let w = p_w * (loc[[idx, 2]] * VARIANCE[1]).exp();
        let h = p_h * (loc[[idx, 3]] * VARIANCE[1]).exp();

        let mut lms = [0.0f32; 10];
        for k in 0..5 {
            lms[k * 2] = p_cx + landms[[idx, k * 2]] * VARIANCE[0] * p_w;
            lms[k * 2 + 1] = p_cy + landms[[idx, k * 2 + 1]] * VARIANCE[0] * p_h;
        }

        detections.push(RawDetection {
            bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
            score,
            landmarks: lms,
        });
    }

    Ok(detections)
}

/// Sort the detector's three outputs into `(loc, conf, landms)`.
///
/// Export tools disagree on output order and names, so tensors are told
/// apart by their last dimension.
pub fn parse_retinaface_outputs(
    outputs: &[(&[i64], &[f32])],
    num_priors: usize,
) -> Result<(Array2<f32>, Array2<f32>, Array2<f32>)> {
    let mut loc = None;
    let mut conf = None;
    let mut landms = None;

    for (idx, (shape, data)) in outputs.iter().enumerate() {
        if shape.len() != 3 || shape[0] != 1 {
            anyhow::bail!("Unexpected output shape at index {}: {:?}", idx, shape);
        }
        let rows = shape[1] as usize;
        let cols = shape[2] as usize;
        if rows != num_priors {
            anyhow::bail!(
                "Expected {} priors for output at index {}, got {}",
                num_priors,
                idx,
                rows
            );
        }

        let arr = Array2::from_shape_vec((rows, cols), data.to_vec())?;
        let slot = match cols {
            4 => &mut loc,
            2 => &mut conf,
            10 => &mut landms,
            _ => anyhow::bail!("Unexpected output width at index {}: {:?}", idx, shape),
        };
        if slot.replace(arr).is_some() {
            anyhow::bail!("Duplicate output of width {} at index {}", cols, idx);
        }
    }

    match (loc, conf, landms) {
        (Some(loc), Some(conf), Some(landms)) => Ok((loc, conf, landms)),
        _ => anyhow::bail!("Missing detector outputs, got {} tensors", outputs.len()),
    }
}
