use crate::retinaface;
use anyhow::Result;
use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;
use ort::{session::Session, value::Value};

/// RetinaFace input edge; the export uses a fixed square input.
pub const DETECTOR_INPUT_SIZE: u32 = 640;
/// ArcFace input edge.
pub const ENCODER_INPUT_SIZE: u32 = 112;

/// Per-channel BGR means subtracted before detection.
const DETECTOR_MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];

/// Eye positions of the ArcFace 112x112 alignment template.
const TEMPLATE_LEFT_EYE: (f32, f32) = (38.2946, 51.6963);
const TEMPLATE_RIGHT_EYE: (f32, f32) = (73.5318, 51.5014);

/// Detection result in source image pixels
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // left eye, right eye, nose, left mouth, right mouth
}

impl Detection {
    pub fn left_eye(&self) -> (f32, f32) {
        (self.landmarks[0], self.landmarks[1])
    }

    pub fn right_eye(&self) -> (f32, f32) {
        (self.landmarks[2], self.landmarks[3])
    }
}

/// Letterbox geometry used to map detector coordinates back to the source.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
}

impl Letterbox {
    fn unmap(&self, normalized: f32, offset: f32) -> f32 {
        (normalized * DETECTOR_INPUT_SIZE as f32 - offset) / self.scale
    }
}

/// Pad and resize to the detector's square input, keeping aspect ratio.
fn letterbox(img: &DynamicImage) -> (RgbImage, Letterbox) {
    let target = DETECTOR_INPUT_SIZE;
    let (orig_width, orig_height) = img.dimensions();
    let scale = target as f32 / orig_width.max(orig_height) as f32;
    let new_width = ((orig_width as f32 * scale) as u32).clamp(1, target);
    let new_height = ((orig_height as f32 * scale) as u32).clamp(1, target);

    let resized = img.resize_exact(new_width, new_height, image::imageops::FilterType::Triangle);

    let mut canvas = DynamicImage::new_rgb8(target, target);
    let offset_x = (target - new_width) / 2;
    let offset_y = (target - new_height) / 2;
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    (
        canvas.to_rgb8(),
        Letterbox {
            scale,
            offset_x: offset_x as f32,
            offset_y: offset_y as f32,
        },
    )
}

/// Build a `[1, 3, H, W]` tensor, mapping each RGB pixel through `f`.
fn to_nchw(img: &RgbImage, f: impl Fn([u8; 3]) -> [f32; 3]) -> Array4<f32> {
    let (w, h) = img.dimensions();
    let mut tensor = Array4::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        let values = f(pixel.0);
        for (c, v) in values.into_iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = v;
        }
    }
    tensor
}

/// Detect faces in an image using the RetinaFace detector.
///
/// Results are ordered by score, highest first.
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let (canvas, lb) = letterbox(img);

    // BGR, mean subtracted, no scaling
    let input_array = to_nchw(&canvas, |[r, g, b]| {
        [
            b as f32 - DETECTOR_MEAN_BGR[0],
            g as f32 - DETECTOR_MEAN_BGR[1],
            r as f32 - DETECTOR_MEAN_BGR[2],
        ]
    });
    let input_tensor = Value::from_array(input_array)?;

    let outputs = session.run(ort::inputs![input_tensor])?;

    let mut output_data: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        output_data.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let output_refs: Vec<(&[i64], &[f32])> = output_data
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let priors = retinaface::prior_boxes(DETECTOR_INPUT_SIZE as usize);
    let (loc, conf, landms) = retinaface::parse_retinaface_outputs(&output_refs, priors.nrows())?;
    let raw = retinaface::decode_detections(&loc, &conf, &landms, &priors, score_threshold)?;

    let detections: Vec<Detection> = raw
        .into_iter()
        .map(|d| {
            let mut landmarks = [0.0f32; 10];
            for i in 0..5 {
                landmarks[i * 2] = lb.unmap(d.landmarks[i * 2], lb.offset_x);
                landmarks[i * 2 + 1] = lb.unmap(d.landmarks[i * 2 + 1], lb.offset_y);
            }
            Detection {
                bbox: [
                    lb.unmap(d.bbox[0], lb.offset_x),
                    lb.unmap(d.bbox[1], lb.offset_y),
                    d.bbox[2] * DETECTOR_INPUT_SIZE as f32 / lb.scale,
                    d.bbox[3] * DETECTOR_INPUT_SIZE as f32 / lb.scale,
                ],
                score: d.score,
                landmarks,
            }
        })
        .collect();

    Ok(nms(&detections, nms_threshold))
}

/// Apply non-maximum suppression to remove overlapping detections.
///
/// The survivors come back sorted by descending score.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in sorted {
        if keep
            .iter()
            .all(|kept| compute_iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }

    keep
}

fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Align and crop a face so its eyes land on the ArcFace template.
///
/// The transform is a similarity (rotation, uniform scale, translation)
/// solved from the two eye points; pixels falling outside the source stay
/// black.
pub fn align_face(img: &DynamicImage, detection: &Detection, size: u32) -> Result<DynamicImage> {
    let unit = size as f32 / ENCODER_INPUT_SIZE as f32;
    let dst_left = (TEMPLATE_LEFT_EYE.0 * unit, TEMPLATE_LEFT_EYE.1 * unit);
    let dst_right = (TEMPLATE_RIGHT_EYE.0 * unit, TEMPLATE_RIGHT_EYE.1 * unit);
    let src_left = detection.left_eye();
    let src_right = detection.right_eye();

    let src_d = (src_right.0 - src_left.0, src_right.1 - src_left.1);
    let dst_d = (dst_right.0 - dst_left.0, dst_right.1 - dst_left.1);
    let src_len2 = src_d.0 * src_d.0 + src_d.1 * src_d.1;
    if !(src_len2 > f32::EPSILON) {
        anyhow::bail!("degenerate eye landmarks: {:?} {:?}", src_left, src_right);
    }

    // Output -> source mapping: src = [a -b; b a] * (dst - dst_left) + src_left
    let a = (dst_d.0 * src_d.0 + dst_d.1 * src_d.1) / (dst_d.0 * dst_d.0 + dst_d.1 * dst_d.1);
    let b = (dst_d.0 * src_d.1 - dst_d.1 * src_d.0) / (dst_d.0 * dst_d.0 + dst_d.1 * dst_d.1);

    let rgb = img.to_rgb8();
    let (img_w, img_h) = rgb.dimensions();
    let mut output = RgbImage::new(size, size);

    for (out_x, out_y, out_px) in output.enumerate_pixels_mut() {
        let dx = out_x as f32 - dst_left.0;
        let dy = out_y as f32 - dst_left.1;
        let in_x = a * dx - b * dy + src_left.0;
        let in_y = b * dx + a * dy + src_left.1;

        if in_x < 0.0 || in_y < 0.0 || in_x >= img_w as f32 || in_y >= img_h as f32 {
            continue;
        }

        let x0 = in_x.floor() as u32;
        let y0 = in_y.floor() as u32;
        let x1 = (x0 + 1).min(img_w - 1);
        let y1 = (y0 + 1).min(img_h - 1);
        let fx = in_x - x0 as f32;
        let fy = in_y - y0 as f32;

        let p00 = rgb.get_pixel(x0, y0);
        let p10 = rgb.get_pixel(x1, y0);
        let p01 = rgb.get_pixel(x0, y1);
        let p11 = rgb.get_pixel(x1, y1);

        for c in 0..3 {
            let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
            let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
            out_px[c] = (top * (1.0 - fy) + bottom * fy).round() as u8;
        }
    }

    Ok(DynamicImage::ImageRgb8(output))
}

/// Encode an aligned face with ArcFace.
///
/// The vector is returned as the model produced it, without normalization.
pub fn encode_face(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    let size = ENCODER_INPUT_SIZE;
    let face_rgb = face_img
        .resize_exact(size, size, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let input_array = to_nchw(&face_rgb, |px| px.map(|v| (v as f32 - 127.5) / 128.0));
    let input_tensor = Value::from_array(input_array)?;

    let outputs = session.run(ort::inputs![input_tensor])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    // Expecting shape [1, 512]
    let embedding_size = if shape.len() == 2 {
        shape[1] as usize
    } else {
        data.len()
    };
    if embedding_size > data.len() {
        anyhow::bail!("encoder output shape {:?} exceeds data length {}", shape, data.len());
    }

    Ok(data[..embedding_size].to_vec())
}
