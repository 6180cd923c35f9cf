//! `POST /api/generate_embedding`: base64 image in, face embedding out.

use std::io::Cursor;
use std::sync::Arc;

use actix_web::http::header::{self, ContentType};
use actix_web::{post, web, HttpRequest, HttpResponse};
use anyhow::{anyhow, Context};
use base64::{engine::general_purpose, Engine as _};
use futures::StreamExt;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::embedder::{
    DetectorBackend, FaceEmbedder, FaceRepresentation, RecognitionModel, RepresentOptions,
};
use crate::error::EmbedError;

type Result<T> = std::result::Result<T, EmbedError>;

/// Parameters every request runs the embedder with. A photo without a face
/// is an expected outcome, so detection is not enforced.
pub const REPRESENT_OPTIONS: RepresentOptions = RepresentOptions {
    model: RecognitionModel::ArcFace,
    detector: DetectorBackend::RetinaFace,
    enforce_detection: false,
};

#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_body_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

/// What the embedder's answer means for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    NoFaceDetected,
    Detected(Vec<f32>),
}

impl Outcome {
    /// Only the first record counts; an empty list and a first record
    /// without a vector both mean no face.
    pub fn from_representations(faces: Vec<FaceRepresentation>) -> Self {
        match faces.into_iter().next().and_then(|face| face.embedding) {
            Some(embedding) => Outcome::Detected(embedding),
            None => Outcome::NoFaceDetected,
        }
    }
}

/// Drop a `data:<mime>;base64,` header if present.
pub fn strip_data_url(image_base64: &str) -> &str {
    image_base64
        .split_once(',')
        .map_or(image_base64, |(_, payload)| payload)
}

/// Keep only base64 alphabet characters; line breaks from MIME wrapping and
/// other stray bytes are discarded rather than rejected.
fn base64_alphabet_only(payload: &str) -> String {
    payload
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect()
}

/// Base64 text (plain or data URL) to an upright RGB image.
///
/// EXIF orientation is applied, so portrait phone photos reach the detector
/// the right way up.
pub fn decode_image(image_base64: &str) -> Result<DynamicImage> {
    let bytes = general_purpose::STANDARD.decode(base64_alphabet_only(strip_data_url(image_base64)))?;

    let mut decoder = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .context("reading image header")?
        .into_decoder()
        .context("decoding image")?;
    let orientation = decoder.orientation().unwrap_or_else(|e| {
        debug!("ignoring unreadable orientation metadata: {e}");
        Orientation::NoTransforms
    });
    let mut img = DynamicImage::from_decoder(decoder).context("decoding image")?;
    img.apply_orientation(orientation);

    Ok(DynamicImage::ImageRgb8(img.into_rgb8()))
}

pub fn embed_image(embedder: &dyn FaceEmbedder, img: &DynamicImage) -> Result<Outcome> {
    let faces = embedder
        .represent(img, &REPRESENT_OPTIONS)
        .context("running face embedder")?;
    debug!("embedder returned {} face record(s)", faces.len());
    Ok(Outcome::from_representations(faces))
}

/// Pull the non-empty `image_base64` string out of a JSON object body.
fn image_field(body: &[u8]) -> Result<String> {
    let data: Map<String, Value> =
        serde_json::from_slice(body).context("parsing request body as a JSON object")?;

    match data.get("image_base64") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        None | Some(Value::Null) | Some(Value::String(_)) => Err(EmbedError::MissingImage),
        Some(other) => Err(anyhow!("image_base64 must be a string, got {other}").into()),
    }
}

async fn read_body(req: &HttpRequest, mut payload: web::Payload, limit: usize) -> Result<web::Bytes> {
    let declared: usize = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .context("missing Content-Length header")?
        .to_str()
        .context("invalid Content-Length header")?
        .trim()
        .parse()
        .context("invalid Content-Length header")?;

    if declared > limit {
        return Err(anyhow!("request body of {declared} bytes exceeds the {limit} byte limit").into());
    }

    let mut body = web::BytesMut::with_capacity(declared);
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| anyhow!("reading request body: {e}"))?;
        if body.len() + chunk.len() > declared {
            return Err(anyhow!("request body is longer than Content-Length {declared}").into());
        }
        body.extend_from_slice(&chunk);
    }
    if body.len() < declared {
        return Err(anyhow!(
            "request body ended after {} of {declared} bytes",
            body.len()
        )
        .into());
    }

    Ok(body.freeze())
}

async fn process(
    req: &HttpRequest,
    payload: web::Payload,
    embedder: Arc<dyn FaceEmbedder>,
) -> Result<Vec<f32>> {
    let limits = req
        .app_data::<web::Data<RequestLimits>>()
        .map(|l| ***l)
        .unwrap_or_default();

    let body = read_body(req, payload, limits.max_body_bytes).await?;
    let image_base64 = image_field(&body)?;

    let outcome = web::block(move || {
        let img = decode_image(&image_base64)?;
        debug!("decoded {}x{} image", img.width(), img.height());
        embed_image(embedder.as_ref(), &img)
    })
    .await
    .map_err(|e| anyhow!("embedding task failed: {e}"))??;

    match outcome {
        Outcome::Detected(embedding) => Ok(embedding),
        Outcome::NoFaceDetected => Err(EmbedError::NoFaceDetected),
    }
}

#[post("/api/generate_embedding")]
pub async fn generate_embedding(
    req: HttpRequest,
    payload: web::Payload,
    embedder: web::Data<dyn FaceEmbedder>,
) -> Result<HttpResponse> {
    match process(&req, payload, embedder.into_inner()).await {
        Ok(embedding) => {
            debug!("returning {}-dimensional embedding", embedding.len());
            Ok(HttpResponse::Ok()
                .content_type(ContentType::json())
                .json(EmbeddingResponse { embedding }))
        }
        Err(err) => {
            match &err {
                EmbedError::Unexpected(e) => warn!("embedding request failed: {e:#}"),
                other => debug!("rejected embedding request: {other}"),
            }
            Err(err)
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(generate_embedding);
}
