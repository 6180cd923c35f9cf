use anyhow::Result;
use facembed_vision::{Pipeline, Thresholds};
use image::{DynamicImage, Rgb, RgbImage};
use std::path::PathBuf;

/// Model locations, overridable so CI can point at a cache.
fn model_paths() -> Option<(PathBuf, PathBuf)> {
    let detector = std::env::var("FACEMBED_DETECTOR_MODEL")
        .unwrap_or_else(|_| "models/retinaface_resnet50.onnx".into());
    let recognizer = std::env::var("FACEMBED_RECOGNITION_MODEL")
        .unwrap_or_else(|_| "models/arcface_r100.onnx".into());
    let (detector, recognizer) = (PathBuf::from(detector), PathBuf::from(recognizer));

    if !detector.exists() || !recognizer.exists() {
        eprintln!(
            "Skipping: models not found at {} / {}",
            detector.display(),
            recognizer.display()
        );
        return None;
    }
    Some((detector, recognizer))
}

#[test]
fn test_pipeline_initialization() -> Result<()> {
    env_logger::try_init().ok();
    let Some((detector, recognizer)) = model_paths() else {
        return Ok(());
    };

    let _pipeline = Pipeline::new(&detector, &recognizer, Thresholds::default())?;
    println!("✓ Pipeline initialized successfully");
    Ok(())
}

#[test]
fn test_missing_model_is_an_error() {
    let missing = PathBuf::from("definitely/not/here.onnx");
    let err = match Pipeline::new(&missing, &missing, Thresholds::default()) {
        Ok(_) => panic!("loading a missing model should fail"),
        Err(e) => e,
    };
    assert!(format!("{err:#}").contains("here.onnx"));
}

#[test]
fn test_blank_image_has_no_faces() -> Result<()> {
    env_logger::try_init().ok();
    let Some((detector, recognizer)) = model_paths() else {
        return Ok(());
    };

    let mut pipeline = Pipeline::new(&detector, &recognizer, Thresholds::default())?;
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(320, 240, Rgb([128, 128, 128])));

    let faces = pipeline.represent(&img)?;
    assert!(faces.is_empty(), "expected no faces, got {}", faces.len());
    Ok(())
}

#[test]
fn test_face_image_yields_finite_embedding() -> Result<()> {
    env_logger::try_init().ok();
    let Some((detector, recognizer)) = model_paths() else {
        return Ok(());
    };

    let img_path = "test_faces/single.jpg";
    if !std::path::Path::new(img_path).exists() {
        eprintln!("Skipping: {} not found", img_path);
        return Ok(());
    }

    let mut pipeline = Pipeline::new(&detector, &recognizer, Thresholds::default())?;
    let img = image::open(img_path)?;

    let first = pipeline.represent(&img)?;
    assert!(!first.is_empty(), "expected a face in {}", img_path);
    assert_eq!(first[0].embedding.len(), 512);
    assert!(first[0].embedding.iter().all(|v| v.is_finite()));

    // Same input, same vector
    let second = pipeline.represent(&img)?;
    assert_eq!(first[0].embedding, second[0].embedding);
    Ok(())
}
