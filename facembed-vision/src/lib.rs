pub mod face;
pub mod model;
pub mod pipeline;
pub mod retinaface;

// Re-export commonly used types
pub use face::Detection;
pub use pipeline::{embed_detections, Face, Pipeline, Thresholds};
