pub mod config;
pub mod embedder;
pub mod error;
pub mod handler;

pub use embedder::{FaceEmbedder, FaceRepresentation, OrtEmbedder, RepresentOptions};
pub use error::EmbedError;
pub use handler::Outcome;
