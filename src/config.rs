use anyhow::{Context, Result};
use facembed_vision::Thresholds;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEMBED_CONFIG_PATH").unwrap_or("/usr/local/etc/facembed/config.toml"))
});

pub static MODEL_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEMBED_MODEL_PREFIX").unwrap_or("/usr/local/share/facembed"))
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// 0 lets actix pick one worker per physical core.
    pub workers: usize,
    pub max_body_bytes: usize,
    pub detector_model: PathBuf,
    pub recognition_model: PathBuf,
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            workers: 0,
            max_body_bytes: 16 * 1024 * 1024,
            detector_model: MODEL_PREFIX.join("retinaface_resnet50.onnx"),
            recognition_model: MODEL_PREFIX.join("arcface_r100.onnx"),
            score_threshold: thresholds.score,
            nms_threshold: thresholds.nms,
        }
    }
}

impl Config {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            score: self.score_threshold,
            nms: self.nms_threshold,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn render_config(cfg: &Config) -> Result<String> {
    toml::to_string_pretty(cfg).context("serializing config")
}
