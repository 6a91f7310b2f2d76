use crate::backend::Device;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

pub const DEFAULT_MODEL_ID: &str = "plant_disease_mobilenet_v2";
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 8000;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub model_config: ModelConfig,
    pub scan_config: ScanConfig,
    pub taxonomy_path: Option<PathBuf>,
    pub preload_model: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub model_dir: PathBuf,
    pub model_url: Option<String>,
    pub model_sha256: Option<String>,
    pub input_size: u32,
    pub fetch_attempts: u32,
    pub device_priority: Vec<Device>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            model_dir: PathBuf::from("./models"),
            model_url: None,
            model_sha256: None,
            input_size: 224,
            fetch_attempts: 3,
            device_priority: vec![Device::Cuda, Device::Cpu],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Minimum top score for a taxonomy match (tau)
    pub confidence_threshold: f32,
    pub inference_timeout_ms: u64,
    pub max_image_bytes: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            inference_timeout_ms: DEFAULT_INFERENCE_TIMEOUT_MS,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.inference_timeout_ms == 0 {
            return Err(anyhow!("INFERENCE_TIMEOUT_MS must be greater than zero"));
        }
        if self.max_image_bytes == 0 {
            return Err(anyhow!("MAX_IMAGE_BYTES must be greater than zero"));
        }
        Ok(())
    }
}

/// Parse a comma separated device list, e.g. `cuda,cpu`
pub fn parse_device_priority(raw: &str) -> Result<Vec<Device>> {
    let devices = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Device>().map_err(|e| anyhow!(e)))
        .collect::<Result<Vec<_>>>()?;

    if devices.is_empty() {
        return Err(anyhow!("DEVICE_PRIORITY must name at least one device"));
    }
    Ok(devices)
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value for {}: {} ({})", name, raw, e)),
        Err(_) => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let api_port = parse_var("API_PORT", 8080u16)?;

        // Model configuration
        let defaults = ModelConfig::default();
        let device_priority = match optional_var("DEVICE_PRIORITY") {
            Some(raw) => parse_device_priority(&raw)?,
            None => defaults.device_priority,
        };

        let model_config = ModelConfig {
            model_id: optional_var("MODEL_ID").unwrap_or(defaults.model_id),
            model_dir: optional_var("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            model_url: optional_var("MODEL_URL"),
            model_sha256: optional_var("MODEL_SHA256").map(|s| s.to_lowercase()),
            input_size: parse_var("MODEL_INPUT_SIZE", defaults.input_size)?,
            fetch_attempts: parse_var("MODEL_FETCH_ATTEMPTS", defaults.fetch_attempts)?,
            device_priority,
        };

        if model_config.input_size == 0 {
            return Err(anyhow!("MODEL_INPUT_SIZE must be greater than zero"));
        }

        // Scan configuration
        let scan_config = ScanConfig {
            confidence_threshold: parse_var("CONFIDENCE_THRESHOLD", DEFAULT_CONFIDENCE_THRESHOLD)?,
            inference_timeout_ms: parse_var("INFERENCE_TIMEOUT_MS", DEFAULT_INFERENCE_TIMEOUT_MS)?,
            max_image_bytes: parse_var("MAX_IMAGE_BYTES", DEFAULT_MAX_IMAGE_BYTES)?,
        };
        scan_config.validate()?;

        Ok(Self {
            api_host,
            api_port,
            model_config,
            scan_config,
            taxonomy_path: optional_var("TAXONOMY_PATH").map(PathBuf::from),
            preload_model: parse_var("PRELOAD_MODEL", false)?,
        })
    }
}
