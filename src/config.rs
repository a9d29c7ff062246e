use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compression::{CompressionOptions, JpegEncoderKind, DEFAULT_MAX_BYTES, MAX_DIMENSION};
use crate::contract::ReceiptPolling;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub compression: CompressionConfig,
    pub storage: StorageConfig,
    pub chain: ChainConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_mb: usize,
    pub worker_threads: Option<usize>,
    pub enable_cors: bool,
    /// Directory with the built front-end, served at `/` when set.
    pub static_dir: Option<PathBuf>,
}

/// Quality values use the 0..=1 scale of canvas encoders and are turned
/// into whole percentages for the JPEG encoders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub max_image_bytes: usize,
    pub max_dimension: u32,
    pub initial_quality: f32,
    pub quality_step: f32,
    pub min_quality: f32,
    pub shrink_below_quality: f32,
    pub shrink_factor: f64,
    pub max_attempts: u32,
    pub encoder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Deployed contract. Minting is simulated when unset.
    pub contract_address: Option<String>,
    /// JSON-RPC endpoint of the wallet or node that signs transactions.
    pub rpc_url: Option<String>,
    pub receipt_poll_secs: u64,
    pub receipt_timeout_secs: u64,
    /// Offset used to place notes on calendar days.
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub enable_request_logging: bool,
    pub log_compression_stats: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5175,
            max_upload_mb: 20,
            worker_threads: None,
            enable_cors: true,
            static_dir: None,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: DEFAULT_MAX_BYTES,
            max_dimension: MAX_DIMENSION,
            initial_quality: 0.92,
            quality_step: 0.12,
            min_quality: 0.35,
            shrink_below_quality: 0.4,
            shrink_factor: 0.85,
            max_attempts: 8,
            encoder: "mozjpeg".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            contract_address: None,
            rpc_url: None,
            receipt_poll_secs: 2,
            receipt_timeout_secs: 180,
            utc_offset_minutes: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_request_logging: true,
            log_compression_stats: true,
        }
    }
}

fn percent(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(0.0, 100.0) as u8
}

impl Config {
    /// Load configuration from file, falling back to defaults if file doesn't exist
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration from environment variables and file
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("EVERYFIRST_CONFIG").unwrap_or_else(|_| "everyfirst.toml".to_string());

        let mut config = Self::load_from_file(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("EVERYFIRST_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("EVERYFIRST_PORT") {
            if let Ok(port_num) = port.parse::<u16>() {
                self.server.port = port_num;
            }
        }

        if let Ok(max_bytes) = std::env::var("EVERYFIRST_MAX_IMAGE_BYTES") {
            if let Ok(bytes) = max_bytes.parse::<usize>() {
                self.compression.max_image_bytes = bytes;
            }
        }

        if let Ok(dir) = std::env::var("EVERYFIRST_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }

        if let Ok(address) = std::env::var("EVERYFIRST_CONTRACT_ADDRESS") {
            self.chain.contract_address = Some(address).filter(|a| !a.is_empty());
        }

        if let Ok(url) = std::env::var("EVERYFIRST_RPC_URL") {
            self.chain.rpc_url = Some(url).filter(|u| !u.is_empty());
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError("Port cannot be 0".to_string()));
        }

        if self.server.max_upload_mb == 0 {
            return Err(ConfigError::ValidationError("Max upload size cannot be 0".to_string()));
        }

        if self.compression.max_image_bytes == 0 {
            return Err(ConfigError::ValidationError("Image byte budget cannot be 0".to_string()));
        }

        if self.compression.max_dimension == 0 || self.compression.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "Max dimension and max attempts must be positive".to_string(),
            ));
        }

        let c = &self.compression;
        for (name, q) in [
            ("initial_quality", c.initial_quality),
            ("quality_step", c.quality_step),
            ("min_quality", c.min_quality),
            ("shrink_below_quality", c.shrink_below_quality),
        ] {
            if !(0.0..=1.0).contains(&q) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be between 0 and 1",
                    name
                )));
            }
        }

        if c.min_quality > c.initial_quality {
            return Err(ConfigError::ValidationError(
                "min_quality cannot exceed initial_quality".to_string(),
            ));
        }

        if !(c.shrink_factor > 0.0 && c.shrink_factor < 1.0) {
            return Err(ConfigError::ValidationError(
                "shrink_factor must be between 0 and 1".to_string(),
            ));
        }

        if c.encoder.parse::<JpegEncoderKind>().is_err() {
            return Err(ConfigError::ValidationError(
                "Invalid encoder. Must be one of: [\"mozjpeg\", \"jpeg-encoder\"]".to_string(),
            ));
        }

        if self.chain.contract_address.is_some() && self.chain.rpc_url.is_none() {
            return Err(ConfigError::ValidationError(
                "chain.contract_address requires chain.rpc_url".to_string(),
            ));
        }

        if self.chain.utc_offset().is_none() {
            return Err(ConfigError::ValidationError(
                "utc_offset_minutes must be within one day".to_string(),
            ));
        }

        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Self::default();
        let toml_content = toml::to_string_pretty(&config)
            .map_err(|e| ConfigError::SerializeError(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_content)
            .map_err(|e| ConfigError::IoError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb * 1024 * 1024
    }

    pub fn compression_options(&self) -> CompressionOptions {
        let c = &self.compression;
        CompressionOptions {
            max_dimension: c.max_dimension,
            initial_quality: percent(c.initial_quality),
            quality_step: percent(c.quality_step),
            min_quality: percent(c.min_quality),
            shrink_threshold: percent(c.shrink_below_quality),
            shrink_factor: c.shrink_factor,
            max_attempts: c.max_attempts,
            encoder: c.encoder.parse().unwrap_or_default(),
        }
    }
}

impl ChainConfig {
    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }

    pub fn receipt_polling(&self) -> ReceiptPolling {
        ReceiptPolling {
            interval: Duration::from_secs(self.receipt_poll_secs.max(1)),
            timeout: Duration::from_secs(self.receipt_timeout_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Serialization error: {0}")]
    SerializeError(String),
}
