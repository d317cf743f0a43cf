// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{RevereError, Result};

/// Top-level configuration loaded from a TOML file. `top_dir` is the sole
/// required operator input (spec §6.5); everything else has a default.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Root directory. Per-camera storage files live under `<top_dir>/video/`.
    pub top_dir: PathBuf,
    /// Storage sizing/retention defaults.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Statically configured cameras (discovery can add more at runtime).
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    /// HTTP read surface configuration.
    #[serde(default)]
    pub api: ApiConfig,
    /// Discovery agent configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// HTTP API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: default_api_enabled(), port: default_api_port() }
    }
}

fn default_api_enabled() -> bool { true }
fn default_api_port() -> u16 { 8080 }

/// Storage parameters shared by every camera's block store file.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Block size in bytes. Must be large enough that `max_indexes_within`
    /// covers the `num_blocks` a camera's file will need (spec §4.1).
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Fraction of `block_size` that must be used before a video key frame
    /// is allowed to seal a block (spec §4.4, nominally 0.75).
    #[serde(default = "default_seal_threshold")]
    pub seal_threshold: f64,
    /// Gap, in seconds, above which two adjacent indexed blocks are
    /// considered to belong to different segments (spec §4.5.3, §9).
    #[serde(default = "default_segment_gap_secs")]
    pub segment_gap_secs: u64,
    /// Default retention window, in days, used to size a camera's file at
    /// first allocation and to drive the prune hook.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Assumed steady-state byte rate (bytes/sec) used to size a brand new
    /// camera file before any measurement exists.
    #[serde(default = "default_assumed_byte_rate")]
    pub assumed_byte_rate: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            seal_threshold: default_seal_threshold(),
            segment_gap_secs: default_segment_gap_secs(),
            retention_days: default_retention_days(),
            assumed_byte_rate: default_assumed_byte_rate(),
        }
    }
}

fn default_block_size() -> u32 { 4 * 1024 * 1024 }
fn default_seal_threshold() -> f64 { 0.75 }
fn default_segment_gap_secs() -> u64 { 10 }
fn default_retention_days() -> u32 { 14 }
fn default_assumed_byte_rate() -> u64 { 1_000_000 }

/// Per-camera configuration; mirrors the spec's "Camera" entity (§3.1).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Stable id (normally `md5(address)`, see `discovery::hash_address`).
    pub id: String,
    pub name: String,
    pub ipv4: String,
    pub onvif_url: String,
    #[serde(default)]
    pub rtsp_url: Option<String>,
    #[serde(default = "default_true")]
    pub record: bool,
    #[serde(default = "default_true")]
    pub motion_enabled: bool,
    #[serde(default)]
    pub retention_days_override: Option<u32>,
    #[serde(default = "default_motion_sensitivity")]
    pub motion_sensitivity: f64,
}

fn default_true() -> bool { true }
fn default_motion_sensitivity() -> f64 { 2.0 }

/// Discovery agent configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_cache_base_mins")]
    pub cache_base_mins: u64,
    #[serde(default = "default_cache_jitter_mins")]
    pub cache_jitter_mins: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            cache_base_mins: default_cache_base_mins(),
            cache_jitter_mins: default_cache_jitter_mins(),
        }
    }
}

fn default_poll_interval_secs() -> u64 { 60 }
fn default_cache_base_mins() -> u64 { 60 }
fn default_cache_jitter_mins() -> u64 { 10 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RevereError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| RevereError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.storage.block_size == 0 {
            return Err(RevereError::Config("storage.block_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.storage.seal_threshold) {
            return Err(RevereError::Config("storage.seal_threshold must be in [0,1]".into()));
        }
        if self.storage.retention_days == 0 {
            return Err(RevereError::Config("storage.retention_days must be > 0".into()));
        }
        Ok(())
    }

    /// Directory holding one block-store file per camera (spec §6.4).
    pub fn video_dir(&self) -> PathBuf {
        self.top_dir.join("video")
    }

    /// Path of the per-camera block store file.
    pub fn camera_path(&self, camera_id: &str) -> PathBuf {
        self.video_dir().join(format!("{camera_id}.rvd"))
    }

    /// Path of the per-camera motion-event block store file (spec §4.11).
    pub fn motion_path(&self, camera_id: &str) -> PathBuf {
        self.video_dir().join(format!("{camera_id}.motion.rvd"))
    }
}
