use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ExoError, Result};
use crate::types::{DeviceId, PressureThresholds};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Top-level configuration for the Exo pipeline.
///
/// Loaded from `~/.exo/config.toml` by default. Every section and field is optional in the
/// file; missing values take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExoConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

impl ExoConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ExoConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.window_size == 0 {
            return Err(ExoError::Config("chunking.window_size must be > 0".into()));
        }
        if c.overlap >= c.window_size {
            return Err(ExoError::Config(format!(
                "chunking.overlap ({}) must be smaller than chunking.window_size ({})",
                c.overlap, c.window_size
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(ExoError::Config("embedding.batch_size must be > 0".into()));
        }
        if self.embedding.dimensions == 0 {
            return Err(ExoError::Config("embedding.dimensions must be > 0".into()));
        }
        let s = &self.scheduler;
        if s.max_workers == 0 || s.per_device_parallelism == 0 {
            return Err(ExoError::Config(
                "scheduler.max_workers and scheduler.per_device_parallelism must be > 0".into(),
            ));
        }
        if s.worker_count == Some(0) || s.queue_capacity == Some(0) {
            return Err(ExoError::Config(
                "scheduler.worker_count and scheduler.queue_capacity must be > 0 when set".into(),
            ));
        }
        if s.pressure_check_interval == 0 {
            return Err(ExoError::Config(
                "scheduler.pressure_check_interval must be > 0".into(),
            ));
        }
        for (name, value) in [
            ("resources.host_pressure_threshold", self.resources.host_pressure_threshold),
            (
                "resources.accelerator_pressure_threshold",
                self.resources.accelerator_pressure_threshold,
            ),
        ] {
            if value.is_nan() || value <= 0.0 || value > 1.0 {
                return Err(ExoError::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.index.rebuild_growth_ratio.is_nan() || self.index.rebuild_growth_ratio <= 0.0 {
            return Err(ExoError::Config(
                "index.rebuild_growth_ratio must be > 0".into(),
            ));
        }
        if self.index.max_clusters == 0 || self.index.scan_clusters == 0 {
            return Err(ExoError::Config(
                "index.max_clusters and index.scan_clusters must be > 0".into(),
            ));
        }
        if !self.devices.host_enabled && !self.devices.enable_accelerators {
            return Err(ExoError::Config(
                "at least one of devices.host_enabled or devices.enable_accelerators must be true"
                    .into(),
            ));
        }
        match self.devices.preferred {
            Some(DeviceId::Cpu) if !self.devices.host_enabled => {
                return Err(ExoError::Config(
                    "devices.preferred is cpu but devices.host_enabled is false".into(),
                ));
            }
            Some(id @ DeviceId::Accelerator(_)) if !self.devices.enable_accelerators => {
                return Err(ExoError::Config(format!(
                    "devices.preferred is {} but devices.enable_accelerators is false",
                    id
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Default location of the configuration file (`~/.exo/config.toml`).
    pub fn default_path() -> PathBuf {
        expand_home("~/.exo/config.toml")
    }
}

/// Expand a leading `~/` to the user's home directory. Other paths are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
        if let Some(home) = home {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Default directory for the persisted index pair.
    pub index_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            index_dir: "~/.exo/index".to_string(),
        }
    }
}

/// Text cleaning and windowing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Window length in characters.
    pub window_size: usize,
    /// Characters shared between consecutive windows.
    pub overlap: usize,
    /// Files larger than this are skipped.
    pub max_file_size: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_size: 512,
            overlap: 50,
            max_file_size: 10 * MIB,
        }
    }
}

/// Embedding engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Items per model call.
    pub batch_size: usize,
    /// Vector dimensionality of the built-in hash model.
    pub dimensions: usize,
    /// Directory holding `model.onnx` and `tokenizer.json` (requires the `onnx` feature).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            dimensions: 384,
            model_dir: None,
        }
    }
}

/// Which compute backends may be used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Detect accelerators at startup.
    pub enable_accelerators: bool,
    /// Allow the host CPU to run encodes.
    pub host_enabled: bool,
    /// Device every task asks for (`"cpu"` or `"accelerator:<n>"`). When
    /// unset, or when the device is busy, the engine picks by rank.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred: Option<DeviceId>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            enable_accelerators: true,
            host_enabled: true,
            preferred: None,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed worker count. When unset, derived from usable devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<usize>,
    pub max_workers: usize,
    pub per_device_parallelism: usize,
    /// Task queue capacity. When unset, four slots per worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    /// Completed tasks between memory pressure checks.
    pub pressure_check_interval: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            max_workers: 8,
            per_device_parallelism: 2,
            queue_capacity: None,
            pressure_check_interval: 20,
        }
    }
}

impl SchedulerConfig {
    /// Worker count for a given number of usable devices.
    pub fn effective_workers(&self, usable_devices: usize) -> usize {
        match self.worker_count {
            Some(n) => n.max(1),
            None => (usable_devices.max(1) * self.per_device_parallelism)
                .min(self.max_workers)
                .max(1),
        }
    }

    pub fn effective_queue_capacity(&self, workers: usize) -> usize {
        self.queue_capacity.unwrap_or(4 * workers).max(1)
    }
}

/// Memory pressure thresholds, as fractions of capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub host_pressure_threshold: f64,
    pub accelerator_pressure_threshold: f64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        let thresholds = PressureThresholds::default();
        Self {
            host_pressure_threshold: thresholds.host,
            accelerator_pressure_threshold: thresholds.accelerator,
        }
    }
}

impl ResourcesConfig {
    pub fn thresholds(&self) -> PressureThresholds {
        PressureThresholds {
            host: self.host_pressure_threshold,
            accelerator: self.accelerator_pressure_threshold,
        }
    }
}

/// Scratch staging area for intermediate file reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub capacity_bytes: u64,
    /// Parent directory for the staging root. Defaults to `/dev/shm` when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 4 * GIB,
            root: None,
        }
    }
}

/// Nearest-neighbor index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Retrain clusters once the corpus grows by more than this fraction.
    pub rebuild_growth_ratio: f64,
    /// Below this many entries the index stays exact.
    pub flat_threshold: usize,
    pub max_clusters: usize,
    /// Lists scanned per query before widening.
    pub scan_clusters: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            rebuild_growth_ratio: 0.5,
            flat_threshold: 1000,
            max_clusters: 100,
            scan_clusters: 8,
        }
    }
}
