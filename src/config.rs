//! Configuration loading with Figment.
//!
//! Settings are read from a TOML file and then overridden by environment
//! variables prefixed with `UEYE_DAQ_`. Nested keys are separated by a
//! double underscore, e.g. `UEYE_DAQ_ACQUISITION__MAX_FRAMES=250`.
//!
//! ```toml
//! [camera]
//! device_id = 0
//! buffer_count = 3
//! log_level = "info"
//!
//! [acquisition]
//! worker_timeout_ms = 1000
//! flush_every = 100
//! max_frames = 250
//! stop_policy = "legacy"   # or "exact"
//!
//! [output]
//! folder = "data"
//! base_name = "frame_"
//! file_type = ".png"       # .png, .tif, .tiff, .bmp or "envi"
//!
//! [cube]
//! aoi = [0, 0, 640, 480]
//! ```
//!
//! Every section and key is optional.

use crate::driver::Rect;
use crate::error::{CameraError, Result};
use crate::sinks::{StopCondition, StopPolicy};
use crate::storage::codec::SUPPORTED_EXTENSIONS;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/ueye_daq.toml";

/// `file_type` value selecting ENVI cube output.
pub const CUBE_FILE_TYPE: &str = "envi";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Device and buffer settings
    #[serde(default)]
    pub camera: CameraSettings,
    /// Worker settings
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// File output settings
    #[serde(default)]
    pub output: OutputSettings,
    /// Cube output settings
    #[serde(default)]
    pub cube: CubeSettings,
}

/// Device and buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Camera id (0 = first available)
    #[serde(default)]
    pub device_id: u32,
    /// Buffers in the capture ring
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Fetch timeout of background workers in milliseconds
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_ms: u32,
    /// Frames between cube flushes
    #[serde(default = "default_flush_every")]
    pub flush_every: u64,
    /// Frame budget; absent means run until stopped
    #[serde(default)]
    pub max_frames: Option<u64>,
    /// How the frame budget is applied
    #[serde(default)]
    pub stop_policy: StopPolicy,
}

/// File output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Output folder
    #[serde(default = "default_folder")]
    pub folder: PathBuf,
    /// File name prefix
    #[serde(default = "default_base_name")]
    pub base_name: String,
    /// Image extension, or "envi" for cube output
    #[serde(default = "default_file_type")]
    pub file_type: String,
}

/// Cube output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CubeSettings {
    /// Cube AOI as `[x, y, width, height]`
    #[serde(default)]
    pub aoi: Option<[u32; 4]>,
}

fn default_buffer_count() -> usize {
    crate::buffer_pool::DEFAULT_BUFFER_COUNT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_timeout() -> u32 {
    crate::worker::DEFAULT_WORKER_TIMEOUT_MS
}

fn default_flush_every() -> u64 {
    crate::sinks::DEFAULT_FLUSH_EVERY
}

fn default_folder() -> PathBuf {
    PathBuf::from(".")
}

fn default_base_name() -> String {
    "frame_".to_string()
}

fn default_file_type() -> String {
    ".png".to_string()
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device_id: 0,
            buffer_count: default_buffer_count(),
            log_level: default_log_level(),
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            worker_timeout_ms: default_worker_timeout(),
            flush_every: default_flush_every(),
            max_frames: None,
            stop_policy: StopPolicy::default(),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            base_name: default_base_name(),
            file_type: default_file_type(),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file yields
    /// the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> std::result::Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("UEYE_DAQ_").split("__"))
            .extract()
    }

    /// Parse from TOML text, without environment overrides.
    pub fn from_toml_str(toml: &str) -> std::result::Result<Self, figment::Error> {
        Figment::new().merge(Toml::string(toml)).extract()
    }

    /// Load and validate, mapping failures to [`CameraError`].
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = Self::load_from(path)?;
        settings.validate().map_err(CameraError::Configuration)?;
        Ok(settings)
    }

    /// Check semantic constraints not expressed by the types.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !VALID_LOG_LEVELS.contains(&self.camera.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.camera.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        if self.camera.buffer_count == 0 {
            return Err("buffer_count must be at least 1".to_string());
        }

        if self.acquisition.flush_every == 0 {
            return Err("flush_every must be at least 1".to_string());
        }

        let file_type = self.output.file_type.to_lowercase();
        if file_type == CUBE_FILE_TYPE {
            if self.acquisition.max_frames.unwrap_or(0) == 0 {
                return Err("Cube output requires acquisition.max_frames > 0".to_string());
            }
            match self.cube.aoi {
                None => return Err("Cube output requires cube.aoi".to_string()),
                Some([_, _, width, height]) if width == 0 || height == 0 => {
                    return Err(format!("Cube AOI must be non-empty, got {width}x{height}"));
                }
                Some(_) => {}
            }
        } else if !SUPPORTED_EXTENSIONS.contains(&file_type.as_str()) {
            return Err(format!(
                "Invalid file_type '{}'. Must be one of: {}, {}",
                self.output.file_type,
                SUPPORTED_EXTENSIONS.join(", "),
                CUBE_FILE_TYPE
            ));
        }

        Ok(())
    }

    /// Effective settings rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CameraError::Configuration(format!("cannot render settings: {e}")))
    }

    /// Whether output goes to an ENVI cube.
    pub fn is_cube(&self) -> bool {
        self.output.file_type.eq_ignore_ascii_case(CUBE_FILE_TYPE)
    }

    /// Cube AOI as a rectangle.
    pub fn cube_aoi(&self) -> Option<Rect> {
        self.cube
            .aoi
            .map(|[x, y, width, height]| Rect::new(x, y, width, height))
    }

    /// Stop condition for bounded capture.
    pub fn stop_condition(&self) -> StopCondition {
        StopCondition::new(self.acquisition.max_frames, self.acquisition.stop_policy)
    }
}
