//! Per-directory settings persistence for Shardview
//!
//! Settings are stored as `shardview.toml` in the fragment directory (or the
//! directory passed with `--config`). They hold the backend address and the
//! inference defaults; command line flags override them.

use serde::{Deserialize, Serialize};
use shardview_network::{ClientConfig, InferenceSettings, SampleStrategy};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Filename used for per-directory settings
pub const SETTINGS_FILENAME: &str = "shardview.toml";

/// Backend used when neither the settings file nor the CLI names one
pub const DEFAULT_BACKEND_ADDRESS: &str = "127.0.0.1:9877";

/// Where and how to reach the inference backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// `host:port` of the backend
    pub address: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    /// Give up on a silent backend after this many seconds; unset waits forever
    pub read_timeout_secs: Option<u64>,
}

impl BackendSettings {
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(DEFAULT_BACKEND_ADDRESS)
    }

    pub fn client_config(&self) -> ClientConfig {
        let defaults = ClientConfig::default();
        ClientConfig {
            connect_timeout: self
                .connect_timeout_secs
                .map(Duration::from_secs)
                .or(defaults.connect_timeout),
            read_timeout: self.read_timeout_secs.map(Duration::from_secs),
            ..defaults
        }
    }
}

/// Stored defaults for the inference settings form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceDefaults {
    pub sample_points: Option<u32>,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
    pub max_iterations: Option<u32>,
    pub one_step_init: Option<bool>,
    pub sample_strategy: Option<SampleStrategy>,
    pub lora_checkpoint: Option<String>,
    pub ckpt: Option<String>,
    pub data_collection: Option<bool>,
}

impl InferenceDefaults {
    /// Overwrite every field that is set here
    pub fn apply_to(&self, settings: &mut InferenceSettings) {
        if let Some(v) = self.sample_points {
            settings.sample_points = v;
        }
        if let Some(v) = self.steps {
            settings.steps = v;
        }
        if let Some(v) = self.seed {
            settings.seed = v;
        }
        if let Some(v) = self.max_iterations {
            settings.max_iterations = v;
        }
        if let Some(v) = self.one_step_init {
            settings.one_step_init = v;
        }
        if let Some(v) = self.sample_strategy {
            settings.sample_strategy = v;
        }
        if let Some(v) = &self.lora_checkpoint {
            settings.lora_checkpoint = Some(v.clone());
        }
        if let Some(v) = &self.ckpt {
            settings.ckpt = Some(v.clone());
        }
        if let Some(v) = self.data_collection {
            settings.data_collection = v;
        }
    }

    /// Capture a full settings value
    pub fn from_settings(settings: &InferenceSettings) -> Self {
        Self {
            sample_points: Some(settings.sample_points),
            steps: Some(settings.steps),
            seed: Some(settings.seed),
            max_iterations: Some(settings.max_iterations),
            one_step_init: Some(settings.one_step_init),
            sample_strategy: Some(settings.sample_strategy),
            lora_checkpoint: settings.lora_checkpoint.clone(),
            ckpt: settings.ckpt.clone(),
            data_collection: Some(settings.data_collection),
        }
    }
}

/// Top-level settings struct, serialized as shardview.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    pub backend: Option<BackendSettings>,
    pub inference: Option<InferenceDefaults>,
}

impl Settings {
    /// Load settings from a shardview.toml file in the given directory.
    /// Returns Ok(None) if the file doesn't exist.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>, SettingsError> {
        let path = dir.join(SETTINGS_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| SettingsError::Io {
            path: path.clone(),
            source: e,
        })?;
        let settings: Settings =
            toml::from_str(&contents).map_err(|e| SettingsError::ParseToml {
                path: path.clone(),
                source: e,
            })?;
        info!("Loaded settings from {:?}", path);
        Ok(Some(settings))
    }

    /// Save settings to shardview.toml in the given directory.
    /// Merges with existing file if present (preserves unknown keys).
    pub fn save_to_dir(&self, dir: &Path) -> Result<(), SettingsError> {
        let path = dir.join(SETTINGS_FILENAME);
        let serialize_error = |source| SettingsError::SerializeToml {
            path: path.clone(),
            source,
        };

        let ours = toml::to_string_pretty(self).map_err(serialize_error)?;
        let merged = if path.exists() {
            let existing = std::fs::read_to_string(&path).map_err(|e| SettingsError::Io {
                path: path.clone(),
                source: e,
            })?;
            let mut table: toml::Table = toml::from_str(&existing).unwrap_or_default();
            let our_table: toml::Table = toml::from_str(&ours).unwrap_or_default();

            // Merge one level deep so unknown keys inside known sections survive
            for (key, value) in our_table {
                if let (Some(toml::Value::Table(existing)), toml::Value::Table(section)) =
                    (table.get_mut(&key), &value)
                {
                    existing.extend(section.clone());
                    continue;
                }
                table.insert(key, value);
            }
            toml::to_string_pretty(&table).map_err(serialize_error)?
        } else {
            ours
        };

        std::fs::write(&path, merged).map_err(|e| SettingsError::Io {
            path: path.clone(),
            source: e,
        })?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn backend(&self) -> BackendSettings {
        self.backend.clone().unwrap_or_default()
    }

    /// Default inference settings with the stored overrides applied
    pub fn inference_settings(&self) -> InferenceSettings {
        let mut settings = InferenceSettings::default();
        if let Some(defaults) = &self.inference {
            defaults.apply_to(&mut settings);
        }
        settings
    }
}

/// Errors that can occur during settings operations
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize TOML for {path}: {source}")]
    SerializeToml {
        path: PathBuf,
        source: toml::ser::Error,
    },
}

/// Resolve the settings directory from a path argument.
/// If the path is a file, returns its parent directory.
/// If the path is a directory, returns it directly.
pub fn resolve_settings_dir(path: &Path) -> Option<PathBuf> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if canonical.is_dir() {
        Some(canonical)
    } else if canonical.is_file() {
        canonical.parent().map(|p| p.to_path_buf())
    } else {
        None
    }
}
