//! Configuration types shared across crates.

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment variables that override configuration values.
pub const ENV_PREFIX: &str = "TUSK_";

/// Upload engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of every committed part except the last, in bytes.
    /// Must not be below the backend's minimum part size.
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// Largest upload length accepted at creation (unbounded when unset).
    #[serde(default)]
    pub max_upload_size: Option<u64>,
    /// Capacity of the lifecycle event channel. Slow subscribers that fall
    /// further behind than this miss events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_part_size() -> u64 {
    crate::DEFAULT_PART_SIZE
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            max_upload_size: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// Validate engine settings against the backend's minimum part size.
    pub fn validate(&self, min_part_size: u64) -> Result<(), String> {
        if self.part_size < min_part_size {
            return Err(format!(
                "engine.part_size {} is below the backend minimum of {} bytes",
                self.part_size, min_part_size
            ));
        }
        if self.part_size > crate::MAX_PART_SIZE {
            return Err(format!(
                "engine.part_size {} exceeds the maximum part size of {} bytes",
                self.part_size,
                crate::MAX_PART_SIZE
            ));
        }
        if self.event_capacity == 0 {
            return Err("engine.event_capacity cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-process storage; contents are lost on restart. For development and tests.
    Memory {
        /// Minimum size of non-final parts enforced at completion.
        #[serde(default = "default_part_size")]
        min_part_size: u64,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix for uploads and their sidecars.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if unset.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient credential chain if unset.
        secret_access_key: Option<String>,
        /// Use path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory {
            min_part_size: default_part_size(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a bucket name".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Memory { min_part_size } => {
                if *min_part_size == 0 {
                    Err("memory storage min_part_size cannot be 0".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Upload engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Load configuration from an optional TOML file, overridden by
    /// `TUSK_`-prefixed environment variables (`__` separates nesting levels,
    /// e.g. `TUSK_ENGINE__PART_SIZE`).
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(crate::Error::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: AppConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| crate::Error::Config(e.to_string()))?;

        config.storage.validate().map_err(crate::Error::Config)?;
        Ok(config)
    }
}
