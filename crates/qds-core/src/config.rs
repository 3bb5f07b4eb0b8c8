use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use qds_crypto::{KeyType, CIRCLE_KEY_COUNT};

use crate::error::{QdsError, QdsResult};

/// Default location of the config file, relative to `$HOME`.
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/qds/config.toml";

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QdsConfig {
    pub keys: KeysConfig,
    pub container: ContainerConfig,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Key bundle loaded when no `--bundle` is given
    pub bundle: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Sender number written into header byte 1
    pub user_number: u8,
    /// Key tier used when encrypting without `--circle`/`--session`
    pub default_key: KeyType,
    /// Circle key slot used by default (0..10)
    pub circle_index: u8,
    /// Where decrypted files land (default: next to the artifact)
    pub output_dir: Option<PathBuf>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            user_number: 0,
            default_key: KeyType::Circle,
            circle_index: 0,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Bytes between cancellation checks, in KiB (default: 64)
    pub chunk_size_kib: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { chunk_size_kib: 64 }
    }
}

impl WorkerConfig {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size_kib.max(1) * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl QdsConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> QdsResult<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| QdsError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QdsResult<()> {
        if usize::from(self.container.circle_index) >= CIRCLE_KEY_COUNT {
            return Err(QdsError::Config(format!(
                "container.circle_index {} out of range (0..{CIRCLE_KEY_COUNT})",
                self.container.circle_index
            )));
        }
        if !matches!(self.log.format.as_str(), "json" | "text") {
            return Err(QdsError::Config(format!(
                "log.format must be \"json\" or \"text\", got \"{}\"",
                self.log.format
            )));
        }
        Ok(())
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}
