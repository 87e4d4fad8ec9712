//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Pulsebot configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path. Holds the config file and memory snapshots.
    pub data_dir: PathBuf,

    /// Display name the agent signs its own messages with.
    pub persona: String,

    /// Prefix that marks a privileged administrative command.
    pub command_prefix: String,

    /// Typing-delay pacing for outgoing messages.
    pub pacing: PacingConfig,

    /// Per-channel queue behavior.
    pub queue: QueueConfig,

    /// Snapshot persistence behavior.
    pub persistence: PersistenceConfig,

    /// Model endpoint settings for the OpenRouter adapter.
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            persona: "Alpha".into(),
            command_prefix: "!".into(),
            pacing: PacingConfig::default(),
            queue: QueueConfig::default(),
            persistence: PersistenceConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

/// Simulated typing pace for `send_message` actions.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Seconds of simulated typing per character of content.
    pub seconds_per_char: f64,

    /// Jitter amplitude: the delay is scaled by a factor drawn from
    /// `[1 - jitter, 1 + jitter]`. Zero disables jitter.
    pub jitter: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            seconds_per_char: 0.05,
            jitter: 0.25,
        }
    }
}

/// Channel queue behavior.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Seconds a channel worker waits on an empty queue before retiring.
    pub idle_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
        }
    }
}

/// Snapshot persistence behavior.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Write a backup snapshot every this many store mutations.
    pub backup_every: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { backup_every: 50 }
    }
}

/// Model endpoint settings for the reference OpenRouter adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    /// API key. `OPENROUTER_API_KEY` overrides the file value.
    pub api_key: Option<String>,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "deepseek/deepseek-chat".into(),
            base_url: "https://openrouter.ai/api/v1".into(),
            api_key: None,
            temperature: 0.4,
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PULSEBOT_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("pulsebot"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Config {
    /// Load configuration: defaults, then `config.toml` in the data dir if
    /// present, then environment overrides.
    pub fn load() -> Result<Self> {
        let data_dir = default_data_dir();
        Self::load_from_dir(&data_dir)
    }

    /// Load from an explicit data directory.
    pub fn load_from_dir(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|source| ConfigError::Load {
            path: data_dir.display().to_string(),
            source,
        })?;

        let path = data_dir.join("config.toml");
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Load {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            Config::default()
        };

        config.data_dir = data_dir.to_path_buf();
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            config.llm.api_key = Some(key);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pacing.seconds_per_char < 0.0 {
            return Err(ConfigError::Invalid("pacing.seconds_per_char must be >= 0".into()).into());
        }
        if !(0.0..1.0).contains(&self.pacing.jitter) {
            return Err(ConfigError::Invalid("pacing.jitter must be in [0, 1)".into()).into());
        }
        if self.queue.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("queue.idle_timeout_secs must be > 0".into()).into());
        }
        if self.persistence.backup_every == 0 {
            return Err(ConfigError::Invalid("persistence.backup_every must be > 0".into()).into());
        }
        Ok(())
    }

    /// Path of the primary memory snapshot.
    pub fn memory_path(&self) -> PathBuf {
        self.data_dir.join("memory.json")
    }

    /// Path of the periodic backup snapshot.
    pub fn backup_path(&self) -> PathBuf {
        self.data_dir.join("memory.backup.json")
    }
}
