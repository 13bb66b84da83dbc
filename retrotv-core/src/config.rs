use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub streaming: StreamingConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding per-channel lineup documents and channel rows
    pub data_dir: PathBuf,
    /// Bounded attempts to repair an invalid lineup by merging defaults
    pub max_repair_passes: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".retrotv"),
            max_repair_passes: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub ffmpeg_path: String,
    /// Root the catalog's program ids resolve under
    pub media_root: PathBuf,
    /// Per-session working directories are created under here
    pub session_dir: PathBuf,
    /// Seconds without a heartbeat before a connection counts as dead
    pub heartbeat_timeout_seconds: u64,
    /// Reaper sweep interval in seconds
    pub reap_interval_seconds: u64,
    /// Seconds to wait for the first subprocess output before failing startup
    pub first_output_timeout_seconds: u64,
    /// HLS segments kept in the live manifest window
    pub hls_window_segments: usize,
    /// On-demand cursor checkpoint interval in seconds
    pub cursor_checkpoint_seconds: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            media_root: PathBuf::from("/media"),
            session_dir: PathBuf::from(".retrotv/sessions"),
            heartbeat_timeout_seconds: 30,
            reap_interval_seconds: 10,
            first_output_timeout_seconds: 20,
            hls_window_segments: 12,
            cursor_checkpoint_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Max concurrent schedule builds (CPU-bound work is offloaded here)
    pub worker_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (RETROTV_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("RETROTV")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.http_port, 8000);
        assert_eq!(config.streaming.heartbeat_timeout_seconds, 30);
        assert_eq!(config.storage.max_repair_passes, 2);
    }

    #[test]
    fn test_load_without_file() {
        let config = Config::load(None).expect("defaults should load");
        assert_eq!(config.scheduler.worker_threads, 2);
    }
}
