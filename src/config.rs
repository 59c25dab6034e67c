// src/config.rs - Host configuration (TOML)
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level host configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub job: JobConfig,
}

/// Filesystem layout: where uploads live, where staged/cached copies go and
/// where the power-loss checkpoint record is written.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_gcodes_dir")]
    pub gcodes_dir: PathBuf,

    /// Volatile staging slot consumed by the job executor.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Durable cache slot kept for audit/re-extraction.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Fixed well-known path of the checkpoint record, absent between jobs.
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            gcodes_dir: default_gcodes_dir(),
            staging_dir: default_staging_dir(),
            cache_dir: default_cache_dir(),
            checkpoint_file: default_checkpoint_file(),
        }
    }
}

/// Streaming-loop tuning and the configurable G-code hooks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Read size for the streaming loop.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Rewrite the checkpoint record every N committed lines.
    #[serde(default = "default_checkpoint_every_lines")]
    pub checkpoint_every_lines: u64,

    /// Backoff while another producer holds the dispatch mutex.
    #[serde(default = "default_contention_backoff_ms")]
    pub contention_backoff_ms: u64,

    /// Optional verification script run once per staged file before the
    /// stream is entered.
    #[serde(default)]
    pub pre_check_gcode: Option<String>,

    /// Fallback sequence on dispatch failure. When unset, hosts with heaters
    /// get a safety shutdown and heaterless hosts a no-op.
    #[serde(default)]
    pub on_error_gcode: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            checkpoint_every_lines: default_checkpoint_every_lines(),
            contention_backoff_ms: default_contention_backoff_ms(),
            pre_check_gcode: None,
            on_error_gcode: None,
        }
    }
}

fn default_gcodes_dir() -> PathBuf {
    PathBuf::from("printer_data/gcodes")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("printer_data/.temp")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("printer_data/.cache")
}

fn default_checkpoint_file() -> PathBuf {
    PathBuf::from("printer_data/plr_record")
}

fn default_chunk_size() -> usize {
    8192
}

fn default_checkpoint_every_lines() -> u64 {
    50
}

fn default_contention_backoff_ms() -> u64 {
    100
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let config = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.job.chunk_size, 8192);
        assert_eq!(config.job.checkpoint_every_lines, 50);
        assert_eq!(config.job.contention_backoff_ms, 100);
        assert!(config.job.pre_check_gcode.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [job]
            checkpoint_every_lines = 10
            pre_check_gcode = "M4050"
            "#,
        )
        .unwrap();
        assert_eq!(config.job.checkpoint_every_lines, 10);
        assert_eq!(config.job.pre_check_gcode.as_deref(), Some("M4050"));
        assert_eq!(config.job.chunk_size, 8192);
        assert_eq!(
            config.paths.staging_dir,
            PathBuf::from("printer_data/.temp")
        );
    }
}
