//! Process configuration (§A.3).
//!
//! Loaded from a TOML file and layered with environment variable overrides,
//! the same `<FILE> then env::var("X").unwrap_or_else(...)` convention
//! `main.rs` uses for `PORT`/`CORS_ORIGINS`/`BACKEND_MODE`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Relational,
    Streaming,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationalConfig {
    pub dsn: String,
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
}

fn default_drain_interval_secs() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    pub url: String,
    pub secret: String,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
}

fn default_ack_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    pub output_dir: PathBuf,
    pub upload: Option<UploadConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub backend: BackendKind,
    pub relational: Option<RelationalConfig>,
    pub streaming: Option<StreamingConfig>,
    pub memory: Option<MemoryConfig>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub extension_version: String,
    #[serde(default)]
    pub extension_build: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_file() -> PathBuf {
    PathBuf::from("mission-recorder-status.json")
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies the same `env::var(...).unwrap_or_else(|_| existing)` layering
    /// `main.rs` uses for its own startup knobs.
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("MISSION_RECORDER_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(status_file) = std::env::var("MISSION_RECORDER_STATUS_FILE") {
            self.status_file = PathBuf::from(status_file);
        }
        if let Ok(backend) = std::env::var("MISSION_RECORDER_BACKEND") {
            self.backend = match backend.to_ascii_lowercase().as_str() {
                "relational" => BackendKind::Relational,
                "streaming" => BackendKind::Streaming,
                "memory" => BackendKind::Memory,
                _ => self.backend,
            };
        }
        if let (Some(relational), Ok(dsn)) = (self.relational.as_mut(), std::env::var("MISSION_RECORDER_DSN")) {
            relational.dsn = dsn;
        }
        if let (Some(streaming), Ok(url)) = (self.streaming.as_mut(), std::env::var("MISSION_RECORDER_STREAM_URL")) {
            streaming.url = url;
        }
        if let (Some(streaming), Ok(secret)) = (self.streaming.as_mut(), std::env::var("MISSION_RECORDER_STREAM_SECRET")) {
            streaming.secret = secret;
        }
    }

    pub fn relational_drain_interval(&self) -> Duration {
        Duration::from_secs(
            self.relational
                .as_ref()
                .map(|r| r.drain_interval_secs)
                .unwrap_or_else(default_drain_interval_secs),
        )
    }

    pub fn streaming_ack_timeout(&self) -> Duration {
        Duration::from_secs(
            self.streaming
                .as_ref()
                .map(|s| s.ack_timeout_secs)
                .unwrap_or_else(default_ack_timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_memory_backend_config() {
        let toml_text = r#"
            backend = "memory"
            tag = "test-server"

            [memory]
            output_dir = "/tmp/missions"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.memory.unwrap().output_dir, PathBuf::from("/tmp/missions"));
    }

    #[test]
    fn relational_drain_interval_falls_back_to_default() {
        let config = Config {
            backend: BackendKind::Relational,
            relational: Some(RelationalConfig { dsn: "postgres://x".into(), drain_interval_secs: 5 }),
            streaming: None,
            memory: None,
            log_level: default_log_level(),
            status_file: default_status_file(),
            tag: String::new(),
            extension_version: String::new(),
            extension_build: String::new(),
        };
        assert_eq!(config.relational_drain_interval(), Duration::from_secs(5));
    }
}
