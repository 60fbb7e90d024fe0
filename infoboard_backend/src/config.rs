use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::watcher::WatchTiming;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Address the proxy and control API listen on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Agent backend that intercepted traffic is forwarded to.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// JSONL chat log to watch instead of a pushed transcript.
    #[serde(default)]
    pub chat_log_path: Option<String>,

    #[serde(default = "default_identity_poll_ms")]
    pub identity_poll_ms: u64,

    #[serde(default = "default_frame_ms")]
    pub frame_ms: u64,

    #[serde(default = "default_chat_log_poll_ms")]
    pub chat_log_poll_ms: u64,

    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8788".to_string()
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_store_path() -> String {
    let base = dirs::data_dir()
        .map(|dir| dir.join("infoboard"))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("infoboard_store.db").to_string_lossy().into_owned()
}

fn default_identity_poll_ms() -> u64 {
    600
}

fn default_frame_ms() -> u64 {
    16
}

fn default_chat_log_poll_ms() -> u64 {
    500
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            upstream_url: default_upstream_url(),
            store_path: default_store_path(),
            chat_log_path: None,
            identity_poll_ms: default_identity_poll_ms(),
            frame_ms: default_frame_ms(),
            chat_log_poll_ms: default_chat_log_poll_ms(),
            request_timeout_secs: None,
        }
    }
}

impl BoardConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `infoboard_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("infoboard_config.toml")
    }

    /// Config file when present and valid, otherwise defaults. Environment
    /// overrides apply either way.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<BoardConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::default()
            }
        };

        config.apply_overrides(|name| env::var(name).ok());
        config
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("INFOBOARD_BIND") {
            self.bind_addr = bind;
        }

        if let Some(url) = lookup("INFOBOARD_UPSTREAM_URL") {
            self.upstream_url = url;
        }

        if let Some(path) = lookup("INFOBOARD_STORE_PATH") {
            self.store_path = path;
        }

        if let Some(path) = lookup("INFOBOARD_CHAT_LOG") {
            self.chat_log_path = Some(path).filter(|p| !p.trim().is_empty());
        }

        if let Some(interval) = lookup("INFOBOARD_IDENTITY_POLL_MS") {
            if let Ok(ms) = interval.parse() {
                self.identity_poll_ms = ms;
            }
        }

        if let Some(frame) = lookup("INFOBOARD_FRAME_MS") {
            if let Ok(ms) = frame.parse() {
                self.frame_ms = ms;
            }
        }
    }

    pub fn watch_timing(&self) -> WatchTiming {
        WatchTiming {
            frame: Duration::from_millis(self.frame_ms),
            identity_poll: Duration::from_millis(self.identity_poll_ms.max(1)),
        }
    }

    pub fn chat_log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.chat_log_poll_ms.max(1))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: BoardConfig = toml::from_str(
            r#"
upstream_url = "http://10.0.0.2:5000"
chat_log_path = "/tmp/chat.jsonl"
"#,
        )
        .unwrap();
        assert_eq!(config.upstream_url, "http://10.0.0.2:5000");
        assert_eq!(config.chat_log_path.as_deref(), Some("/tmp/chat.jsonl"));
        assert_eq!(config.bind_addr, "127.0.0.1:8788");
        assert_eq!(config.identity_poll_ms, 600);
        assert_eq!(config.frame_ms, 16);
        assert!(config.store_path.ends_with("infoboard_store.db"));
    }

    #[test]
    fn overrides_replace_values_and_skip_garbage() {
        let vars: HashMap<&str, &str> = [
            ("INFOBOARD_BIND", "0.0.0.0:9000"),
            ("INFOBOARD_IDENTITY_POLL_MS", "250"),
            ("INFOBOARD_FRAME_MS", "soon"),
            ("INFOBOARD_CHAT_LOG", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = BoardConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.identity_poll_ms, 250);
        assert_eq!(config.frame_ms, 16);
        assert!(config.chat_log_path.is_none());
        assert_eq!(
            config.watch_timing().identity_poll,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn config_survives_toml_round_trip() {
        let config = BoardConfig {
            request_timeout_secs: Some(30),
            ..BoardConfig::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: BoardConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.request_timeout(), Some(Duration::from_secs(30)));
    }
}
