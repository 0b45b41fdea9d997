use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "inbox_config.json";

const DEFAULT_USERNAME_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_TEARDOWN_CONCURRENCY: usize = 4;
const DEFAULT_STATE_EVENT_CAPACITY: usize = 64;

/// Optional overrides read from `<data_dir>/inbox_config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backend_url: Option<String>,
    #[serde(default)]
    pub username_max_attempts: Option<u32>,
    #[serde(default)]
    pub teardown_concurrency: Option<usize>,
    #[serde(default)]
    pub state_event_capacity: Option<usize>,
    #[serde(default)]
    pub prepare_unused_inbox: Option<bool>,
}

impl AppConfig {
    /// `INBOX_BACKEND_URL` wins over the file.
    pub fn backend_url(&self) -> Option<String> {
        if let Ok(url) = std::env::var("INBOX_BACKEND_URL") {
            let url = url.trim();
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
        self.backend_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }

    pub fn username_max_attempts(&self) -> u32 {
        self.username_max_attempts
            .unwrap_or(DEFAULT_USERNAME_MAX_ATTEMPTS)
            .max(1)
    }

    pub fn teardown_concurrency(&self) -> usize {
        self.teardown_concurrency
            .unwrap_or(DEFAULT_TEARDOWN_CONCURRENCY)
            .max(1)
    }

    pub fn state_event_capacity(&self) -> usize {
        self.state_event_capacity
            .unwrap_or(DEFAULT_STATE_EVENT_CAPACITY)
            .max(1)
    }

    pub fn prepare_unused_inbox(&self) -> bool {
        self.prepare_unused_inbox.unwrap_or(false)
    }
}

/// Missing or unreadable config falls back to defaults.
pub fn load_app_config(data_dir: &Path) -> AppConfig {
    let path = data_dir.join(CONFIG_FILE_NAME);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return AppConfig::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "failed to read app config");
            return AppConfig::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "invalid app config; using defaults");
            AppConfig::default()
        }
    }
}

pub fn write_app_config(data_dir: &Path, config: &AppConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let path = data_dir.join(CONFIG_FILE_NAME);
    let json = serde_json::to_vec_pretty(config).context("serialize app config")?;
    std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
