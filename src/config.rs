use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const APP_DIR: &str = "keepr";

fn default_autosave_delay_ms() -> u64 {
    1000
}

fn default_trash_retention_days() -> i64 {
    7
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_cache_stale_secs() -> u64 {
    5 * 60
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct KeeprConfig {
    /// Base URL of the hosted backend, e.g. `https://xyz.supabase.co`.
    pub backend_url: String,
    /// Public (anon) API key sent with every request.
    pub anon_key: String,
    pub autosave_delay_ms: u64,
    pub trash_retention_days: i64,
    pub request_timeout_secs: u64,
    /// How long cached query results are served without refetching.
    pub cache_stale_secs: u64,
    /// Where confirmation links in sign-up emails point.
    pub signup_redirect: Option<String>,
    pub debug_logging: bool,
}

impl Default for KeeprConfig {
    fn default() -> Self {
        Self {
            backend_url: String::new(),
            anon_key: String::new(),
            autosave_delay_ms: default_autosave_delay_ms(),
            trash_retention_days: default_trash_retention_days(),
            request_timeout_secs: default_request_timeout_secs(),
            cache_stale_secs: default_cache_stale_secs(),
            signup_redirect: None,
            debug_logging: false,
        }
    }
}

impl KeeprConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::default_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("KEEPR_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(key) = var("KEEPR_ANON_KEY") {
            self.anon_key = key;
        }
    }

    /// Backend settings are present.
    pub fn validate(&self) -> Result<()> {
        if self.backend_url.trim().is_empty() {
            return Err(Error::Config("backend_url is not set".into()));
        }
        if self.anon_key.trim().is_empty() {
            return Err(Error::Config("anon_key is not set".into()));
        }
        if self.trash_retention_days < 1 {
            return Err(Error::Config("trash_retention_days must be at least 1".into()));
        }
        Ok(())
    }

    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_stale_after(&self) -> Duration {
        Duration::from_secs(self.cache_stale_secs)
    }

    pub fn trash_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.trash_retention_days)
    }
}
