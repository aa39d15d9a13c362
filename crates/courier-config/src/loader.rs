//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths.
const CONFIG_PATHS: &[&str] = &[
    "courier.toml",
    "./config/courier.toml",
    "/etc/courier/courier.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment overrides.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("COURIER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("ADDRESS") {
            config.http.address = val;
        }
        if let Ok(val) = env::var("PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("DB") {
            config.db.url = val;
        }
        if let Ok(val) = env::var("DB_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.db.max_connections = n;
            }
        }
        if let Ok(val) = env::var("REDIS") {
            config.redis.url = val;
        }
        if let Ok(val) = env::var("SPOOL_DIR") {
            config.spool.dir = val;
        }
        if let Ok(val) = env::var("DOMAIN") {
            config.domain = val;
        }
        if let Ok(val) = env::var("STORAGE_URL") {
            config.storage_url = val;
        }
        if let Ok(val) = env::var("MAX_WORKERS") {
            if let Ok(n) = val.parse() {
                config.sender.max_workers = n;
            }
        }
        if let Ok(val) = env::var("DEFAULT_SEND_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                config.sender.default_send_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("BATCH_TIMEOUT") {
            if let Ok(ms) = val.parse() {
                config.batch.timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("BATCH_CAPACITY") {
            if let Ok(n) = val.parse() {
                config.batch.capacity = n;
            }
        }
        if let Ok(val) = env::var("STARTUP_GRACE") {
            if let Ok(secs) = val.parse() {
                config.startup_grace_secs = secs;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
