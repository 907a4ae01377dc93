//! Process-wide configuration sourced from environment variables.
//!
//! Every tunable referenced across the service lives here. Values are read
//! once and cached behind [`config`]; components that need isolation in
//! tests take their settings explicitly instead of reaching for the cache.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::{env, time::Duration};

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub models_dir: String,
    pub bind_addr: String,
    pub cors_origins: Vec<String>,
    pub guardian_enabled: bool,
    pub guardian_check_interval_secs: u64,
    pub guardian_min_labels: u64,
    pub miner_interval_secs: u64,
    pub miner_window_hours: i64,
    pub ollama_url: String,
    pub ollama_model: String,
    pub ollama_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let database_path = resolve_data_path(env::var("DATABASE_PATH").ok(), "fraudlens.db");
        let models_dir = resolve_data_path(env::var("MODELS_DIR").ok(), "models");

        let host = env_or("BACKEND_HOST", "127.0.0.1");
        let port: u16 = env_parse("BACKEND_PORT", 8000u16);

        Self {
            database_path,
            models_dir,
            bind_addr: format!("{host}:{port}"),
            cors_origins: env_or("CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            guardian_enabled: env_flag("GUARDIAN_ENABLED", true),
            guardian_check_interval_secs: env_parse("GUARDIAN_CHECK_INTERVAL", 30u64),
            guardian_min_labels: env_parse("GUARDIAN_MIN_LABELS", 5u64),
            miner_interval_secs: env_parse("MINER_INTERVAL", 90u64),
            miner_window_hours: env_parse("MINER_WINDOW_HOURS", 24i64),
            ollama_url: env_or("OLLAMA_URL", "http://localhost:11434"),
            ollama_model: env_or("OLLAMA_MODEL", "llama3.1:8b"),
            ollama_timeout_secs: env_parse("OLLAMA_TIMEOUT", 30u64),
        }
    }

    pub fn ollama_timeout(&self) -> Duration {
        Duration::from_secs(self.ollama_timeout_secs)
    }
}

/// Cached accessor. First call reads the environment; later calls are free.
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(Config::from_env)
}

fn default_data_path(filename: &str) -> String {
    // Anchor defaults to the crate directory so running from elsewhere
    // doesn't create a fresh empty DB in an unexpected working directory.
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join(p)
        .to_string_lossy()
        .to_string()
}
