//! Loading and validation of the external configuration store.
//!
//! The store is two read-only inputs: a TOML file enumerating the backends
//! (url, served models, per-attempt timeout) and a line-oriented
//! `user:key` file enumerating authorized users. Both are re-read by the
//! snapshot refresher; this module only parses and validates, it holds no
//! state.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::Backend;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_PORT: u16 = 8000;

// Shared HTTP client tuning.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 50;

const MAX_URL_LEN: usize = 2048;

/// Paths to the two store files, as given on the command line.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub config: String,
    pub users: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    pub proxy: Option<ProxySection>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxySection {
    pub retry_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Display name; the URL is used when absent.
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub models: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// An immutable view of the configuration used coherently for the whole
/// duration of one request. Published by the refresher with an atomic
/// pointer swap; never mutated after construction.
#[derive(Debug)]
pub struct ConfigSnapshot {
    /// Ordered backend list. The first entry is the default backend for
    /// paths that do not require model selection.
    pub backends: Vec<Arc<Backend>>,
    pub users: HashMap<String, String>,
    /// Total tries per forward, including the first.
    pub retry_attempts: u32,
    pub security_disabled: bool,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            users: HashMap::new(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            security_disabled: false,
        }
    }
}

impl ConfigSnapshot {
    /// Backends that can serve `model`, in snapshot order.
    pub fn candidates_for(&self, model: &str) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.serves(model))
            .cloned()
            .collect()
    }

    /// The first backend in the snapshot, used for all non-model paths.
    pub fn default_backend(&self) -> Option<Arc<Backend>> {
        self.backends.first().cloned()
    }
}

/// Parses the TOML backend table. A missing file yields an empty store so
/// the proxy can start before the store is provisioned; a malformed file
/// is an error and leaves the previous snapshot in place.
pub fn try_load_store(path: &str) -> Result<StoreConfig, ConfigError> {
    match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<StoreConfig>(&raw)
            .map_err(|e| ConfigError::Invalid(format!("failed to parse {}: {}", path, e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path, "No backend store file found, starting empty");
            Ok(StoreConfig::default())
        }
        Err(e) => Err(ConfigError::Io {
            path: path.to_string(),
            source: e,
        }),
    }
}

/// Reads the `user:key` file. Blank lines are skipped; lines without a
/// colon are reported and skipped so one broken entry cannot lock every
/// user out.
pub fn load_authorized_users(path: &str) -> Result<HashMap<String, String>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_string(),
        source: e,
    })?;

    let mut users = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((user, key)) if !user.is_empty() => {
                users.insert(user.to_string(), key.to_string());
            }
            _ => warn!(entry = %line, "Skipping broken user entry"),
        }
    }
    Ok(users)
}

/// Validates and canonicalizes the raw backend table: URLs are trimmed,
/// scheme-checked, stripped of trailing slashes, and deduplicated by name.
/// Invalid entries are skipped with a warning rather than failing the whole
/// table. An empty result is legal; the dispatcher answers 503 until the
/// store has usable backends.
pub fn validate_backends(raw: Vec<BackendConfig>) -> Vec<Backend> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|entry| {
            let mut url = entry.url.trim().to_string();

            if url.is_empty() {
                warn!("Skipping backend with empty URL");
                return None;
            }
            let lowered = url.to_lowercase();
            if !lowered.starts_with("http://") && !lowered.starts_with("https://") {
                warn!(url = %url, "Skipping backend with unsupported URL scheme");
                return None;
            }
            if url.len() > MAX_URL_LEN {
                warn!(url = %url, "Skipping backend with oversized URL");
                return None;
            }
            if url.chars().any(|c| c.is_control() || c.is_whitespace()) {
                warn!(url = %url, "Skipping backend URL with invalid characters");
                return None;
            }

            while url.ends_with('/') {
                url.pop();
            }

            let name = entry
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| url.clone());

            if !seen.insert(name.clone()) {
                warn!(name = %name, "Skipping duplicate backend");
                return None;
            }

            let models = entry
                .models
                .into_iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty());

            Some(Backend::new(
                name,
                url,
                models,
                entry
                    .timeout_secs
                    .unwrap_or(DEFAULT_BACKEND_TIMEOUT_SECS)
                    .max(1),
            ))
        })
        .collect()
}
