//! Daemon configuration.
//!
//! Loaded from a TOML file, with per-field serde defaults so a partial
//! file (or none at all) yields a runnable configuration. Secrets can be
//! supplied through environment variables instead of the file:
//! `LOGSINK_API_KEY`, `LOGSINK_EMBEDDING_API_KEY`, `LOGSINK_LLM_API_KEY`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SinkError;

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Persistent store settings.
    pub store: StoreConfig,
    /// Screenshot storage settings.
    pub storage: StorageConfig,
    /// Embedding provider and worker settings.
    pub embedding: EmbeddingConfig,
    /// Optional LLM used to refine near-duplicate scores.
    pub llm: LlmConfig,
    /// Cleanup scheduler settings.
    pub cleanup: CleanupConfig,
    /// Blacklist settings.
    pub blacklist: BlacklistConfig,
    /// CORS settings.
    pub cors: CorsConfig,
    /// Log filter directive, e.g. `info` or `logsink=debug`.
    pub log_level: LogLevel,
}

impl Config {
    /// Loads configuration from a TOML file and applies environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidInput`] if the file cannot be read or
    /// parsed.
    pub fn from_file(path: &Path) -> Result<Self, SinkError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SinkError::invalid(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Self = toml::from_str(&raw)
            .map_err(|e| SinkError::invalid(format!("cannot parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Builds the default configuration with environment overrides
    /// applied. Used when no config file exists.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies secret overrides from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("LOGSINK_API_KEY") {
            if !key.is_empty() {
                self.server.api_key = Some(key);
            }
        }
        if let Ok(key) = std::env::var("LOGSINK_EMBEDDING_API_KEY") {
            if !key.is_empty() {
                self.embedding.api_key = Some(key);
            }
        }
        if let Ok(key) = std::env::var("LOGSINK_LLM_API_KEY") {
            if !key.is_empty() {
                self.llm.api_key = Some(key);
            }
        }
    }
}

/// Log filter wrapper so the level serializes as a bare string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// Bind address.
    pub bind: String,
    /// API key required on authenticated routes; `None` disables auth.
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3100,
            bind: "0.0.0.0".to_string(),
            api_key: None,
        }
    }
}

/// Persistent store settings. The store is a single SQLite file; the
/// connection is serialized behind a mutex, which also provides the
/// per-row mutation ordering the lifecycle engine relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the SQLite database file.
    pub path: PathBuf,
    /// How long a writer waits on a locked database before failing.
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logsink.db"),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Screenshot storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding extracted screenshot files.
    pub images_dir: PathBuf,
    /// Maximum decoded image size in bytes.
    pub max_image_size: usize,
    /// Allowed image extensions (lowercase, no dot).
    pub allowed_image_types: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("images"),
            max_image_size: 10 * 1024 * 1024,
            allowed_image_types: ["png", "jpg", "jpeg", "gif", "webp"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Embedding provider and worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Whether embedding-based deduplication is enabled. When disabled,
    /// admitted issues start in `open` instead of `pending`.
    pub enabled: bool,
    /// Base URL of an OpenAI-compatible embeddings endpoint.
    pub endpoint: String,
    /// Model name sent to the provider.
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Cosine-similarity threshold at or above which a pending issue is
    /// merged into its nearest neighbor.
    pub similarity_threshold: f32,
    /// Per-request timeout for provider calls.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Interval between background worker ticks.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Maximum pending issues claimed per tick.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            similarity_threshold: 0.85,
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(120),
            batch_size: 20,
        }
    }
}

/// Optional LLM used by the cleanup scheduler to refine near-duplicate
/// scores that fall below the Levenshtein threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Whether LLM refinement is enabled.
    pub enabled: bool,
    /// Base URL of an OpenAI-compatible chat endpoint.
    pub endpoint: String,
    /// Model name sent to the provider.
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Token budget per scoring call.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Per-request timeout for provider calls.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            max_tokens: 64,
            temperature: 0.0,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Cleanup scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Whether the scheduler runs on its cron schedule. The explicit
    /// trigger endpoint works either way.
    pub enabled: bool,
    /// Cron expression for scheduled runs. Classic 5-field expressions
    /// are accepted and normalized.
    pub schedule: String,
    /// Text-similarity threshold at or above which two issues are
    /// reconciled as near-duplicates.
    pub duplicate_threshold: f64,
    /// Age past which closed issues are deleted.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Maximum issues examined per application per run.
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 2 * * *".to_string(),
            duplicate_threshold: 0.85,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            batch_size: 500,
        }
    }
}

/// Blacklist settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Whether admission consults the blacklist at all.
    pub enabled: bool,
    /// Whether adding or updating an application-scoped pattern closes
    /// existing issues whose message matches. Global patterns never
    /// auto-delete; scanning every application on each global mutation
    /// is unbounded work.
    pub auto_delete: bool,
    /// How long a cache snapshot is served before a rebuild.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_delete: false,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// CORS settings applied to every route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origin, `*` for any.
    pub origin: String,
    /// Allowed methods.
    pub methods: Vec<String>,
    /// Allowed request headers.
    pub headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origin: "*".to_string(),
            methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            headers: ["Content-Type", "X-API-Key", "Authorization"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_runnable() {
        let config = Config::default();
        assert_eq!(config.server.port, 3100);
        assert_eq!(config.embedding.batch_size, 20);
        assert!((config.embedding.similarity_threshold - 0.85).abs() < f32::EPSILON);
        assert_eq!(config.cleanup.schedule, "0 2 * * *");
        assert_eq!(config.storage.max_image_size, 10 * 1024 * 1024);
        assert_eq!(config.blacklist.cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8200

            [embedding]
            enabled = true
            model = "nomic-embed-text"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8200);
        assert!(config.embedding.enabled);
        assert_eq!(config.embedding.model, "nomic-embed-text");
        // Untouched sections keep their defaults.
        assert_eq!(config.cleanup.duplicate_threshold, 0.85);
        assert_eq!(config.storage.allowed_image_types.len(), 5);
    }

    #[test]
    fn test_durations_parse_humantime() {
        let config: Config = toml::from_str(
            r#"
            [embedding]
            interval = "5m"
            timeout = "10s"

            [cleanup]
            max_age = "7d"
            "#,
        )
        .unwrap();

        assert_eq!(config.embedding.interval, Duration::from_secs(300));
        assert_eq!(config.embedding.timeout, Duration::from_secs(10));
        assert_eq!(config.cleanup.max_age, Duration::from_secs(7 * 24 * 3600));
    }
}
