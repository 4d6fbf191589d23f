//! Process-wide configuration
//!
//! Loaded once at startup from an optional TOML file, then overridden by
//! environment variables for the secret-bearing keys. The snapshot is
//! immutable for the lifetime of the process.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::resolver::{DEFAULT_API_URL, DEFAULT_MODEL};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Credential for the LLM endpoint; resolution is disabled without it.
    #[serde(default)]
    pub api_key: String,

    /// Chat-completions endpoint (OpenAI-compatible).
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Judge model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Path of the persisted mapping file.
    #[serde(default = "default_cache_file")]
    pub cache_file: String,

    /// Compose project name whose containers are hidden from the judge
    /// (so the proxy never routes to its own stack).
    #[serde(default)]
    pub own_project: Option<String>,

    /// Hostname reserved for the dashboard.
    #[serde(default = "default_debug_host")]
    pub debug_host: String,

    /// Suffix a domain must carry to pass the admission check.
    #[serde(default = "default_admission_suffix")]
    pub admission_suffix: String,

    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_snapshot_ttl")]
    pub process_snapshot_ttl_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_cache_file() -> String {
    "/data/mappings.json".to_string()
}

fn default_debug_host() -> String {
    "proxy.localhost".to_string()
}

fn default_admission_suffix() -> String {
    ".localhost".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:80".to_string()
}

fn default_snapshot_ttl() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_llm_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config uses defaults")
    }
}

impl Config {
    /// Load from a TOML file (missing file = defaults), then apply
    /// environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables win over the file for deploy-sensitive keys.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SEERGATE_API_KEY") {
            self.api_key = v;
        }
        if let Ok(v) = std::env::var("SEERGATE_API_URL") {
            self.api_url = v;
        }
        if let Ok(v) = std::env::var("SEERGATE_MODEL") {
            self.model = v;
        }
        if let Ok(v) = std::env::var("SEERGATE_CACHE_FILE") {
            self.cache_file = v;
        }
        if let Ok(v) = std::env::var("SEERGATE_OWN_PROJECT") {
            self.own_project = Some(v);
        }
    }

    pub fn process_snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.process_snapshot_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.cache_file, "/data/mappings.json");
        assert_eq!(config.debug_host, "proxy.localhost");
        assert_eq!(config.admission_suffix, ".localhost");
        assert_eq!(config.process_snapshot_ttl(), Duration::from_secs(5));
        assert_eq!(config.probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.llm_timeout(), Duration::from_secs(30));
        assert!(config.api_key.is_empty());
        assert!(config.own_project.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
api_key = "sk-test"
model = "some/model"
cache_file = "/tmp/m.json"
own_project = "seergate"
listen = "0.0.0.0:8888"
llm_timeout_secs = 10
"#,
        )
        .unwrap();
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.model, "some/model");
        assert_eq!(config.cache_file, "/tmp/m.json");
        assert_eq!(config.own_project.as_deref(), Some("seergate"));
        assert_eq!(config.listen, "0.0.0.0:8888");
        assert_eq!(config.llm_timeout(), Duration::from_secs(10));
        // Untouched keys keep their defaults.
        assert_eq!(config.admission_suffix, ".localhost");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.debug_host, "proxy.localhost");
    }
}
