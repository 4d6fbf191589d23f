//! Persistent hostname → target mappings
//!
//! The store is the single source of truth for routing decisions. It keeps
//! all mappings in memory behind a read/write lock and mirrors every
//! mutation to a JSON file using a tmp-file + rename so a crash mid-write
//! never leaves a truncated file behind.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What a hostname routes to: a host-local process or a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Process,
    /// Accepts the legacy `"docker"` label on the wire for compatibility
    /// with mapping files written by earlier releases.
    #[serde(alias = "docker")]
    Container,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Process => "process",
            TargetKind::Container => "container",
        }
    }
}

/// Stable descriptor for re-finding a process after it restarts on a
/// different port. The port stored in the mapping is advisory when this
/// is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessIdentifier {
    pub workdir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_pattern: Option<String>,
}

/// A durable routing decision for one hostname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMapping {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    /// For processes an opaque label (usually `"localhost"` or a workdir);
    /// for containers the container name.
    pub target: String,
    pub port: u16,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub llm_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<ProcessIdentifier>,
}

/// Keys containing `:` are synthetic second-level entries
/// (`origin:service`), not real hostnames.
pub fn is_synthetic_key(key: &str) -> bool {
    key.contains(':')
}

/// Hostname → mapping store with atomic on-disk persistence.
pub struct MappingStore {
    path: PathBuf,
    mappings: RwLock<HashMap<String, RouteMapping>>,
}

impl MappingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mappings: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the mapping file. A missing file is an empty store; malformed
    /// JSON is an error so a corrupted file is never silently clobbered.
    pub fn load(&self) -> Result<()> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no mapping file, starting empty");
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        let parsed: HashMap<String, RouteMapping> = serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        let mut mappings = self.mappings.write();
        *mappings = parsed;
        debug!(count = mappings.len(), "loaded mappings");
        Ok(())
    }

    /// Serialize the current map and replace the file atomically.
    ///
    /// The in-memory state is authoritative by the time this runs; a disk
    /// error is returned so the caller can surface degraded persistence.
    pub fn save(&self) -> Result<()> {
        let data = {
            let mappings = self.mappings.read();
            serde_json::to_string_pretty(&*mappings).context("serializing mappings")?
        };

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    pub fn get(&self, host: &str) -> Option<RouteMapping> {
        self.mappings.read().get(host).cloned()
    }

    /// Defensive copy of the whole table.
    pub fn get_all(&self) -> HashMap<String, RouteMapping> {
        self.mappings.read().clone()
    }

    /// Copy of the table without synthetic `origin:service` keys. Anything
    /// that enumerates routable hostnames must go through this.
    pub fn real_routes(&self) -> HashMap<String, RouteMapping> {
        self.mappings
            .read()
            .iter()
            .filter(|(k, _)| !is_synthetic_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn set(&self, host: &str, mut mapping: RouteMapping) {
        if mapping.created_at.is_empty() {
            mapping.created_at = now_rfc3339();
        }
        self.mappings.write().insert(host.to_string(), mapping);
    }

    pub fn delete(&self, host: &str) {
        self.mappings.write().remove(host);
    }

    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.read().is_empty()
    }
}

/// Current time as an RFC 3339 UTC timestamp (seconds precision).
pub fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
