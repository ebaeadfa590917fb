//! Kit types: named bundles of server configurations.
//!
//! A kit file is JSON with metadata plus a `servers` mapping shaped like the
//! catalog's, minus the `kits` field (ownership is recorded in the catalog,
//! never in kit files).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::ServerConfig;

/// Errors from kit file handling.
#[derive(Debug, Error)]
pub enum KitError {
    #[error("failed to read kit {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid kit file {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("kit {0:?} not found")]
    NotFound(String),

    #[error("kit {0:?} is already loaded")]
    AlreadyLoaded(String),

    #[error("kit {0:?} is not loaded")]
    NotLoaded(String),
}

/// A kit definition as parsed from `<kit-dir>/<name>.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KitConfig {
    /// Unique kit name; defaults to the file stem when absent.
    #[serde(default)]
    pub name: String,

    /// What this kit provides.
    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    /// Related links (homepage, docs, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, String>,

    /// Servers this kit contributes, keyed by name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl KitConfig {
    /// Parse a kit file. The kit name defaults to the file stem; server
    /// names are filled from map keys and any stray `kits` ownership in
    /// the file is discarded.
    pub fn load(path: &Path) -> Result<Self, KitError> {
        let text = fs::read_to_string(path).map_err(|source| KitError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut kit: Self = serde_json::from_str(&text).map_err(|e| KitError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if kit.name.is_empty() {
            kit.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }

        for (name, server) in &mut kit.servers {
            server.name.clone_from(name);
            server.kits.clear();
        }

        Ok(kit)
    }
}

/// Record of a loaded kit, stored in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KitInfo {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Path the kit was loaded from, when file-based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Where the kit came from: `file` or `memory`.
    #[serde(default)]
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kit_name_defaults_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web-tools.json");
        fs::write(
            &path,
            r#"{"description": "web things", "servers": {"fetch": {"command": "npx"}}}"#,
        )
        .unwrap();

        let kit = KitConfig::load(&path).unwrap();
        assert_eq!(kit.name, "web-tools");
        assert_eq!(kit.servers["fetch"].name, "fetch");
    }

    #[test]
    fn kit_strips_ownership_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.json");
        fs::write(
            &path,
            r#"{"servers": {"s": {"command": "echo", "kits": ["other"]}}}"#,
        )
        .unwrap();

        let kit = KitConfig::load(&path).unwrap();
        assert!(kit.servers["s"].kits.is_empty());
    }

    #[test]
    fn malformed_kit_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            KitConfig::load(&path),
            Err(KitError::Invalid { .. })
        ));
    }
}
