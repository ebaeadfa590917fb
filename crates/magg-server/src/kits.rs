//! Kit manager: discovery, loading and unloading of server bundles.
//!
//! Kits merge servers into the catalog with shared ownership: each server
//! records the kits that introduced it, and unloading a kit removes only
//! those servers whose ownership set becomes empty and that were not added
//! outside any kit. Load/unload of kits is serialized.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use std::sync::Mutex;

use magg_core::{Catalog, KitConfig, KitError, KitInfo};

/// Outcome of a kit load/unload, for admin tool responses.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KitChange {
    pub kit: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers_added: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers_updated: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers_removed: Vec<String>,
}

/// A kit's listing entry: metadata plus load status.
#[derive(Debug, Clone, Serialize)]
pub struct KitListing {
    pub name: String,
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    pub servers: Vec<String>,
}

/// Manages kit files under one or more `kit.d` directories.
pub struct KitManager {
    kitd_paths: Vec<PathBuf>,
    /// Serializes load/unload of kits.
    op_lock: Mutex<()>,
}

impl KitManager {
    #[must_use]
    pub fn new(kitd_paths: Vec<PathBuf>) -> Self {
        Self {
            kitd_paths,
            op_lock: Mutex::new(()),
        }
    }

    /// Discover kit files across all search paths. Earlier paths win on
    /// duplicate names.
    #[must_use]
    pub fn discover(&self) -> BTreeMap<String, PathBuf> {
        let mut kits = BTreeMap::new();
        for dir in &self.kitd_paths {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if kits.contains_key(name) {
                    tracing::warn!(kit = %name, path = %path.display(), "duplicate kit ignored");
                } else {
                    kits.insert(name.to_string(), path);
                }
            }
        }
        kits
    }

    /// Merge a kit into the catalog. Servers new to the catalog are added
    /// with this kit as owner; servers already present just gain the kit
    /// in their ownership set.
    pub fn load_kit(
        &self,
        kit_name: &str,
        catalog: &mut Catalog,
    ) -> Result<KitChange, KitError> {
        let _guard = self.op_lock.lock().expect("poisoned");

        if catalog.kits.contains_key(kit_name) {
            return Err(KitError::AlreadyLoaded(kit_name.to_string()));
        }

        let available = self.discover();
        let path = available
            .get(kit_name)
            .ok_or_else(|| KitError::NotFound(kit_name.to_string()))?;
        let kit = KitConfig::load(path)?;

        let mut change = KitChange {
            kit: kit_name.to_string(),
            ..KitChange::default()
        };

        for (server_name, kit_server) in &kit.servers {
            match catalog.servers.get_mut(server_name) {
                Some(existing) => {
                    // A server introduced outside kits keeps an empty
                    // ownership set and is never removed by kit unloads.
                    if !existing.kits.is_empty() && !existing.kits.iter().any(|k| k == kit_name) {
                        existing.kits.push(kit_name.to_string());
                        change.servers_updated.push(server_name.clone());
                    }
                }
                None => {
                    let mut server = kit_server.clone();
                    server.kits = vec![kit_name.to_string()];
                    catalog.upsert_server(server);
                    change.servers_added.push(server_name.clone());
                }
            }
        }

        catalog.kits.insert(
            kit_name.to_string(),
            KitInfo {
                name: kit_name.to_string(),
                description: kit.description.clone(),
                path: Some(path.display().to_string()),
                source: "file".to_string(),
            },
        );

        tracing::info!(
            kit = %kit_name,
            added = change.servers_added.len(),
            updated = change.servers_updated.len(),
            "kit loaded"
        );
        Ok(change)
    }

    /// Remove a kit from the catalog. A server leaves with the kit only if
    /// this was its last owner; servers introduced outside kits (empty
    /// ownership set) are never removed.
    pub fn unload_kit(
        &self,
        kit_name: &str,
        catalog: &mut Catalog,
    ) -> Result<KitChange, KitError> {
        let _guard = self.op_lock.lock().expect("poisoned");

        if !catalog.kits.contains_key(kit_name) {
            return Err(KitError::NotLoaded(kit_name.to_string()));
        }

        let mut change = KitChange {
            kit: kit_name.to_string(),
            ..KitChange::default()
        };

        let mut to_remove = Vec::new();
        for (server_name, server) in &mut catalog.servers {
            if !server.kits.iter().any(|k| k == kit_name) {
                continue;
            }
            if server.kits.len() == 1 {
                to_remove.push(server_name.clone());
            } else {
                server.kits.retain(|k| k != kit_name);
                change.servers_updated.push(server_name.clone());
            }
        }

        for server_name in to_remove {
            catalog.remove_server(&server_name);
            change.servers_removed.push(server_name);
        }

        catalog.kits.remove(kit_name);

        tracing::info!(
            kit = %kit_name,
            removed = change.servers_removed.len(),
            updated = change.servers_updated.len(),
            "kit unloaded"
        );
        Ok(change)
    }

    /// All kits: loaded ones from the catalog plus available-but-unloaded
    /// kit files with their metadata.
    #[must_use]
    pub fn list_kits(&self, catalog: &Catalog) -> Vec<KitListing> {
        let available = self.discover();
        let mut listings = Vec::new();

        for (name, info) in &catalog.kits {
            let servers = catalog
                .servers
                .values()
                .filter(|s| s.kits.iter().any(|k| k == name))
                .map(|s| s.name.clone())
                .collect();
            // Re-read the file for metadata the catalog does not carry.
            let meta = available.get(name).and_then(|p| KitConfig::load(p).ok());
            listings.push(KitListing {
                name: name.clone(),
                loaded: true,
                path: info.path.clone(),
                description: info.description.clone(),
                author: meta.as_ref().and_then(|k| k.author.clone()),
                version: meta.as_ref().and_then(|k| k.version.clone()),
                keywords: meta.map(|k| k.keywords).unwrap_or_default(),
                servers,
            });
        }

        for (name, path) in &available {
            if catalog.kits.contains_key(name) {
                continue;
            }
            match KitConfig::load(path) {
                Ok(kit) => listings.push(KitListing {
                    name: name.clone(),
                    loaded: false,
                    path: Some(path.display().to_string()),
                    description: kit.description,
                    author: kit.author,
                    version: kit.version,
                    keywords: kit.keywords,
                    servers: kit.servers.keys().cloned().collect(),
                }),
                Err(e) => {
                    tracing::warn!(kit = %name, error = %e, "unreadable kit file");
                }
            }
        }

        listings
    }

    /// Details for one kit, loaded or merely available.
    #[must_use]
    pub fn kit_info(&self, kit_name: &str, catalog: &Catalog) -> Option<serde_json::Value> {
        let loaded = catalog.kits.contains_key(kit_name);
        let available = self.discover();
        let path = available.get(kit_name);

        let kit = match path {
            Some(p) => KitConfig::load(p).ok()?,
            None if loaded => KitConfig {
                name: kit_name.to_string(),
                ..KitConfig::default()
            },
            None => return None,
        };

        let owned_servers: Vec<&str> = catalog
            .servers
            .values()
            .filter(|s| s.kits.iter().any(|k| k == kit_name))
            .map(|s| s.name.as_str())
            .collect();

        Some(serde_json::json!({
            "name": kit.name,
            "loaded": loaded,
            "path": path.map(|p| p.display().to_string()),
            "description": kit.description,
            "author": kit.author,
            "version": kit.version,
            "keywords": kit.keywords,
            "links": kit.links,
            "servers": kit.servers.keys().collect::<Vec<_>>(),
            "owned_servers": owned_servers,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn kit_dir_with(kits: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in kits {
            fs::write(dir.path().join(format!("{name}.json")), body).unwrap();
        }
        dir
    }

    const KIT_ONE: &str = r#"{"description": "k1", "servers": {"s": {"command": "echo"}}}"#;
    const KIT_TWO: &str = r#"{"description": "k2", "servers": {"s": {"command": "echo"}}}"#;

    #[test]
    fn shared_ownership_survives_partial_unload() {
        let dir = kit_dir_with(&[("k1", KIT_ONE), ("k2", KIT_TWO)]);
        let manager = KitManager::new(vec![dir.path().to_path_buf()]);
        let mut catalog = Catalog::default();

        let first = manager.load_kit("k1", &mut catalog).unwrap();
        assert_eq!(first.servers_added, vec!["s"]);

        let second = manager.load_kit("k2", &mut catalog).unwrap();
        assert_eq!(second.servers_updated, vec!["s"]);
        assert_eq!(catalog.servers["s"].kits, vec!["k1", "k2"]);

        // Unload k1: s survives, owned by k2 alone.
        let unload = manager.unload_kit("k1", &mut catalog).unwrap();
        assert!(unload.servers_removed.is_empty());
        assert_eq!(catalog.servers["s"].kits, vec!["k2"]);

        // Unload k2: s goes away.
        let unload = manager.unload_kit("k2", &mut catalog).unwrap();
        assert_eq!(unload.servers_removed, vec!["s"]);
        assert!(catalog.servers.is_empty());
        assert!(catalog.kits.is_empty());
    }

    #[test]
    fn server_added_outside_kits_is_never_removed() {
        let dir = kit_dir_with(&[("k1", KIT_ONE)]);
        let manager = KitManager::new(vec![dir.path().to_path_buf()]);

        let mut catalog = Catalog::default();
        // `s` exists before any kit: its ownership set stays empty, so no
        // kit unload can take it away.
        catalog.upsert_server(magg_core::ServerConfig::stdio("s", "echo"));

        manager.load_kit("k1", &mut catalog).unwrap();
        assert!(catalog.servers["s"].kits.is_empty());

        manager.unload_kit("k1", &mut catalog).unwrap();
        assert!(catalog.servers.contains_key("s"));
    }

    #[test]
    fn double_load_and_unknown_kit_fail() {
        let dir = kit_dir_with(&[("k1", KIT_ONE)]);
        let manager = KitManager::new(vec![dir.path().to_path_buf()]);
        let mut catalog = Catalog::default();

        manager.load_kit("k1", &mut catalog).unwrap();
        assert!(matches!(
            manager.load_kit("k1", &mut catalog),
            Err(KitError::AlreadyLoaded(_))
        ));
        assert!(matches!(
            manager.load_kit("ghost", &mut catalog),
            Err(KitError::NotFound(_))
        ));
        assert!(matches!(
            manager.unload_kit("ghost", &mut catalog),
            Err(KitError::NotLoaded(_))
        ));
    }

    #[test]
    fn listing_includes_unloaded_kits() {
        let dir = kit_dir_with(&[("k1", KIT_ONE), ("k2", KIT_TWO)]);
        let manager = KitManager::new(vec![dir.path().to_path_buf()]);
        let mut catalog = Catalog::default();
        manager.load_kit("k1", &mut catalog).unwrap();

        let listings = manager.list_kits(&catalog);
        assert_eq!(listings.len(), 2);
        let k1 = listings.iter().find(|l| l.name == "k1").unwrap();
        let k2 = listings.iter().find(|l| l.name == "k2").unwrap();
        assert!(k1.loaded);
        assert!(!k2.loaded);
        assert_eq!(k2.servers, vec!["s"]);
    }
}
