//! Server catalog: the authoritative set of backend definitions.
//!
//! The catalog lives in memory as a [`Catalog`] and on disk as
//! `config.json`. Loading is total: a file either parses and validates as a
//! whole or is rejected as a whole — partial application is forbidden.
//! Saving always goes through write-temp-then-rename so readers never see a
//! half-written file.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kit::KitInfo;

/// Default separator between a prefix and a local capability name.
pub const DEFAULT_PREFIX_SEP: &str = "_";

/// Longest auto-generated prefix.
const MAX_GENERATED_PREFIX: usize = 30;

/// Errors from catalog load/save/validation.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid catalog JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid server {name:?}: {reason}")]
    InvalidServer { name: String, reason: String },

    #[error("catalog is read-only, refusing to save")]
    ReadOnly,
}

/// Declarative definition of one backend server.
///
/// Exactly one of `command` / `uri` must be set. The `name` is the map key
/// in the catalog file and is not serialized into the entry itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name; primary key within the catalog.
    #[serde(default, skip_serializing)]
    pub name: String,

    /// Informational URI of where this server came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Namespace prepended to every capability name this backend
    /// contributes. `None` derives a prefix from the name; an empty string
    /// contributes names verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Executable for a stdio child-process backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Endpoint for an HTTP/streamable backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Environment variables for the child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,

    /// Working directory for the child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Transport-specific settings, passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<serde_json::Value>,

    /// Free-form setup notes for humans and LLMs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Kits that own this entry. A server is removed when its last owning
    /// kit is unloaded, unless it was also added outside any kit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kits: Vec<String>,

    /// Whether the mount engine should bring this backend up.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Create a stdio child-process server definition.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            enabled: true,
            ..Self::default()
        }
    }

    /// Create an HTTP server definition.
    pub fn http(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: Some(uri.into()),
            enabled: true,
            ..Self::default()
        }
    }

    /// The prefix this server publishes under: the explicit prefix if set
    /// (possibly empty for verbatim names), otherwise one generated from
    /// the server name.
    #[must_use]
    pub fn effective_prefix(&self) -> String {
        match &self.prefix {
            Some(p) => p.clone(),
            None => generate_prefix_from_name(&self.name),
        }
    }

    /// Validate this entry against the given separator policy.
    ///
    /// Checks name legality, the exactly-one-of command/uri rule, prefix
    /// legality (identifier, no separator), and that `cwd` is absolute when
    /// set.
    pub fn validate(&self, separator: &str) -> Result<(), CatalogError> {
        let fail = |reason: String| CatalogError::InvalidServer {
            name: self.name.clone(),
            reason,
        };

        if !is_valid_server_name(&self.name) {
            return Err(fail(format!("invalid server name {:?}", self.name)));
        }

        match (&self.command, &self.uri) {
            (Some(_), Some(_)) => {
                return Err(fail("both command and uri are set".into()));
            }
            (None, None) => {
                return Err(fail("neither command nor uri is set".into()));
            }
            (Some(cmd), None) if cmd.trim().is_empty() => {
                return Err(fail("command is empty".into()));
            }
            (None, Some(uri)) if uri.trim().is_empty() => {
                return Err(fail("uri is empty".into()));
            }
            _ => {}
        }

        if let Some(prefix) = &self.prefix {
            if !prefix.is_empty() {
                validate_prefix(prefix, separator).map_err(fail)?;
            }
        }

        if let Some(cwd) = &self.cwd {
            if !cwd.is_empty() && !Path::new(cwd).is_absolute() {
                return Err(fail(format!("cwd must be an absolute path: {cwd}")));
            }
        }

        Ok(())
    }
}

/// Whether `name` is acceptable as a catalog key: non-empty, printable,
/// no whitespace, no path separators.
#[must_use]
pub fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(char::is_whitespace)
        && !name.contains(['/', '\\'])
        && name.chars().all(|c| !c.is_control())
}

/// Check that a prefix is a legal identifier under the separator policy:
/// ASCII alphanumeric, not starting with a digit, and not containing the
/// separator.
pub fn validate_prefix(prefix: &str, separator: &str) -> Result<(), String> {
    if prefix.contains(separator) {
        return Err(format!(
            "prefix {prefix:?} must not contain the separator {separator:?}"
        ));
    }

    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => {
            return Err(format!(
                "prefix {prefix:?} must start with an ASCII letter"
            ));
        }
    }

    if !chars.all(|c| c.is_ascii_alphanumeric()) {
        return Err(format!(
            "prefix {prefix:?} must contain only ASCII letters and digits"
        ));
    }

    Ok(())
}

/// Derive a legal prefix from a server name: strip separators and
/// punctuation, lowercase, guard against a leading digit, and cap the
/// length. Falls back to `"server"` when nothing usable remains.
#[must_use]
pub fn generate_prefix_from_name(name: &str) -> String {
    let mut prefix: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();

    if prefix.starts_with(|c: char| c.is_ascii_digit()) {
        prefix = format!("srv{prefix}");
    }

    if prefix.is_empty() {
        prefix = "server".to_string();
    }

    prefix.truncate(MAX_GENERATED_PREFIX);
    prefix
}

/// The full backend catalog plus the set of loaded kits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Backend definitions keyed by server name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    /// Kits currently merged into this catalog.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kits: BTreeMap<String, KitInfo>,
}

impl Catalog {
    /// Validate every server entry. Total: the first invalid entry rejects
    /// the catalog as a whole.
    pub fn validate(&self, separator: &str) -> Result<(), CatalogError> {
        for (name, server) in &self.servers {
            if &server.name != name {
                return Err(CatalogError::InvalidServer {
                    name: name.clone(),
                    reason: format!("entry name {:?} does not match key", server.name),
                });
            }
            server.validate(separator)?;
        }
        Ok(())
    }

    /// Servers that the mount engine should bring up.
    #[must_use]
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.values().filter(|s| s.enabled)
    }

    /// Insert or replace a server, keyed by its name.
    pub fn upsert_server(&mut self, server: ServerConfig) {
        self.servers.insert(server.name.clone(), server);
    }

    /// Remove a server by name. Returns the removed entry if present.
    pub fn remove_server(&mut self, name: &str) -> Option<ServerConfig> {
        self.servers.remove(name)
    }
}

/// Disjoint change sets between two catalogs.
///
/// `updated` holds any non-cosmetic field change; a prefix change lands
/// there and is applied downstream as a remove-plus-add. `toggled` is
/// reserved for entries where only the `enabled` flag flipped.
#[derive(Debug, Clone, Default)]
pub struct CatalogDiff {
    pub added: Vec<ServerConfig>,
    pub removed: Vec<ServerConfig>,
    pub updated: Vec<(ServerConfig, ServerConfig)>,
    pub toggled: Vec<(String, bool, ServerConfig)>,
}

impl CatalogDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.toggled.is_empty()
    }

    /// Compact single-line summary for logs: `+a -b ~c ✓d ✗e`.
    #[must_use]
    pub fn summarize(&self) -> String {
        if self.is_empty() {
            return "no changes".to_string();
        }
        let mut parts = Vec::new();
        parts.extend(self.added.iter().map(|s| format!("+{}", s.name)));
        parts.extend(self.removed.iter().map(|s| format!("-{}", s.name)));
        parts.extend(self.updated.iter().map(|(_, s)| format!("~{}", s.name)));
        parts.extend(self.toggled.iter().map(|(name, enabled, _)| {
            if *enabled {
                format!("on:{name}")
            } else {
                format!("off:{name}")
            }
        }));
        parts.join(" ")
    }
}

/// Fields whose change forces a backend teardown and bring-up.
fn config_changed(old: &ServerConfig, new: &ServerConfig) -> bool {
    old.source != new.source
        || old.prefix != new.prefix
        || old.command != new.command
        || old.args != new.args
        || old.uri != new.uri
        || old.env != new.env
        || old.cwd != new.cwd
        || old.transport != new.transport
}

/// Compute the four disjoint change sets between two catalogs.
#[must_use]
pub fn diff(old: &Catalog, new: &Catalog) -> CatalogDiff {
    let mut out = CatalogDiff::default();

    for (name, server) in &new.servers {
        if !old.servers.contains_key(name) {
            out.added.push(server.clone());
        }
    }

    for (name, server) in &old.servers {
        if !new.servers.contains_key(name) {
            out.removed.push(server.clone());
        }
    }

    for (name, old_server) in &old.servers {
        let Some(new_server) = new.servers.get(name) else {
            continue;
        };

        if config_changed(old_server, new_server) {
            out.updated.push((old_server.clone(), new_server.clone()));
        } else if old_server.enabled != new_server.enabled {
            out.toggled
                .push((name.clone(), new_server.enabled, new_server.clone()));
        }
    }

    out
}

/// On-disk catalog persistence with atomic replace.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
    read_only: bool,
    separator: String,
}

impl CatalogStore {
    /// Create a store for the given path. `read_only` refuses saves while
    /// still allowing loads (and therefore in-memory reloads).
    pub fn new(path: impl Into<PathBuf>, read_only: bool, separator: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            read_only,
            separator: separator.into(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Load and validate the catalog. A missing file yields an empty
    /// catalog; a malformed or invalid file is rejected as a whole.
    pub fn load(&self) -> Result<Catalog, CatalogError> {
        if !self.path.exists() {
            return Ok(Catalog::default());
        }

        let text = fs::read_to_string(&self.path).map_err(|source| CatalogError::Read {
            path: self.path.clone(),
            source,
        })?;

        let mut catalog: Catalog = serde_json::from_str(&text)?;

        // The entry name is the map key; fill it in before validation.
        for (name, server) in &mut catalog.servers {
            server.name.clone_from(name);
        }

        catalog.validate(&self.separator)?;
        Ok(catalog)
    }

    /// Persist the catalog atomically: write a sibling temp file, flush,
    /// then rename over the target.
    pub fn save(&self, catalog: &Catalog) -> Result<(), CatalogError> {
        if self.read_only {
            return Err(CatalogError::ReadOnly);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| CatalogError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(catalog)?;
        let tmp = self.path.with_extension("json.tmp");

        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(path)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
        };

        write(&tmp).map_err(|source| CatalogError::Write {
            path: tmp.clone(),
            source,
        })?;

        fs::rename(&tmp, &self.path).map_err(|source| CatalogError::Write {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(path = %self.path.display(), "catalog saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_server(name: &str) -> ServerConfig {
        ServerConfig::stdio(name, "echo")
    }

    #[test]
    fn exactly_one_transport_required() {
        let mut server = stdio_server("calc");
        assert!(server.validate("_").is_ok());

        server.uri = Some("http://localhost:3000/mcp".into());
        assert!(server.validate("_").is_err());

        server.command = None;
        assert!(server.validate("_").is_ok());

        server.uri = None;
        assert!(server.validate("_").is_err());
    }

    #[test]
    fn prefix_must_not_contain_separator() {
        let mut server = stdio_server("calc");
        server.prefix = Some("my_calc".into());
        assert!(server.validate("_").is_err());

        server.prefix = Some("mycalc".into());
        assert!(server.validate("_").is_ok());

        // Under a different separator policy the underscore is fine.
        server.prefix = Some("my_calc".into());
        assert!(server.validate(".").is_ok());
    }

    #[test]
    fn empty_prefix_means_verbatim() {
        let mut server = stdio_server("calc");
        server.prefix = Some(String::new());
        assert!(server.validate("_").is_ok());
        assert_eq!(server.effective_prefix(), "");
    }

    #[test]
    fn generated_prefix_rules() {
        assert_eq!(generate_prefix_from_name("My-Cool.Server"), "mycoolserver");
        assert_eq!(generate_prefix_from_name("3d-printer"), "srv3dprinter");
        assert_eq!(generate_prefix_from_name("---"), "server");
        assert!(generate_prefix_from_name(&"x".repeat(100)).len() <= MAX_GENERATED_PREFIX);
    }

    #[test]
    fn diff_partitions_are_disjoint() {
        let mut old = Catalog::default();
        old.upsert_server(stdio_server("keep"));
        old.upsert_server(stdio_server("gone"));
        old.upsert_server(stdio_server("flip"));
        old.upsert_server(stdio_server("edit"));

        let mut new = old.clone();
        new.remove_server("gone");
        new.upsert_server(stdio_server("fresh"));
        new.servers.get_mut("flip").unwrap().enabled = false;
        new.servers.get_mut("edit").unwrap().args = Some(vec!["-v".into()]);

        let d = diff(&old, &new);
        assert_eq!(d.added.len(), 1);
        assert_eq!(d.added[0].name, "fresh");
        assert_eq!(d.removed.len(), 1);
        assert_eq!(d.removed[0].name, "gone");
        assert_eq!(d.updated.len(), 1);
        assert_eq!(d.updated[0].1.name, "edit");
        assert_eq!(d.toggled.len(), 1);
        assert_eq!(d.toggled[0].0, "flip");
        assert!(!d.toggled[0].1);
    }

    #[test]
    fn prefix_change_counts_as_update() {
        let mut old = Catalog::default();
        old.upsert_server(stdio_server("calc"));

        let mut new = old.clone();
        new.servers.get_mut("calc").unwrap().prefix = Some("math".into());

        let d = diff(&old, &new);
        assert!(d.added.is_empty() && d.removed.is_empty() && d.toggled.is_empty());
        assert_eq!(d.updated.len(), 1);
    }

    #[test]
    fn toggle_plus_edit_is_an_update() {
        // A config change and an enabled flip together must not land in
        // `toggled`; teardown and bring-up handles both.
        let mut old = Catalog::default();
        old.upsert_server(stdio_server("calc"));

        let mut new = old.clone();
        let entry = new.servers.get_mut("calc").unwrap();
        entry.enabled = false;
        entry.command = Some("other".into());

        let d = diff(&old, &new);
        assert_eq!(d.updated.len(), 1);
        assert!(d.toggled.is_empty());
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = CatalogStore::new(&path, false, "_");

        let mut catalog = Catalog::default();
        let mut server = stdio_server("calc");
        server.args = Some(vec!["-y".into(), "calc-mcp".into()]);
        server.prefix = Some("calc".into());
        server.notes = Some("test server".into());
        catalog.upsert_server(server);

        store.save(&catalog).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, catalog);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path().join("absent.json"), false, "_");
        assert!(store.load().unwrap().servers.is_empty());
    }

    #[test]
    fn read_only_refuses_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path().join("config.json"), true, "_");
        let err = store.save(&Catalog::default()).unwrap_err();
        assert!(matches!(err, CatalogError::ReadOnly));
    }

    #[test]
    fn invalid_entry_rejects_whole_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"servers": {"good": {"command": "echo"}, "bad": {}}}"#,
        )
        .unwrap();

        let store = CatalogStore::new(&path, false, "_");
        assert!(matches!(
            store.load(),
            Err(CatalogError::InvalidServer { .. })
        ));
    }

    #[test]
    fn name_is_filled_from_map_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"servers": {"calc": {"command": "echo"}}}"#).unwrap();

        let store = CatalogStore::new(&path, false, "_");
        let catalog = store.load().unwrap();
        assert_eq!(catalog.servers["calc"].name, "calc");
    }
}
