//! Mount engine: the authoritative map from server names to backend
//! connections and the derived aggregated capability index.
//!
//! All mutation funnels through here. `apply` is serialized with itself by
//! an async mutex; readers take immutable `Arc` snapshots of the index that
//! are swapped atomically on re-index, so a reconfigure is never observed
//! half-done.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use magg_core::{Catalog, CatalogDiff, MaggError, ServerConfig};
use magg_mcp::{CallToolResult, GetPromptResult, ReadResourceResult};

use crate::backend::{
    spawn_backend, BackendEvent, BackendHandle, BackendOptions, BackendState,
};
use crate::coordinator::SessionId;

/// What kind of capability a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

/// One aggregated capability: where it lives and what it looks like.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedCapability {
    /// Owning backend's server name.
    pub server: String,
    /// The backend-local name (or URI for resources).
    pub local_name: String,
    /// The capability definition with its aggregated name applied.
    pub definition: Value,
}

/// Immutable aggregated view across all mounted backends.
#[derive(Debug, Default, Serialize)]
pub struct AggregatedIndex {
    /// Aggregated tool name → entry.
    pub tools: BTreeMap<String, IndexedCapability>,
    /// Resource URI → entry (URIs are never prefixed).
    pub resources: BTreeMap<String, IndexedCapability>,
    /// Resource template URI-template → entry.
    pub resource_templates: BTreeMap<String, IndexedCapability>,
    /// Aggregated prompt name → entry.
    pub prompts: BTreeMap<String, IndexedCapability>,
    /// Servers blocked from mounting by a name collision, with the error.
    pub collisions: BTreeMap<String, String>,
    /// Monotonic re-index counter.
    pub generation: u64,
}

impl AggregatedIndex {
    /// Names grouped per backend for one capability kind.
    #[must_use]
    pub fn names_by_server(&self, kind: CapabilityKind) -> BTreeMap<String, Vec<String>> {
        let map = match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        };
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, entry) in map {
            grouped.entry(entry.server.clone()).or_default().push(name.clone());
        }
        grouped
    }
}

/// The mount engine. Shared behind `Arc`.
pub struct MountEngine {
    backends: RwLock<HashMap<String, Arc<BackendHandle>>>,
    index: RwLock<Arc<AggregatedIndex>>,
    /// Serializes `apply` with itself.
    apply_lock: Mutex<()>,
    /// Configuration order used to break collisions.
    order: RwLock<Vec<String>>,
    events: mpsc::Sender<BackendEvent>,
    options: BackendOptions,
    separator: String,
    /// The aggregator's own prefix; backends may not claim it.
    reserved_prefix: String,
}

impl MountEngine {
    #[must_use]
    pub fn new(
        options: BackendOptions,
        separator: impl Into<String>,
        reserved_prefix: impl Into<String>,
        events: mpsc::Sender<BackendEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backends: RwLock::new(HashMap::new()),
            index: RwLock::new(Arc::new(AggregatedIndex::default())),
            apply_lock: Mutex::new(()),
            order: RwLock::new(Vec::new()),
            events,
            options,
            separator: separator.into(),
            reserved_prefix: reserved_prefix.into(),
        })
    }

    /// Current aggregated index snapshot.
    #[must_use]
    pub fn index(&self) -> Arc<AggregatedIndex> {
        Arc::clone(&self.index.read().expect("poisoned"))
    }

    /// Handle for one backend, if present.
    #[must_use]
    pub fn backend(&self, name: &str) -> Option<Arc<BackendHandle>> {
        self.backends.read().expect("poisoned").get(name).cloned()
    }

    /// All backend handles, in no particular order.
    #[must_use]
    pub fn backends(&self) -> Vec<Arc<BackendHandle>> {
        self.backends.read().expect("poisoned").values().cloned().collect()
    }

    /// Transactional reconfigure. Ordering: teardown removed, teardown
    /// updated, bring up toggled-on and added, re-index. Failed bring-ups
    /// are left in their own error state; the catalog stays valid.
    pub async fn apply(&self, diff: &CatalogDiff, catalog: &Catalog) {
        let _guard = self.apply_lock.lock().await;

        // (1) Removed servers go away entirely.
        for server in &diff.removed {
            self.teardown(&server.name).await;
        }

        // (2) Updated servers restart under their new definition; a prefix
        // change is exactly a remove-plus-add of their names.
        for (_, new) in &diff.updated {
            self.teardown(&new.name).await;
            if new.enabled {
                self.bring_up(new.clone());
            }
        }

        // (3) Toggles and additions.
        for (name, enabled, config) in &diff.toggled {
            if *enabled {
                self.bring_up(config.clone());
            } else {
                self.teardown(name).await;
            }
        }
        for server in &diff.added {
            if server.enabled {
                self.bring_up(server.clone());
            }
        }

        // (4) Re-index under the new configuration order.
        *self.order.write().expect("poisoned") = catalog.servers.keys().cloned().collect();
        self.reindex();
    }

    /// Start every enabled server of a catalog. Initial-mount convenience
    /// wrapping `apply` with an all-added diff.
    pub async fn mount_all(&self, catalog: &Catalog) {
        let diff = CatalogDiff {
            added: catalog.servers.values().cloned().collect(),
            ..CatalogDiff::default()
        };
        self.apply(&diff, catalog).await;
    }

    /// Tear down every backend. Used at shutdown.
    pub async fn unmount_all(&self) {
        let names: Vec<String> = self.backends.read().expect("poisoned").keys().cloned().collect();
        for name in names {
            self.teardown(&name).await;
        }
        self.reindex();
    }

    /// Tear down one backend and drop its names from the index. Used by
    /// the admin `check` repair actions.
    pub async fn unmount(&self, name: &str) {
        let _guard = self.apply_lock.lock().await;
        self.teardown(name).await;
        self.reindex();
    }

    /// Restart one backend under its current definition.
    pub async fn remount(&self, config: ServerConfig) {
        let _guard = self.apply_lock.lock().await;
        self.teardown(&config.name).await;
        if config.enabled {
            self.bring_up(config);
        }
        self.reindex();
    }

    fn bring_up(&self, config: ServerConfig) {
        let name = config.name.clone();
        tracing::info!(server = %name, "mounting backend");
        let handle = spawn_backend(config, self.options.clone(), self.events.clone());
        self.backends
            .write()
            .expect("poisoned")
            .insert(name, Arc::new(handle));
    }

    async fn teardown(&self, name: &str) {
        let handle = self.backends.write().expect("poisoned").remove(name);
        if let Some(handle) = handle {
            tracing::info!(server = %name, "unmounting backend");
            handle.shutdown().await;
        }
    }

    /// Rebuild the aggregated index from current backend snapshots.
    ///
    /// Backends are visited in configuration order; when a backend would
    /// publish an already-taken `(prefix, local)` name, the whole backend
    /// is blocked and parked in `Failed` with a collision error while the
    /// earlier claimant keeps serving. Returns true when the published
    /// name sets changed.
    pub fn reindex(&self) -> bool {
        let order = self.order.read().expect("poisoned").clone();
        let backends = self.backends.read().expect("poisoned").clone();

        let mut next = AggregatedIndex::default();

        let ordered: Vec<Arc<BackendHandle>> = order
            .iter()
            .filter_map(|name| backends.get(name).cloned())
            .collect();

        for handle in ordered {
            if !handle.state().is_mountable() {
                continue;
            }
            let config = handle.config();
            let snapshot = handle.snapshot();
            let prefix = config.effective_prefix();

            if prefix == self.reserved_prefix {
                let reason = format!("prefix {prefix:?} is reserved for the aggregator");
                tracing::warn!(server = %config.name, "{reason}");
                handle.mark_failed(&reason);
                next.collisions.insert(config.name.clone(), reason);
                continue;
            }

            if let Err(collision) = try_mount(&mut next, config, &prefix, &self.separator, &snapshot)
            {
                tracing::warn!(server = %config.name, %collision, "backend blocked by collision");
                handle.mark_failed(&collision);
                next.collisions.insert(config.name.clone(), collision);
            }
        }

        let mut slot = self.index.write().expect("poisoned");
        let changed = !same_names(&slot, &next);
        next.generation = slot.generation + 1;
        *slot = Arc::new(next);
        changed
    }

    /// Resolve an aggregated name to `(backend, local_name)`.
    pub fn resolve(
        &self,
        kind: CapabilityKind,
        aggregated_name: &str,
    ) -> Result<(Arc<BackendHandle>, String), MaggError> {
        let index = self.index();
        let map = match kind {
            CapabilityKind::Tool => &index.tools,
            CapabilityKind::Resource => &index.resources,
            CapabilityKind::Prompt => &index.prompts,
        };

        let kind_name = match kind {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Prompt => "prompt",
        };
        let entry = map
            .get(aggregated_name)
            .ok_or_else(|| MaggError::NotFound(format!("{kind_name} {aggregated_name:?}")))?;

        let handle = self.backend(&entry.server).ok_or_else(|| {
            MaggError::Transport(format!("backend {:?} is gone", entry.server))
        })?;

        Ok((handle, entry.local_name.clone()))
    }

    /// Route a tool call to the owning backend. `origin` is the session
    /// the call is made for, so backend cancellations find their way back.
    pub async fn call_tool(
        &self,
        aggregated_name: &str,
        arguments: Value,
        cancel: CancellationToken,
        origin: Option<SessionId>,
    ) -> Result<CallToolResult, MaggError> {
        let (handle, local) = self.resolve(CapabilityKind::Tool, aggregated_name)?;
        handle.call_tool(&local, arguments, cancel, origin).await
    }

    /// Route a resource read by URI.
    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: CancellationToken,
        origin: Option<SessionId>,
    ) -> Result<ReadResourceResult, MaggError> {
        let (handle, local) = self.resolve(CapabilityKind::Resource, uri)?;
        handle.read_resource(&local, cancel, origin).await
    }

    /// Route a prompt fetch.
    pub async fn get_prompt(
        &self,
        aggregated_name: &str,
        arguments: Value,
        cancel: CancellationToken,
        origin: Option<SessionId>,
    ) -> Result<GetPromptResult, MaggError> {
        let (handle, local) = self.resolve(CapabilityKind::Prompt, aggregated_name)?;
        handle.get_prompt(&local, arguments, cancel, origin).await
    }
}

/// Compose an aggregated name from prefix, separator and local name.
#[must_use]
pub fn aggregated_name(prefix: &str, separator: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_string()
    } else {
        format!("{prefix}{separator}{local}")
    }
}

/// Attempt to publish one backend's snapshot into the index. All names
/// must be free; any collision rejects the whole backend.
fn try_mount(
    index: &mut AggregatedIndex,
    config: &ServerConfig,
    prefix: &str,
    separator: &str,
    snapshot: &crate::backend::CapabilitySnapshot,
) -> Result<(), String> {
    // Dry run first so a partial mount never lands in the index.
    for tool in &snapshot.tools {
        let name = aggregated_name(prefix, separator, &tool.name);
        if let Some(existing) = index.tools.get(&name) {
            return Err(format!(
                "tool {name:?} already published by {:?}",
                existing.server
            ));
        }
    }
    for prompt in &snapshot.prompts {
        let name = aggregated_name(prefix, separator, &prompt.name);
        if let Some(existing) = index.prompts.get(&name) {
            return Err(format!(
                "prompt {name:?} already published by {:?}",
                existing.server
            ));
        }
    }
    for resource in &snapshot.resources {
        if let Some(existing) = index.resources.get(&resource.uri) {
            return Err(format!(
                "resource {:?} already published by {:?}",
                resource.uri, existing.server
            ));
        }
    }
    for template in &snapshot.resource_templates {
        if let Some(existing) = index.resource_templates.get(&template.uri_template) {
            return Err(format!(
                "resource template {:?} already published by {:?}",
                template.uri_template, existing.server
            ));
        }
    }

    for tool in &snapshot.tools {
        let name = aggregated_name(prefix, separator, &tool.name);
        let mut definition = tool.clone();
        definition.name.clone_from(&name);
        index.tools.insert(
            name,
            IndexedCapability {
                server: config.name.clone(),
                local_name: tool.name.clone(),
                definition: serde_json::to_value(definition).unwrap_or(Value::Null),
            },
        );
    }
    for prompt in &snapshot.prompts {
        let name = aggregated_name(prefix, separator, &prompt.name);
        let mut definition = prompt.clone();
        definition.name.clone_from(&name);
        index.prompts.insert(
            name,
            IndexedCapability {
                server: config.name.clone(),
                local_name: prompt.name.clone(),
                definition: serde_json::to_value(definition).unwrap_or(Value::Null),
            },
        );
    }
    for resource in &snapshot.resources {
        index.resources.insert(
            resource.uri.clone(),
            IndexedCapability {
                server: config.name.clone(),
                local_name: resource.uri.clone(),
                definition: serde_json::to_value(resource).unwrap_or(Value::Null),
            },
        );
    }
    for template in &snapshot.resource_templates {
        index.resource_templates.insert(
            template.uri_template.clone(),
            IndexedCapability {
                server: config.name.clone(),
                local_name: template.uri_template.clone(),
                definition: serde_json::to_value(template).unwrap_or(Value::Null),
            },
        );
    }

    Ok(())
}

/// Whether two indexes publish identical name sets, kind by kind.
fn same_names(a: &AggregatedIndex, b: &AggregatedIndex) -> bool {
    a.tools.keys().eq(b.tools.keys())
        && a.resources.keys().eq(b.resources.keys())
        && a.resource_templates.keys().eq(b.resource_templates.keys())
        && a.prompts.keys().eq(b.prompts.keys())
}
