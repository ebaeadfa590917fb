//! The outward-facing aggregator server.
//!
//! Owns the catalog, the mount engine, the notification coordinator, the
//! kit manager and the config watcher, and dispatches MCP requests from
//! client sessions: admin tools under the self-prefix, the proxy tool, and
//! the aggregated capability surface delegated through the mount engine.

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use magg_core::{
    diff, Catalog, CatalogDiff, CatalogError, CatalogStore, MaggError, NotificationEnvelope,
    NotificationKind, Settings,
};
use magg_mcp::{
    in_process_pair, CallToolResult, ClientCapabilities, Implementation, McpClient,
    ServerCapabilities, TransportOptions,
};

use crate::backend::{BackendEvent, BackendOptions};
use crate::coordinator::NotificationCoordinator;
use crate::kits::KitManager;
use crate::mount::{CapabilityKind, MountEngine};
use crate::session::{run_session, ClientSession};
use crate::watcher::{spawn_watcher, ConfigWatcher, ReloadRequester, WatcherLatch};
use crate::{admin, proxy};

/// Instructions advertised at initialize.
const INSTRUCTIONS: &str = "\
This server aggregates tools, resources and prompts from multiple MCP \
servers behind one endpoint. Backend capabilities are published under \
prefixed names. Administrative tools live under the `{self_prefix}` \
prefix; the `proxy` tool gives dynamic list/info/call access to every \
mounted capability.";

/// The aggregator. Shared behind `Arc`; sessions borrow it for dispatch.
pub struct MaggServer {
    settings: Settings,
    store: CatalogStore,
    catalog: RwLock<Arc<Catalog>>,
    engine: Arc<MountEngine>,
    coordinator: Arc<NotificationCoordinator>,
    kits: KitManager,
    reload_requester: ReloadRequester,
    watch_latch: WatcherLatch,
    /// Serializes catalog mutations (admin tools, kit ops, reloads).
    mutation_lock: tokio::sync::Mutex<()>,
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
    /// Taken by `start`.
    pending_events: Mutex<Option<mpsc::Receiver<BackendEvent>>>,
    pending_watcher: Mutex<Option<ConfigWatcher>>,
}

impl std::fmt::Debug for MaggServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaggServer").finish_non_exhaustive()
    }
}

impl MaggServer {
    /// Build the server. Failing to read or validate the catalog at
    /// startup is fatal to the caller.
    pub fn new(settings: Settings) -> Result<Arc<Self>, MaggError> {
        settings
            .validate()
            .map_err(|e| MaggError::Validation(e.to_string()))?;

        let store = CatalogStore::new(
            settings.config_path.clone(),
            settings.read_only,
            settings.prefix_sep.clone(),
        );
        let catalog = store
            .load()
            .map_err(|e| MaggError::Validation(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(256);

        let backend_options = BackendOptions {
            transport: TransportOptions {
                stderr_show: settings.stderr_show,
                env_inheritance: magg_mcp::EnvInheritance::ExplicitOnly,
                bearer_token: settings.jwt.clone(),
            },
            client_info: Implementation::new(
                settings.self_prefix.clone(),
                env!("CARGO_PKG_VERSION"),
            ),
            ..BackendOptions::default()
        };

        let engine = MountEngine::new(
            backend_options,
            settings.prefix_sep.clone(),
            settings.self_prefix.clone(),
            events_tx,
        );
        let coordinator = NotificationCoordinator::new(settings.log_rate);
        let kits = KitManager::new(vec![settings.kitd_path()]);

        let (watcher, reload_requester) = if settings.auto_reload {
            spawn_watcher(
                &settings.config_path,
                settings.reload_use_watchdog,
                std::time::Duration::from_secs_f64(settings.reload_poll_interval),
            )
        } else {
            crate::watcher::inert_watcher()
        };
        let watch_latch = watcher.latch();

        Ok(Arc::new(Self {
            settings,
            store,
            catalog: RwLock::new(Arc::new(catalog)),
            engine,
            coordinator,
            kits,
            reload_requester,
            watch_latch,
            mutation_lock: tokio::sync::Mutex::new(()),
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
            pending_events: Mutex::new(Some(events_rx)),
            pending_watcher: Mutex::new(Some(watcher)),
        }))
    }

    /// Mount all enabled servers and start the event and reload loops.
    pub async fn start(self: &Arc<Self>) {
        let catalog = self.catalog();
        self.engine.mount_all(&catalog).await;

        if let Some(events_rx) = self.pending_events.lock().expect("poisoned").take() {
            let server = Arc::clone(self);
            tokio::spawn(async move { server.route_events(events_rx).await });
        }

        if self.settings.auto_reload {
            if let Some(watcher) = self.pending_watcher.lock().expect("poisoned").take() {
                let server = Arc::clone(self);
                tokio::spawn(async move { server.reload_loop(watcher).await });
            }
        }

        tracing::info!(
            servers = catalog.servers.len(),
            config = %self.settings.config_path.display(),
            read_only = self.settings.read_only,
            "aggregator started"
        );
    }

    /// Stop background loops and tear down every backend.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.engine.unmount_all().await;
        tracing::info!("aggregator stopped");
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read().expect("poisoned"))
    }

    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<MountEngine> {
        &self.engine
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<NotificationCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub const fn kits(&self) -> &KitManager {
        &self.kits
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn reload_requester(&self) -> ReloadRequester {
        self.reload_requester.clone()
    }

    /// The self-prefix with trailing separator, e.g. `magg_`.
    #[must_use]
    pub fn self_prefix_(&self) -> String {
        format!("{}{}", self.settings.self_prefix, self.settings.prefix_sep)
    }

    /// URI scheme for the aggregator's own resources, e.g. `magg://`.
    #[must_use]
    pub fn self_scheme(&self) -> String {
        format!("{}://", self.settings.self_prefix)
    }

    /// Connect an in-process client to this server — the same frame
    /// contract as stdio, no network hop.
    #[must_use]
    pub fn connect_in_process(self: &Arc<Self>) -> McpClient {
        let (client_end, server_end) = in_process_pair();
        let server = Arc::clone(self);
        tokio::spawn(async move {
            run_session(server, server_end.inbound, server_end.outbound.clone()).await;
            drop(server_end.guard);
        });

        let (notif_tx, _notif_rx) = mpsc::channel(64);
        McpClient::connect(client_end, notif_tx)
    }

    // ------------------------------------------------------------------
    // Catalog mutation and reload
    // ------------------------------------------------------------------

    /// Run a mutation against a copy of the catalog, persist it, apply the
    /// diff to the mount engine and publish the new catalog. Everything or
    /// nothing: a failed mutation or save leaves the old catalog in force.
    pub async fn mutate_catalog<F>(&self, mutate: F) -> Result<CatalogDiff, MaggError>
    where
        F: FnOnce(&mut Catalog) -> Result<(), MaggError>,
    {
        let _guard = self.mutation_lock.lock().await;

        if self.store.is_read_only() {
            return Err(MaggError::ReadOnly("catalog mutations are disabled".into()));
        }

        let old = self.catalog();
        let mut new = (*old).clone();
        mutate(&mut new)?;
        new.validate(&self.settings.prefix_sep)
            .map_err(|e| MaggError::Validation(e.to_string()))?;

        // Our own save must not bounce back through the watcher.
        self.watch_latch.ignore_next_change();
        self.store.save(&new).map_err(|e| match e {
            CatalogError::ReadOnly => MaggError::ReadOnly("catalog is read-only".into()),
            other => MaggError::Validation(other.to_string()),
        })?;

        let change = diff(&old, &new);
        self.engine.apply(&change, &new).await;
        *self.catalog.write().expect("poisoned") = Arc::new(new);
        self.emit_list_changes();

        Ok(change)
    }

    /// Reload the catalog from disk and apply the difference. A validation
    /// failure keeps the previous catalog in force.
    pub async fn reload_catalog(&self) -> Result<CatalogDiff, MaggError> {
        let _guard = self.mutation_lock.lock().await;

        let new = match self.store.load() {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::error!(error = %e, "reload rejected, keeping previous catalog");
                return Err(MaggError::Validation(e.to_string()));
            }
        };

        let old = self.catalog();
        let change = diff(&old, &new);
        if change.is_empty() {
            tracing::debug!("config reloaded, no changes");
            *self.catalog.write().expect("poisoned") = Arc::new(new);
            return Ok(change);
        }

        tracing::info!(changes = %change.summarize(), "applying config reload");
        self.engine.apply(&change, &new).await;
        *self.catalog.write().expect("poisoned") = Arc::new(new);
        self.emit_list_changes();

        Ok(change)
    }

    /// Synthetic list-change notifications after a reconfigure.
    pub fn emit_list_changes(&self) {
        for kind in [
            NotificationKind::ToolsChanged,
            NotificationKind::ResourcesChanged,
            NotificationKind::PromptsChanged,
        ] {
            self.coordinator.ingest(NotificationEnvelope::new(
                self.settings.self_prefix.clone(),
                kind,
                Value::Null,
            ));
        }
    }

    /// Backend event router: notifications to the coordinator, state
    /// changes to a re-index (with synthetic list-changes when the
    /// published names moved).
    async fn route_events(self: Arc<Self>, mut events: mpsc::Receiver<BackendEvent>) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                () = self.shutdown.cancelled() => return,
            };
            let Some(event) = event else { return };

            match event {
                BackendEvent::Notification(envelope) => {
                    if envelope.kind.is_list_change() {
                        self.engine.reindex();
                    }
                    self.coordinator.ingest(envelope);
                }
                BackendEvent::StateChanged { server, state } => {
                    tracing::debug!(server = %server, state = ?state, "backend state");
                    if self.engine.reindex() {
                        self.emit_list_changes();
                    }
                }
                BackendEvent::RequestIssued {
                    server,
                    request_id,
                    session,
                } => {
                    self.coordinator
                        .register_cancel_target(session, &server, request_id);
                }
                BackendEvent::RequestSettled { server, request_id } => {
                    self.coordinator.release_cancel_target(&server, request_id);
                }
            }
        }
    }

    /// Watcher loop: debounced triggers drive reloads.
    async fn reload_loop(self: Arc<Self>, mut watcher: ConfigWatcher) {
        loop {
            let trigger = tokio::select! {
                trigger = watcher.next_reload() => trigger,
                () = self.shutdown.cancelled() => {
                    watcher.stop();
                    return;
                }
            };
            let Some(trigger) = trigger else { return };

            tracing::debug!(?trigger, "reload triggered");
            if let Err(e) = self.reload_catalog().await {
                tracing::warn!(error = %e, "config reload failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // MCP dispatch
    // ------------------------------------------------------------------

    /// Handle one client request.
    pub async fn handle_request(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, MaggError> {
        match method {
            "initialize" => self.handle_initialize(session, params.as_ref()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.list_tools_result()),
            "tools/call" => self.handle_tool_call(session, params, cancel).await,
            "resources/list" => Ok(self.list_resources_result()),
            "resources/templates/list" => Ok(self.list_resource_templates_result()),
            "resources/read" => self.handle_resource_read(session, params, cancel).await,
            "resources/subscribe" => self.handle_subscribe(session, params, true).await,
            "resources/unsubscribe" => self.handle_subscribe(session, params, false).await,
            "prompts/list" => Ok(self.list_prompts_result()),
            "prompts/get" => self.handle_prompt_get(session, params, cancel).await,
            "logging/setLevel" => Ok(json!({})),
            other => Err(MaggError::NotFound(format!("method {other:?}"))),
        }
    }

    fn handle_initialize(
        &self,
        session: &ClientSession,
        params: Option<&Value>,
    ) -> Result<Value, MaggError> {
        if let Some(caps) = params.and_then(|p| p.get("capabilities")) {
            let caps: ClientCapabilities =
                serde_json::from_value(caps.clone()).unwrap_or_default();
            session.set_client_capabilities(caps);
        }

        let result = magg_mcp::InitializeResult {
            protocol_version: magg_mcp::protocol::PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::aggregator(),
            server_info: Implementation::new(
                self.settings.self_prefix.clone(),
                env!("CARGO_PKG_VERSION"),
            ),
            instructions: Some(INSTRUCTIONS.replace("{self_prefix}", &self.settings.self_prefix)),
        };
        serde_json::to_value(result).map_err(|e| MaggError::Protocol(e.to_string()))
    }

    /// All tools visible to clients: admin tools, the proxy tool, and the
    /// aggregated index.
    fn list_tools_result(&self) -> Value {
        let mut tools: Vec<Value> = admin::admin_tools(&self.settings.self_prefix, &self.settings.prefix_sep)
            .iter()
            .filter_map(|t| serde_json::to_value(t).ok())
            .collect();
        if let Ok(proxy_tool) = serde_json::to_value(proxy::proxy_tool_definition()) {
            tools.push(proxy_tool);
        }

        let index = self.engine.index();
        tools.extend(index.tools.values().map(|entry| entry.definition.clone()));

        json!({"tools": tools})
    }

    fn list_resources_result(&self) -> Value {
        let mut resources = vec![json!({
            "uri": format!("{}servers/all", self.self_scheme()),
            "name": "servers",
            "description": "The full server catalog with runtime state",
            "mimeType": "application/json",
        })];

        let index = self.engine.index();
        resources.extend(index.resources.values().map(|entry| entry.definition.clone()));
        json!({"resources": resources})
    }

    fn list_resource_templates_result(&self) -> Value {
        let mut templates = vec![json!({
            "uriTemplate": format!("{}server/{{name}}", self.self_scheme()),
            "name": "server",
            "description": "Metadata for one configured server",
            "mimeType": "application/json",
        })];

        let index = self.engine.index();
        templates.extend(
            index
                .resource_templates
                .values()
                .map(|entry| entry.definition.clone()),
        );
        json!({"resourceTemplates": templates})
    }

    fn list_prompts_result(&self) -> Value {
        let index = self.engine.index();
        let prompts: Vec<Value> = index.prompts.values().map(|e| e.definition.clone()).collect();
        json!({"prompts": prompts})
    }

    async fn handle_tool_call(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, MaggError> {
        let params = params.ok_or_else(|| MaggError::validation("tools/call requires params"))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MaggError::validation("tools/call requires a name"))?
            .to_string();
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        // Route progress for this call back to the issuing session.
        let progress_token = params
            .get("_meta")
            .and_then(|m| m.get("progressToken"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        if let Some(token) = &progress_token {
            self.coordinator.register_progress_token(session.id, token);
        }

        let result = self
            .dispatch_tool(session, &name, arguments, cancel)
            .await;

        if let Some(token) = &progress_token {
            self.coordinator.release_progress_token(token);
        }

        let result = result?;
        serde_json::to_value(result).map_err(|e| MaggError::Protocol(e.to_string()))
    }

    /// Tool-call routing: admin prefix runs locally, `proxy` runs the
    /// proxy tool, everything else resolves through the mount engine.
    async fn dispatch_tool(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, MaggError> {
        if name == proxy::PROXY_TOOL_NAME {
            return proxy::run_proxy_tool(self, Some(session.id), arguments, cancel).await;
        }

        let self_prefix_ = self.self_prefix_();
        if let Some(local) = name.strip_prefix(&self_prefix_) {
            return admin::run_admin_tool(self, session, local, arguments).await;
        }

        self.engine
            .call_tool(name, arguments, cancel, Some(session.id))
            .await
    }

    async fn handle_resource_read(
        &self,
        session: &Arc<ClientSession>,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, MaggError> {
        let uri = params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .ok_or_else(|| MaggError::validation("resources/read requires a uri"))?;

        if let Some(local) = uri.strip_prefix(&self.self_scheme()) {
            let contents = self.read_self_resource(local, uri)?;
            return Ok(json!({"contents": [contents]}));
        }

        let result = self
            .engine
            .read_resource(uri, cancel, Some(session.id))
            .await?;
        serde_json::to_value(result).map_err(|e| MaggError::Protocol(e.to_string()))
    }

    /// The aggregator's own `magg://` resources.
    fn read_self_resource(&self, local: &str, uri: &str) -> Result<Value, MaggError> {
        let catalog = self.catalog();

        let payload = if local == "servers/all" {
            let servers: Vec<Value> = catalog
                .servers
                .values()
                .map(|s| self.server_metadata(s))
                .collect();
            json!({"servers": servers, "kits": catalog.kits})
        } else if let Some(name) = local.strip_prefix("server/") {
            let server = catalog
                .servers
                .get(name)
                .ok_or_else(|| MaggError::NotFound(format!("server {name:?}")))?;
            self.server_metadata(server)
        } else {
            return Err(MaggError::NotFound(format!("resource {uri:?}")));
        };

        Ok(json!({
            "uri": uri,
            "mimeType": "application/json",
            "text": payload.to_string(),
        }))
    }

    /// One server's metadata including runtime state.
    #[must_use]
    pub fn server_metadata(&self, config: &magg_core::ServerConfig) -> Value {
        let state = self
            .engine
            .backend(&config.name)
            .map(|handle| serde_json::to_value(handle.state()).unwrap_or(Value::Null));
        json!({
            "name": config.name,
            "prefix": config.effective_prefix(),
            "enabled": config.enabled,
            "command": config.command,
            "args": config.args,
            "uri": config.uri,
            "cwd": config.cwd,
            "notes": config.notes,
            "source": config.source,
            "kits": config.kits,
            "state": state,
        })
    }

    async fn handle_subscribe(
        &self,
        session: &Arc<ClientSession>,
        params: Option<Value>,
        subscribe: bool,
    ) -> Result<Value, MaggError> {
        let uri = params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .ok_or_else(|| MaggError::validation("subscribe requires a uri"))?;

        if subscribe {
            self.coordinator.subscribe_resource(session.id, uri);
            // Propagate interest downstream when a backend owns the URI.
            if let Ok((handle, local)) = self.engine.resolve(CapabilityKind::Resource, uri) {
                if let Err(e) = handle.subscribe_resource(&local).await {
                    tracing::debug!(uri, error = %e, "backend subscribe failed");
                }
            }
        } else {
            self.coordinator.unsubscribe_resource(session.id, uri);
        }
        Ok(json!({}))
    }

    async fn handle_prompt_get(
        &self,
        session: &Arc<ClientSession>,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, MaggError> {
        let params = params.ok_or_else(|| MaggError::validation("prompts/get requires params"))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MaggError::validation("prompts/get requires a name"))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let result = self
            .engine
            .get_prompt(name, arguments, cancel, Some(session.id))
            .await?;
        serde_json::to_value(result).map_err(|e| MaggError::Protocol(e.to_string()))
    }
}

/// Serve one MCP session over stdio, the transport used when the
/// aggregator is itself launched as a child process.
pub async fn serve_stdio(server: Arc<MaggServer>) -> anyhow::Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (in_tx, in_rx) = mpsc::channel::<String>(64);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    // Writer: frames to stdout, newline-delimited.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = out_rx.recv().await {
            let mut line = frame;
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Reader: lines from stdin.
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if in_tx.send(trimmed.to_string()).await.is_err() {
                break;
            }
        }
    });

    run_session(server, in_rx, out_tx).await;
    reader.abort();
    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn test_settings(dir: &TempDir) -> Settings {
        Settings {
            config_path: dir.path().join(".magg/config.json"),
            auto_reload: false,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn initialize_reports_aggregator_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let server = MaggServer::new(test_settings(&dir)).unwrap();
        server.start().await;

        let client = server.connect_in_process();
        let init = client
            .initialize(Implementation::new("test-client", "0"))
            .await
            .unwrap();

        assert_eq!(init.server_info.name, "magg");
        assert!(init.capabilities.tools.is_some());
        assert!(init.capabilities.resources.is_some());
        assert!(init.instructions.unwrap().contains("magg"));

        server.stop().await;
    }

    #[tokio::test]
    async fn tools_list_contains_admin_and_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let server = MaggServer::new(test_settings(&dir)).unwrap();
        server.start().await;

        let client = server.connect_in_process();
        client
            .initialize(Implementation::new("test-client", "0"))
            .await
            .unwrap();

        let tools = client.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"proxy"));
        assert!(names.contains(&"magg_add_server"));
        assert!(names.contains(&"magg_status"));
        assert!(names.contains(&"magg_load_kit"));

        server.stop().await;
    }

    #[tokio::test]
    async fn self_resources_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let server = MaggServer::new(test_settings(&dir)).unwrap();
        server.start().await;

        let client = server.connect_in_process();
        client
            .initialize(Implementation::new("test-client", "0"))
            .await
            .unwrap();

        let result = client.read_resource("magg://servers/all", None).await.unwrap();
        assert_eq!(result.contents.len(), 1);
        let magg_mcp::ResourceContents::Text { text, mime_type, .. } = &result.contents[0] else {
            panic!("expected text contents");
        };
        assert_eq!(mime_type.as_deref(), Some("application/json"));
        let decoded: Value = serde_json::from_str(text).unwrap();
        assert!(decoded.get("servers").is_some());

        server.stop().await;
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let server = MaggServer::new(test_settings(&dir)).unwrap();
        server.start().await;

        let client = server.connect_in_process();
        client
            .initialize(Implementation::new("test-client", "0"))
            .await
            .unwrap();

        let err = client
            .call_tool("ghost_tool", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, magg_mcp::McpError::Server { .. }));

        server.stop().await;
    }

    #[tokio::test]
    async fn read_only_mode_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            read_only: true,
            ..test_settings(&dir)
        };
        let server = MaggServer::new(settings).unwrap();
        server.start().await;

        let err = server
            .mutate_catalog(|_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, MaggError::ReadOnly(_)));

        server.stop().await;
    }
}
