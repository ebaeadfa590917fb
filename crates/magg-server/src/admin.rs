//! Built-in admin tools, published under the configurable self-prefix.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use magg_core::{generate_prefix_from_name, MaggError, ServerConfig};
use magg_mcp::{CallToolResult, Content, Tool};

use crate::backend::BackendState;
use crate::server::MaggServer;
use crate::session::{sampling_reply_text, sampling_request, ClientSession};

/// Wrap a JSON payload as a tool result.
fn tool_json(value: &Value) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        )],
        is_error: false,
    }
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Definitions for every admin tool, names prefixed `<self_prefix><sep>`.
#[must_use]
pub fn admin_tools(self_prefix: &str, separator: &str) -> Vec<Tool> {
    let name = |local: &str| format!("{self_prefix}{separator}{local}");
    let server_props = json!({
        "name": {"type": "string", "description": "Unique server name"},
        "source": {"type": "string", "description": "URI the server came from"},
        "prefix": {"type": "string", "description": "Tool prefix; defaults to one derived from the name; empty for verbatim names"},
        "command": {"type": "string", "description": "Executable for a stdio server"},
        "args": {"type": "array", "items": {"type": "string"}},
        "uri": {"type": "string", "description": "Endpoint for an HTTP server"},
        "env": {"type": "object", "additionalProperties": {"type": "string"}},
        "cwd": {"type": "string", "description": "Working directory (absolute)"},
        "notes": {"type": "string", "description": "Setup notes"},
        "transport": {"type": "object", "description": "Transport-specific settings"},
        "enable": {"type": "boolean", "description": "Start the server immediately", "default": true},
    });

    vec![
        Tool::new(name("add_server"))
            .with_description("Add a new MCP server to the catalog and mount it")
            .with_input_schema(object_schema(server_props, &["name"])),
        Tool::new(name("remove_server"))
            .with_description("Remove a server from the catalog and unmount it")
            .with_input_schema(object_schema(
                json!({"name": {"type": "string"}}),
                &["name"],
            )),
        Tool::new(name("enable_server"))
            .with_description("Enable a server and mount it")
            .with_input_schema(object_schema(
                json!({"name": {"type": "string"}}),
                &["name"],
            )),
        Tool::new(name("disable_server"))
            .with_description("Disable a server and unmount it")
            .with_input_schema(object_schema(
                json!({"name": {"type": "string"}}),
                &["name"],
            )),
        Tool::new(name("list_servers"))
            .with_description("List configured servers with runtime state")
            .with_input_schema(object_schema(json!({}), &[])),
        Tool::new(name("search_servers"))
            .with_description("Search online registries for MCP servers (external collaborator)")
            .with_input_schema(object_schema(
                json!({
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 50},
                }),
                &["query"],
            )),
        Tool::new(name("smart_configure"))
            .with_description("Use client-side sampling to configure a server from a URI")
            .with_input_schema(object_schema(
                json!({"uri": {"type": "string", "description": "Package, repository or endpoint URI"}}),
                &["uri"],
            )),
        Tool::new(name("analyze_servers"))
            .with_description("Use client-side sampling to analyze the current catalog")
            .with_input_schema(object_schema(json!({}), &[])),
        Tool::new(name("reload_config"))
            .with_description("Reload the catalog from disk and apply changes")
            .with_input_schema(object_schema(json!({}), &[])),
        Tool::new(name("status"))
            .with_description("Aggregator status: servers, sessions, kits")
            .with_input_schema(object_schema(json!({}), &[])),
        Tool::new(name("check"))
            .with_description("Probe backend health, optionally repairing failures")
            .with_input_schema(object_schema(
                json!({
                    "action": {
                        "type": "string",
                        "enum": ["report", "remount", "unmount", "disable"],
                        "default": "report",
                    },
                }),
                &[],
            )),
        Tool::new(name("load_kit"))
            .with_description("Load a kit of servers into the catalog")
            .with_input_schema(object_schema(
                json!({"name": {"type": "string"}}),
                &["name"],
            )),
        Tool::new(name("unload_kit"))
            .with_description("Unload a kit; servers it solely owns are removed")
            .with_input_schema(object_schema(
                json!({"name": {"type": "string"}}),
                &["name"],
            )),
        Tool::new(name("list_kits"))
            .with_description("List loaded and available kits")
            .with_input_schema(object_schema(json!({}), &[])),
        Tool::new(name("kit_info"))
            .with_description("Detailed information about one kit")
            .with_input_schema(object_schema(
                json!({"name": {"type": "string"}}),
                &["name"],
            )),
    ]
}

/// Dispatch one admin tool call by its unprefixed name.
pub async fn run_admin_tool(
    server: &Arc<MaggServer>,
    session: &Arc<ClientSession>,
    local: &str,
    args: Value,
) -> Result<CallToolResult, MaggError> {
    match local {
        "add_server" => add_server(server, args).await,
        "remove_server" => remove_server(server, args).await,
        "enable_server" => toggle_server(server, args, true).await,
        "disable_server" => toggle_server(server, args, false).await,
        "list_servers" => list_servers(server),
        "search_servers" => search_servers(args),
        "smart_configure" => smart_configure(server, session, args).await,
        "analyze_servers" => analyze_servers(server, session).await,
        "reload_config" => reload_config(server).await,
        "status" => status(server),
        "check" => check(server, args).await,
        "load_kit" => load_kit(server, args).await,
        "unload_kit" => unload_kit(server, args).await,
        "list_kits" => list_kits(server),
        "kit_info" => kit_info(server, args),
        other => Err(MaggError::NotFound(format!("admin tool {other:?}"))),
    }
}

#[derive(Debug, Deserialize)]
struct AddServerArgs {
    name: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    transport: Option<Value>,
    #[serde(default = "default_true")]
    enable: bool,
}

const fn default_true() -> bool {
    true
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, MaggError> {
    serde_json::from_value(args).map_err(|e| MaggError::Validation(e.to_string()))
}

fn required_name(args: &Value) -> Result<String, MaggError> {
    args.get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| MaggError::validation("parameter 'name' is required"))
}

async fn add_server(server: &Arc<MaggServer>, args: Value) -> Result<CallToolResult, MaggError> {
    let parsed: AddServerArgs = parse_args(args)?;

    let config = ServerConfig {
        name: parsed.name.clone(),
        source: parsed.source,
        prefix: parsed.prefix,
        command: parsed.command,
        args: parsed.args,
        uri: parsed.uri,
        env: parsed.env,
        cwd: parsed.cwd,
        transport: parsed.transport,
        notes: parsed.notes,
        kits: Vec::new(),
        enabled: parsed.enable,
    };

    config
        .validate(&server.settings().prefix_sep)
        .map_err(|e| MaggError::Validation(e.to_string()))?;

    let metadata = {
        let config_for_closure = config.clone();
        server
            .mutate_catalog(move |catalog| {
                let config = config_for_closure;
                if catalog.servers.contains_key(&config.name) {
                    return Err(MaggError::Validation(format!(
                        "server {:?} already exists",
                        config.name
                    )));
                }
                let prefix = config.effective_prefix();
                if !prefix.is_empty() {
                    let taken = catalog
                        .enabled_servers()
                        .find(|s| config.enabled && s.effective_prefix() == prefix);
                    if let Some(existing) = taken {
                        return Err(MaggError::Validation(format!(
                            "prefix {prefix:?} is already used by enabled server {:?}",
                            existing.name
                        )));
                    }
                }
                catalog.upsert_server(config.clone());
                Ok(())
            })
            .await?;
        server.server_metadata(&config)
    };

    Ok(tool_json(&json!({"added": metadata})))
}

async fn remove_server(server: &Arc<MaggServer>, args: Value) -> Result<CallToolResult, MaggError> {
    let name = required_name(&args)?;
    server
        .mutate_catalog({
            let name = name.clone();
            move |catalog| {
                catalog
                    .remove_server(&name)
                    .map(|_| ())
                    .ok_or_else(|| MaggError::NotFound(format!("server {name:?}")))
            }
        })
        .await?;
    Ok(tool_json(&json!({"removed": name})))
}

async fn toggle_server(
    server: &Arc<MaggServer>,
    args: Value,
    enabled: bool,
) -> Result<CallToolResult, MaggError> {
    let name = required_name(&args)?;
    server
        .mutate_catalog({
            let name = name.clone();
            move |catalog| {
                let entry = catalog
                    .servers
                    .get_mut(&name)
                    .ok_or_else(|| MaggError::NotFound(format!("server {name:?}")))?;
                entry.enabled = enabled;
                Ok(())
            }
        })
        .await?;
    Ok(tool_json(&json!({"server": name, "enabled": enabled})))
}

fn list_servers(server: &Arc<MaggServer>) -> Result<CallToolResult, MaggError> {
    let catalog = server.catalog();
    let servers: Vec<Value> = catalog
        .servers
        .values()
        .map(|s| server.server_metadata(s))
        .collect();
    Ok(tool_json(&json!({"servers": servers})))
}

fn search_servers(args: Value) -> Result<CallToolResult, MaggError> {
    let query = args
        .get("query")
        .and_then(Value::as_str)
        .ok_or_else(|| MaggError::validation("parameter 'query' is required"))?;

    // Online discovery lives in an external collaborator; without one
    // configured this reports itself honestly instead of guessing.
    Ok(tool_json(&json!({
        "query": query,
        "results": [],
        "configured": false,
        "message": "no discovery backend is configured",
    })))
}

async fn smart_configure(
    server: &Arc<MaggServer>,
    session: &Arc<ClientSession>,
    args: Value,
) -> Result<CallToolResult, MaggError> {
    let uri = args
        .get("uri")
        .and_then(Value::as_str)
        .ok_or_else(|| MaggError::validation("parameter 'uri' is required"))?;

    let prompt = format!(
        "You are configuring an MCP server for an aggregator. Given the \
         source URI below, produce a JSON object with fields: name (short, \
         unique), command and args (for a stdio server) OR uri (for an HTTP \
         server), and optionally prefix, env, cwd, notes. Respond with only \
         the JSON object.\n\nSource URI: {uri}"
    );

    let reply = session.create_message(sampling_request(&prompt, 1024)).await?;
    let text = sampling_reply_text(&reply)
        .ok_or_else(|| MaggError::Protocol("sampling reply carried no text".into()))?;
    let config_json = extract_json_object(&text).ok_or_else(|| {
        MaggError::Validation("sampling reply did not contain a JSON object".into())
    })?;

    let mut add_args = config_json;
    if add_args.get("name").and_then(Value::as_str).is_none() {
        let derived = generate_prefix_from_name(uri);
        add_args["name"] = json!(derived);
    }
    if add_args.get("source").is_none() {
        add_args["source"] = json!(uri);
    }

    add_server(server, add_args).await
}

async fn analyze_servers(
    server: &Arc<MaggServer>,
    session: &Arc<ClientSession>,
) -> Result<CallToolResult, MaggError> {
    let catalog = server.catalog();
    let summary: Vec<Value> = catalog
        .servers
        .values()
        .map(|s| server.server_metadata(s))
        .collect();

    let prompt = format!(
        "Analyze this MCP aggregator configuration. Point out unhealthy \
         servers, name collisions waiting to happen, and redundant \
         entries.\n\n{}",
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    );

    let reply = session.create_message(sampling_request(&prompt, 2048)).await?;
    let text = sampling_reply_text(&reply)
        .ok_or_else(|| MaggError::Protocol("sampling reply carried no text".into()))?;

    Ok(tool_json(&json!({"analysis": text})))
}

async fn reload_config(server: &Arc<MaggServer>) -> Result<CallToolResult, MaggError> {
    let change = server.reload_catalog().await?;
    Ok(tool_json(&json!({
        "reloaded": true,
        "changes": change.summarize(),
    })))
}

fn status(server: &Arc<MaggServer>) -> Result<CallToolResult, MaggError> {
    let catalog = server.catalog();
    let index = server.engine().index();

    let mut states: BTreeMap<&'static str, u32> = BTreeMap::new();
    for handle in server.engine().backends() {
        let key = match handle.state() {
            BackendState::Configured => "configured",
            BackendState::Connecting => "connecting",
            BackendState::Running => "running",
            BackendState::Degraded(_) => "degraded",
            BackendState::Failed(_) => "failed",
            BackendState::Disabled => "disabled",
        };
        *states.entry(key).or_default() += 1;
    }

    let uptime = (chrono::Utc::now() - server.started_at()).num_seconds();
    Ok(tool_json(&json!({
        "version": env!("CARGO_PKG_VERSION"),
        "config_path": server.settings().config_path.display().to_string(),
        "read_only": server.settings().read_only,
        "uptime_seconds": uptime,
        "servers": {
            "configured": catalog.servers.len(),
            "enabled": catalog.enabled_servers().count(),
            "states": states,
        },
        "aggregated": {
            "tools": index.tools.len(),
            "resources": index.resources.len(),
            "resource_templates": index.resource_templates.len(),
            "prompts": index.prompts.len(),
            "collisions": index.collisions,
        },
        "kits": catalog.kits.keys().collect::<Vec<_>>(),
        "sessions": server.coordinator().session_count(),
    })))
}

async fn check(server: &Arc<MaggServer>, args: Value) -> Result<CallToolResult, MaggError> {
    let action = args
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("report");
    if !matches!(action, "report" | "remount" | "unmount" | "disable") {
        return Err(MaggError::Validation(format!(
            "unknown check action {action:?}"
        )));
    }

    let mut healthy = Vec::new();
    let mut unhealthy = Vec::new();
    for handle in server.engine().backends() {
        let name = handle.config().name.clone();
        match handle.probe().await {
            Ok(()) => healthy.push(name),
            Err(e) => unhealthy.push(json!({"name": name, "error": e.to_string()})),
        }
    }

    let mut repaired = Vec::new();
    if action != "report" {
        for entry in &unhealthy {
            let name = entry["name"].as_str().unwrap_or_default().to_string();
            match action {
                "remount" => {
                    if let Some(handle) = server.engine().backend(&name) {
                        let config = handle.config().clone();
                        server.engine().remount(config).await;
                        repaired.push(json!({"name": name, "action": "remount"}));
                    }
                }
                "unmount" => {
                    server.engine().unmount(&name).await;
                    repaired.push(json!({"name": name, "action": "unmount"}));
                }
                "disable" => {
                    let result = server
                        .mutate_catalog({
                            let name = name.clone();
                            move |catalog| {
                                if let Some(entry) = catalog.servers.get_mut(&name) {
                                    entry.enabled = false;
                                }
                                Ok(())
                            }
                        })
                        .await;
                    if result.is_ok() {
                        repaired.push(json!({"name": name, "action": "disable"}));
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    Ok(tool_json(&json!({
        "action": action,
        "healthy": healthy,
        "unhealthy": unhealthy,
        "repaired": repaired,
    })))
}

async fn load_kit(server: &Arc<MaggServer>, args: Value) -> Result<CallToolResult, MaggError> {
    let name = required_name(&args)?;
    let mut report = None;
    server
        .mutate_catalog({
            let name = name.clone();
            let report = &mut report;
            move |catalog| {
                let change = server_kits_load(server, &name, catalog)?;
                *report = Some(change);
                Ok(())
            }
        })
        .await?;
    Ok(tool_json(&json!({"loaded": report})))
}

fn server_kits_load(
    server: &Arc<MaggServer>,
    name: &str,
    catalog: &mut magg_core::Catalog,
) -> Result<crate::kits::KitChange, MaggError> {
    server
        .kits()
        .load_kit(name, catalog)
        .map_err(|e| match e {
            magg_core::KitError::NotFound(k) => MaggError::NotFound(format!("kit {k:?}")),
            other => MaggError::Validation(other.to_string()),
        })
}

async fn unload_kit(server: &Arc<MaggServer>, args: Value) -> Result<CallToolResult, MaggError> {
    let name = required_name(&args)?;
    let mut report = None;
    server
        .mutate_catalog({
            let name = name.clone();
            let report = &mut report;
            move |catalog| {
                let change = server
                    .kits()
                    .unload_kit(&name, catalog)
                    .map_err(|e| match e {
                        magg_core::KitError::NotLoaded(k) => {
                            MaggError::NotFound(format!("kit {k:?} is not loaded"))
                        }
                        other => MaggError::Validation(other.to_string()),
                    })?;
                *report = Some(change);
                Ok(())
            }
        })
        .await?;
    Ok(tool_json(&json!({"unloaded": report})))
}

fn list_kits(server: &Arc<MaggServer>) -> Result<CallToolResult, MaggError> {
    let catalog = server.catalog();
    let listings = server.kits().list_kits(&catalog);
    Ok(tool_json(&json!({"kits": listings})))
}

fn kit_info(server: &Arc<MaggServer>, args: Value) -> Result<CallToolResult, MaggError> {
    let name = required_name(&args)?;
    let catalog = server.catalog();
    let info = server
        .kits()
        .kit_info(&name, &catalog)
        .ok_or_else(|| MaggError::NotFound(format!("kit {name:?}")))?;
    Ok(tool_json(&info))
}

/// Pull the first JSON object out of a model reply that may be wrapped in
/// prose or a code fence.
fn extract_json_object(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..=start + offset];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}
