//! The `proxy` meta-tool: dynamic list/info/call access over every
//! capability the aggregator publishes.
//!
//! Query actions (`list`, `info`) return a single embedded JSON resource
//! annotated with `proxyAction`/`proxyType` (plus `proxyPath` for `info`),
//! a `dataType` tag and a `many` flag, so clients can reconstruct typed
//! views. `call` delegates to the owning backend and annotates the results;
//! text resources whose bodies parse as JSON are canonically re-encoded as
//! `application/json` with the original MIME preserved in `contentType`.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use magg_core::MaggError;
use magg_mcp::{Annotations, CallToolResult, Content, ResourceContents, Tool};

use crate::coordinator::SessionId;
use crate::mount::CapabilityKind;
use crate::server::MaggServer;

/// The tool's published name.
pub const PROXY_TOOL_NAME: &str = "proxy";

/// Type tags reported in the `dataType` annotation.
const DATA_TYPE_TOOL: &str = "Tool";
const DATA_TYPE_RESOURCE: &str = "Resource|ResourceTemplate";
const DATA_TYPE_PROMPT: &str = "Prompt";

/// Definition advertised in `tools/list`.
#[must_use]
pub fn proxy_tool_definition() -> Tool {
    Tool::new(PROXY_TOOL_NAME)
        .with_description(
            "Dynamic access to aggregated capabilities: list, inspect, or \
             call tools, resources and prompts across all mounted servers",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "info", "call"],
                    "description": "Action to perform",
                },
                "type": {
                    "type": "string",
                    "enum": ["tool", "resource", "prompt"],
                    "description": "Kind of capability to operate on",
                },
                "path": {
                    "type": "string",
                    "description": "Aggregated name or URI; required for info and call",
                },
                "args": {
                    "type": "object",
                    "description": "Arguments for a call action",
                },
            },
            "required": ["action", "type"],
            "additionalProperties": false,
        }))
}

/// Execute one proxy tool invocation. `origin` is the session the proxy
/// call arrived on, threaded through delegated calls for cancel routing.
pub async fn run_proxy_tool(
    server: &Arc<MaggServer>,
    origin: Option<SessionId>,
    args: Value,
    cancel: CancellationToken,
) -> Result<CallToolResult, MaggError> {
    let action = required_str(&args, "action")?;
    let a_type = required_str(&args, "type")?;
    let path = args.get("path").and_then(Value::as_str).map(ToString::to_string);
    let call_args = args.get("args").cloned();

    if !matches!(action.as_str(), "list" | "info" | "call") {
        return Err(MaggError::Validation(format!(
            "invalid proxy action {action:?}"
        )));
    }
    if !matches!(a_type.as_str(), "tool" | "resource" | "prompt") {
        return Err(MaggError::Validation(format!(
            "invalid proxy type {a_type:?}"
        )));
    }
    // Strict parameter matrix, checked before any dispatch.
    match action.as_str() {
        "list" => {
            if path.is_some() {
                return Err(MaggError::validation(
                    "parameter 'path' is not allowed for action 'list'",
                ));
            }
            if call_args.is_some() {
                return Err(MaggError::validation(
                    "parameter 'args' is not allowed for action 'list'",
                ));
            }
        }
        "info" => {
            if path.is_none() {
                return Err(MaggError::validation(
                    "parameter 'path' is required for action 'info'",
                ));
            }
            if call_args.is_some() {
                return Err(MaggError::validation(
                    "parameter 'args' is not allowed for action 'info'",
                ));
            }
        }
        "call" => {
            if path.is_none() {
                return Err(MaggError::validation(
                    "parameter 'path' is required for action 'call'",
                ));
            }
        }
        _ => unreachable!(),
    }

    match action.as_str() {
        "list" => proxy_list(server, &a_type),
        "info" => proxy_info(server, &a_type, &path.unwrap_or_default()),
        "call" => {
            proxy_call(
                server,
                origin,
                &a_type,
                &path.unwrap_or_default(),
                call_args.unwrap_or_else(|| json!({})),
                cancel,
            )
            .await
        }
        _ => unreachable!(),
    }
}

fn required_str(args: &Value, key: &str) -> Result<String, MaggError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| MaggError::Validation(format!("parameter {key:?} is required")))
}

fn data_type(a_type: &str) -> &'static str {
    match a_type {
        "tool" => DATA_TYPE_TOOL,
        "resource" => DATA_TYPE_RESOURCE,
        _ => DATA_TYPE_PROMPT,
    }
}

/// Capability metadata for one kind, in aggregated form.
fn gather(server: &Arc<MaggServer>, a_type: &str) -> Vec<Value> {
    let index = server.engine().index();
    match a_type {
        "tool" => index.tools.values().map(|e| e.definition.clone()).collect(),
        "resource" => {
            // Resources and templates travel together, like a native
            // resources/list + resources/templates/list pair.
            let mut out: Vec<Value> =
                index.resources.values().map(|e| e.definition.clone()).collect();
            out.extend(index.resource_templates.values().map(|e| e.definition.clone()));
            out
        }
        _ => index.prompts.values().map(|e| e.definition.clone()).collect(),
    }
}

fn proxy_list(server: &Arc<MaggServer>, a_type: &str) -> Result<CallToolResult, MaggError> {
    let items = gather(server, a_type);
    let annotations = proxy_annotations(&[
        ("proxyAction", json!("list")),
        ("proxyType", json!(a_type)),
        ("dataType", json!(data_type(a_type))),
        ("many", json!(true)),
    ]);

    Ok(CallToolResult {
        content: vec![embed_json(
            format!("proxy:list/{a_type}"),
            &Value::Array(items),
            annotations,
        )],
        is_error: false,
    })
}

fn proxy_info(
    server: &Arc<MaggServer>,
    a_type: &str,
    path: &str,
) -> Result<CallToolResult, MaggError> {
    let items = gather(server, a_type);
    let found = items.into_iter().find(|item| {
        item.get("name").and_then(Value::as_str) == Some(path)
            || item.get("uri").and_then(Value::as_str) == Some(path)
            || item.get("uriTemplate").and_then(Value::as_str) == Some(path)
    });

    let item = found.ok_or_else(|| MaggError::NotFound(format!("{a_type} {path:?}")))?;

    let annotations = proxy_annotations(&[
        ("proxyAction", json!("info")),
        ("proxyType", json!(a_type)),
        ("proxyPath", json!(path)),
        ("dataType", json!(data_type(a_type))),
        ("many", json!(false)),
    ]);

    Ok(CallToolResult {
        content: vec![embed_json(
            format!("proxy:info/{a_type}/{path}"),
            &item,
            annotations,
        )],
        is_error: false,
    })
}

async fn proxy_call(
    server: &Arc<MaggServer>,
    origin: Option<SessionId>,
    a_type: &str,
    path: &str,
    args: Value,
    cancel: CancellationToken,
) -> Result<CallToolResult, MaggError> {
    let annotations = proxy_annotations(&[
        ("proxyAction", json!("call")),
        ("proxyType", json!(a_type)),
        ("proxyPath", json!(path)),
    ]);

    match a_type {
        "tool" => {
            let mut result = server.engine().call_tool(path, args, cancel, origin).await?;
            for item in &mut result.content {
                item.annotate(&annotations);
            }
            Ok(result)
        }
        "resource" => {
            let result = server.engine().read_resource(path, cancel, origin).await?;
            let content = result
                .contents
                .into_iter()
                .map(|contents| Content::Resource {
                    resource: objectify(contents),
                    annotations: Some(annotations.clone()),
                })
                .collect();
            Ok(CallToolResult {
                content,
                is_error: false,
            })
        }
        _ => {
            let result = server.engine().get_prompt(path, args, cancel, origin).await?;
            let payload =
                serde_json::to_value(result).map_err(|e| MaggError::Protocol(e.to_string()))?;
            Ok(CallToolResult {
                content: vec![embed_json(format!("urn:prompt:{path}"), &payload, annotations)],
                is_error: false,
            })
        }
    }
}

fn proxy_annotations(pairs: &[(&str, Value)]) -> Annotations {
    let mut map = Annotations::new();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

/// Embed a JSON payload as a text resource content item.
fn embed_json(uri: String, payload: &Value, annotations: Annotations) -> Content {
    Content::Resource {
        resource: ResourceContents::Text {
            uri,
            mime_type: Some("application/json".to_string()),
            text: payload.to_string(),
            content_type: None,
        },
        annotations: Some(annotations),
    }
}

/// Canonical JSON re-encoding for text resources that parse as JSON. The
/// original MIME survives in `contentType`; binary payloads pass through.
fn objectify(contents: ResourceContents) -> ResourceContents {
    match contents {
        ResourceContents::Text {
            uri,
            mime_type,
            text,
            content_type,
        } => {
            let already_json = mime_type.as_deref() == Some("application/json");
            if already_json {
                return ResourceContents::Text {
                    uri,
                    mime_type,
                    text,
                    content_type,
                };
            }
            match serde_json::from_str::<Value>(&text) {
                Ok(decoded) => ResourceContents::Text {
                    uri,
                    mime_type: Some("application/json".to_string()),
                    text: decoded.to_string(),
                    content_type: mime_type,
                },
                Err(_) => ResourceContents::Text {
                    uri,
                    mime_type,
                    text,
                    content_type,
                },
            }
        }
        blob @ ResourceContents::Blob { .. } => blob,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MaggServer;
    use magg_core::Settings;

    fn test_server() -> (tempfile::TempDir, Arc<MaggServer>) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            config_path: dir.path().join(".magg/config.json"),
            auto_reload: false,
            ..Settings::default()
        };
        let server = MaggServer::new(settings).unwrap();
        (dir, server)
    }

    fn annotations_of(content: &Content) -> &Annotations {
        content.annotations().expect("annotated")
    }

    #[tokio::test]
    async fn list_returns_one_embedded_json_resource() {
        let (_dir, server) = test_server();
        server.start().await;

        let result = run_proxy_tool(
            &server,
            None,
            json!({"action": "list", "type": "tool"}),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.content.len(), 1);
        let item = &result.content[0];
        let ann = annotations_of(item);
        assert_eq!(ann["proxyAction"], json!("list"));
        assert_eq!(ann["proxyType"], json!("tool"));
        assert_eq!(ann["dataType"], json!("Tool"));
        assert_eq!(ann["many"], json!(true));

        let Content::Resource {
            resource: ResourceContents::Text { text, mime_type, .. },
            ..
        } = item
        else {
            panic!("expected embedded text resource");
        };
        assert_eq!(mime_type.as_deref(), Some("application/json"));

        // Empty catalog: the list decodes to an array of the aggregated
        // index's tools, which is empty.
        let decoded: Value = serde_json::from_str(text).unwrap();
        assert_eq!(decoded, json!([]));

        server.stop().await;
    }

    #[tokio::test]
    async fn parameter_matrix_is_strict() {
        let (_dir, server) = test_server();
        server.start().await;
        let cancel = CancellationToken::new;

        for bad in [
            json!({"action": "list", "type": "tool", "path": "x"}),
            json!({"action": "list", "type": "tool", "args": {}}),
            json!({"action": "info", "type": "tool"}),
            json!({"action": "info", "type": "tool", "path": "x", "args": {}}),
            json!({"action": "call", "type": "tool"}),
            json!({"action": "describe", "type": "tool"}),
            json!({"action": "list", "type": "gadget"}),
            json!({"type": "tool"}),
            json!({"action": "list"}),
        ] {
            let err = run_proxy_tool(&server, None, bad, cancel()).await.unwrap_err();
            assert!(matches!(err, MaggError::Validation(_)), "{err}");
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn info_for_unknown_capability_is_not_found() {
        let (_dir, server) = test_server();
        server.start().await;

        let err = run_proxy_tool(
            &server,
            None,
            json!({"action": "info", "type": "prompt", "path": "ghost"}),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MaggError::NotFound(_)));

        server.stop().await;
    }

    #[test]
    fn objectify_reencodes_json_text() {
        let contents = ResourceContents::Text {
            uri: "file:///data".into(),
            mime_type: Some("text/plain".into()),
            text: "{\"a\":  1}".into(),
            content_type: None,
        };
        let ResourceContents::Text {
            mime_type,
            text,
            content_type,
            ..
        } = objectify(contents)
        else {
            panic!("expected text");
        };
        assert_eq!(mime_type.as_deref(), Some("application/json"));
        assert_eq!(content_type.as_deref(), Some("text/plain"));
        assert_eq!(text, "{\"a\":1}");
    }

    #[test]
    fn objectify_leaves_non_json_and_blobs_alone() {
        let plain = ResourceContents::Text {
            uri: "file:///notes".into(),
            mime_type: Some("text/plain".into()),
            text: "just words".into(),
            content_type: None,
        };
        let ResourceContents::Text {
            mime_type, text, ..
        } = objectify(plain)
        else {
            panic!("expected text");
        };
        assert_eq!(mime_type.as_deref(), Some("text/plain"));
        assert_eq!(text, "just words");

        let blob = ResourceContents::Blob {
            uri: "file:///img".into(),
            mime_type: Some("image/png".into()),
            blob: "aGk=".into(),
        };
        assert!(matches!(objectify(blob), ResourceContents::Blob { .. }));
    }
}
