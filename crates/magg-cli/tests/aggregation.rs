//! End-to-end aggregation tests.
//!
//! The backend under test is this crate's own binary serving MCP over
//! stdio with an empty catalog — a real child process speaking the real
//! protocol, whose tool set (admin tools plus `proxy`) is known.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use magg_core::{Catalog, CatalogStore, ServerConfig, Settings};
use magg_server::{BackendState, MaggServer};

fn magg_bin() -> String {
    env!("CARGO_BIN_EXE_magg").to_string()
}

/// A ServerConfig that runs `magg serve --mode stdio` as the backend.
fn nested_backend(name: &str, prefix: &str, config_path: &std::path::Path) -> ServerConfig {
    let mut server = ServerConfig::stdio(name, magg_bin());
    server.args = Some(vec![
        "serve".into(),
        "--mode".into(),
        "stdio".into(),
        "--config".into(),
        config_path.display().to_string(),
    ]);
    server.prefix = Some(prefix.to_string());
    server
}

struct Harness {
    _dir: tempfile::TempDir,
    store: CatalogStore,
    server: Arc<MaggServer>,
    inner_config: std::path::PathBuf,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    let inner_config = dir.path().join("inner-config.json");
    std::fs::write(&inner_config, "{\"servers\": {}}\n").unwrap();

    let settings = Settings {
        config_path: config_path.clone(),
        auto_reload: false,
        ..Settings::default()
    };
    let store = CatalogStore::new(config_path, false, "_");

    let mut catalog = Catalog::default();
    catalog.upsert_server(nested_backend("inner", "inner", &inner_config));
    store.save(&catalog).unwrap();

    let server = MaggServer::new(settings).unwrap();
    server.start().await;

    Harness {
        _dir: dir,
        store,
        server,
        inner_config,
    }
}

/// Poll until the named backend reaches a state accepted by `pred`.
async fn wait_for_state(
    server: &Arc<MaggServer>,
    name: &str,
    pred: impl Fn(&BackendState) -> bool,
) -> BackendState {
    for _ in 0..300 {
        if let Some(handle) = server.engine().backend(name) {
            let state = handle.state();
            if pred(&state) {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("backend {name:?} never reached the expected state");
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn backend_mounts_and_tools_are_prefixed() {
    let h = harness().await;

    wait_for_state(&h.server, "inner", |s| *s == BackendState::Running).await;
    wait_until(|| !h.server.engine().index().tools.is_empty()).await;

    let index = h.server.engine().index();
    assert!(
        index.tools.contains_key("inner_magg_status"),
        "missing inner_magg_status in {:?}",
        index.tools.keys().collect::<Vec<_>>()
    );
    assert!(index.tools.contains_key("inner_proxy"));

    h.server.stop().await;
}

#[tokio::test]
async fn calls_are_delegated_through_the_mount_engine() {
    let h = harness().await;
    wait_for_state(&h.server, "inner", |s| *s == BackendState::Running).await;
    wait_until(|| !h.server.engine().index().tools.is_empty()).await;

    let client = h.server.connect_in_process();
    client
        .initialize(magg_mcp::Implementation::new("e2e", "0"))
        .await
        .unwrap();

    let result = client
        .call_tool("inner_magg_status", json!({}), None)
        .await
        .unwrap();
    assert!(!result.is_error);

    let magg_mcp::Content::Text { text, .. } = &result.content[0] else {
        panic!("expected text content");
    };
    let status: Value = serde_json::from_str(text).unwrap();
    assert!(status.get("version").is_some());
    assert_eq!(status["read_only"], json!(false));

    h.server.stop().await;
}

#[tokio::test]
async fn proxy_list_matches_aggregated_index() {
    let h = harness().await;
    wait_for_state(&h.server, "inner", |s| *s == BackendState::Running).await;
    wait_until(|| !h.server.engine().index().tools.is_empty()).await;

    let client = h.server.connect_in_process();
    client
        .initialize(magg_mcp::Implementation::new("e2e", "0"))
        .await
        .unwrap();

    let result = client
        .call_tool("proxy", json!({"action": "list", "type": "tool"}), None)
        .await
        .unwrap();
    assert_eq!(result.content.len(), 1);

    let magg_mcp::Content::Resource {
        resource: magg_mcp::ResourceContents::Text { text, mime_type, .. },
        annotations,
    } = &result.content[0]
    else {
        panic!("expected an embedded resource");
    };
    assert_eq!(mime_type.as_deref(), Some("application/json"));

    let ann = annotations.as_ref().unwrap();
    assert_eq!(ann["proxyAction"], json!("list"));
    assert_eq!(ann["proxyType"], json!("tool"));
    assert_eq!(ann["dataType"], json!("Tool"));
    assert_eq!(ann["many"], json!(true));

    let listed: Vec<Value> = serde_json::from_str(text).unwrap();
    let index = h.server.engine().index();
    assert_eq!(listed.len(), index.tools.len());

    h.server.stop().await;
}

#[tokio::test]
async fn colliding_backend_is_blocked_and_earlier_one_survives() {
    let h = harness().await;
    wait_for_state(&h.server, "inner", |s| *s == BackendState::Running).await;
    wait_until(|| !h.server.engine().index().tools.is_empty()).await;
    let tools_before = h.server.engine().index().tools.len();

    // Add a second backend claiming the same prefix with identical tools.
    let mut catalog = (*h.server.catalog()).clone();
    catalog.upsert_server(nested_backend("zeta", "inner", &h.inner_config));
    h.store.save(&catalog).unwrap();
    h.server.reload_catalog().await.unwrap();

    let state = wait_for_state(&h.server, "zeta", |s| {
        matches!(s, BackendState::Failed(_))
    })
    .await;
    let BackendState::Failed(reason) = state else {
        unreachable!();
    };
    assert!(reason.contains("already published"), "reason: {reason}");

    // The earlier claimant keeps serving and the index is unchanged.
    assert_eq!(
        h.server.engine().backend("inner").unwrap().state(),
        BackendState::Running
    );
    assert_eq!(h.server.engine().index().tools.len(), tools_before);
    assert_eq!(
        h.server.engine().index().tools["inner_magg_status"].server,
        "inner"
    );

    h.server.stop().await;
}

#[tokio::test]
async fn removed_backend_unmounts_on_reload() {
    let h = harness().await;
    wait_for_state(&h.server, "inner", |s| *s == BackendState::Running).await;
    wait_until(|| !h.server.engine().index().tools.is_empty()).await;

    h.store.save(&Catalog::default()).unwrap();
    h.server.reload_catalog().await.unwrap();

    assert!(h.server.engine().backend("inner").is_none());
    wait_until(|| h.server.engine().index().tools.is_empty()).await;

    let client = h.server.connect_in_process();
    client
        .initialize(magg_mcp::Implementation::new("e2e", "0"))
        .await
        .unwrap();
    let err = client
        .call_tool("inner_magg_status", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, magg_mcp::McpError::Server { .. }));

    h.server.stop().await;
}

#[tokio::test]
async fn admin_add_server_mounts_a_new_backend() {
    let h = harness().await;
    wait_for_state(&h.server, "inner", |s| *s == BackendState::Running).await;

    let client = h.server.connect_in_process();
    client
        .initialize(magg_mcp::Implementation::new("e2e", "0"))
        .await
        .unwrap();

    // A distinct self-prefix keeps the nested aggregator's own resource
    // URIs from colliding with the first backend's.
    let result = client
        .call_tool(
            "magg_add_server",
            json!({
                "name": "extra",
                "command": magg_bin(),
                "args": ["serve", "--mode", "stdio", "--config",
                         h.inner_config.display().to_string()],
                "prefix": "extra",
                "env": {"MAGG_SELF_PREFIX": "aux"},
            }),
            None,
        )
        .await
        .unwrap();
    assert!(!result.is_error);

    wait_for_state(&h.server, "extra", |s| *s == BackendState::Running).await;
    wait_until(|| h.server.engine().index().tools.contains_key("extra_aux_status")).await;

    // The save went to disk too.
    let on_disk = h.store.load().unwrap();
    assert!(on_disk.servers.contains_key("extra"));

    h.server.stop().await;
}
