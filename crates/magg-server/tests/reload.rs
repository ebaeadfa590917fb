//! Reload behavior: external edits, read-only mode, rejected catalogs.

use magg_core::{Catalog, CatalogStore, MaggError, ServerConfig, Settings};
use magg_server::MaggServer;

fn settings_in(dir: &tempfile::TempDir, read_only: bool) -> Settings {
    Settings {
        config_path: dir.path().join("config.json"),
        auto_reload: false,
        read_only,
        ..Settings::default()
    }
}

/// Write a catalog the way an external editor would.
fn write_catalog(dir: &tempfile::TempDir, catalog: &Catalog) {
    // The server's own store may be read-only; use a writable one.
    let store = CatalogStore::new(dir.path().join("config.json"), false, "_");
    store.save(catalog).unwrap();
}

#[tokio::test]
async fn external_edit_applies_in_read_only_mode() {
    let dir = tempfile::tempdir().unwrap();
    let server = MaggServer::new(settings_in(&dir, true)).unwrap();
    server.start().await;
    assert!(server.catalog().servers.is_empty());

    // An external editor rewrites the file; the reload applies it.
    let mut catalog = Catalog::default();
    catalog.upsert_server(ServerConfig::stdio("ext", "/nonexistent/bin"));
    write_catalog(&dir, &catalog);

    let change = server.reload_catalog().await.unwrap();
    assert_eq!(change.added.len(), 1);
    assert!(server.catalog().servers.contains_key("ext"));

    // A concurrent catalog mutation is still refused.
    let err = server.mutate_catalog(|_| Ok(())).await.unwrap_err();
    assert!(matches!(err, MaggError::ReadOnly(_)));

    server.stop().await;
}

#[tokio::test]
async fn invalid_catalog_keeps_previous_one_in_force() {
    let dir = tempfile::tempdir().unwrap();

    let mut catalog = Catalog::default();
    catalog.upsert_server(ServerConfig::stdio("keep", "/nonexistent/bin"));
    write_catalog(&dir, &catalog);

    let server = MaggServer::new(settings_in(&dir, false)).unwrap();
    server.start().await;

    // A server with neither command nor uri rejects the whole file.
    std::fs::write(
        dir.path().join("config.json"),
        r#"{"servers": {"keep": {"command": "/nonexistent/bin"}, "broken": {}}}"#,
    )
    .unwrap();

    let err = server.reload_catalog().await.unwrap_err();
    assert!(matches!(err, MaggError::Validation(_)));

    let current = server.catalog();
    assert!(current.servers.contains_key("keep"));
    assert!(!current.servers.contains_key("broken"));

    server.stop().await;
}

#[tokio::test]
async fn toggle_off_tears_the_backend_down() {
    let dir = tempfile::tempdir().unwrap();

    let mut catalog = Catalog::default();
    catalog.upsert_server(ServerConfig::stdio("flappy", "/nonexistent/bin"));
    write_catalog(&dir, &catalog);

    let server = MaggServer::new(settings_in(&dir, false)).unwrap();
    server.start().await;
    assert!(server.engine().backend("flappy").is_some());

    catalog.servers.get_mut("flappy").unwrap().enabled = false;
    write_catalog(&dir, &catalog);

    let change = server.reload_catalog().await.unwrap();
    assert_eq!(change.toggled.len(), 1);
    assert!(server.engine().backend("flappy").is_none());

    server.stop().await;
}

#[tokio::test]
async fn startup_with_unreadable_catalog_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();

    let err = MaggServer::new(settings_in(&dir, false)).unwrap_err();
    assert!(matches!(err, MaggError::Validation(_)));
}
