//! Catalog-editing commands: list, add, remove.
//!
//! These edit the catalog file directly; a running aggregator with
//! auto-reload picks the change up through its watcher.

use std::collections::BTreeMap;

use magg_core::{CatalogStore, ServerConfig, Settings};

use crate::commands::AddServerArgs;

fn store(settings: &Settings) -> CatalogStore {
    CatalogStore::new(
        settings.config_path.clone(),
        settings.read_only,
        settings.prefix_sep.clone(),
    )
}

pub fn list(settings: &Settings) -> anyhow::Result<()> {
    let catalog = store(settings).load()?;

    if catalog.servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    for server in catalog.servers.values() {
        let target = server
            .command
            .as_deref()
            .or(server.uri.as_deref())
            .unwrap_or("-");
        let flag = if server.enabled { "enabled" } else { "disabled" };
        println!(
            "{:<20} prefix={:<16} {:<9} {}",
            server.name,
            server.effective_prefix(),
            flag,
            target
        );
    }
    Ok(())
}

pub fn add(settings: &Settings, args: &AddServerArgs) -> anyhow::Result<()> {
    let env = parse_env(&args.env)?;

    let config = ServerConfig {
        name: args.name.clone(),
        prefix: args.prefix.clone(),
        command: args.command.clone(),
        args: if args.args.is_empty() {
            None
        } else {
            Some(args.args.clone())
        },
        uri: args.uri.clone(),
        env,
        cwd: args.cwd.clone(),
        notes: args.notes.clone(),
        enabled: !args.disabled,
        ..ServerConfig::default()
    };
    config
        .validate(&settings.prefix_sep)
        .map_err(|e| anyhow::anyhow!(e))?;

    let store = store(settings);
    let mut catalog = store.load()?;
    anyhow::ensure!(
        !catalog.servers.contains_key(&args.name),
        "server {:?} already exists",
        args.name
    );
    catalog.upsert_server(config);
    store.save(&catalog)?;

    println!("Added server {:?}", args.name);
    Ok(())
}

pub fn remove(settings: &Settings, name: &str) -> anyhow::Result<()> {
    let store = store(settings);
    let mut catalog = store.load()?;
    anyhow::ensure!(
        catalog.remove_server(name).is_some(),
        "server {name:?} not found"
    );
    store.save(&catalog)?;

    println!("Removed server {name:?}");
    Ok(())
}

fn parse_env(entries: &[String]) -> anyhow::Result<Option<BTreeMap<String, String>>> {
    if entries.is_empty() {
        return Ok(None);
    }
    let mut env = BTreeMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid env entry {entry:?}, expected KEY=VALUE"))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(Some(env))
}
