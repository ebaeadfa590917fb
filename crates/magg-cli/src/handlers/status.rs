//! The `status` command: catalog summary without a running server.

use magg_core::{CatalogStore, Settings};

pub fn execute(settings: &Settings) -> anyhow::Result<()> {
    let store = CatalogStore::new(
        settings.config_path.clone(),
        settings.read_only,
        settings.prefix_sep.clone(),
    );
    let catalog = store.load()?;

    let enabled = catalog.enabled_servers().count();
    println!("Config:     {}", settings.config_path.display());
    println!(
        "Servers:    {} configured, {} enabled",
        catalog.servers.len(),
        enabled
    );
    println!(
        "Kits:       {}",
        if catalog.kits.is_empty() {
            "none".to_string()
        } else {
            catalog.kits.keys().cloned().collect::<Vec<_>>().join(", ")
        }
    );
    println!("Read-only:  {}", settings.read_only);
    println!("Self prefix: {} (separator {:?})", settings.self_prefix, settings.prefix_sep);
    Ok(())
}
