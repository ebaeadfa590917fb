//! Domain types for the magg MCP aggregator.
//!
//! This crate holds everything that is pure data plus the catalog store:
//! server configurations and their diffing, kit bundles, runtime settings,
//! notification envelopes, and the shared error taxonomy. No networking and
//! no async — infrastructure lives in `magg-mcp` and `magg-server`.

pub mod catalog;
pub mod error;
pub mod kit;
pub mod notification;
pub mod settings;

pub use catalog::{
    diff, generate_prefix_from_name, is_valid_server_name, validate_prefix, Catalog, CatalogDiff,
    CatalogError, CatalogStore, ServerConfig, DEFAULT_PREFIX_SEP,
};
pub use error::MaggError;
pub use kit::{KitConfig, KitError, KitInfo};
pub use notification::{NotificationEnvelope, NotificationKind};
pub use settings::{Settings, SettingsError, WatchMode, DEFAULT_SELF_PREFIX};
