//! The magg aggregator: an MCP server that mounts many downstream MCP
//! servers behind one endpoint.
//!
//! Subsystems:
//! - [`backend`]: one owning task per downstream connection, with health
//!   probes and reconnect backoff;
//! - [`mount`]: the name→backend map and the aggregated capability index;
//! - [`coordinator`]: notification fan-in/fan-out with coalescing;
//! - [`proxy`]: the `proxy` meta-tool;
//! - [`server`]: the outward MCP surface, admin tools and dispatch;
//! - [`watcher`] / [`kits`] / [`auth`]: config reload, kit bundles, bearer
//!   tokens;
//! - [`http`]: the axum transport.

#![deny(unsafe_code)]

pub mod admin;
pub mod auth;
pub mod backend;
pub mod coordinator;
pub mod http;
pub mod kits;
pub mod mount;
pub mod proxy;
pub mod server;
pub mod session;
pub mod watcher;

pub use auth::BearerAuth;
pub use backend::{BackendEvent, BackendHandle, BackendOptions, BackendState};
pub use coordinator::{NotificationCoordinator, OutboundNotification, SessionId};
pub use kits::KitManager;
pub use mount::{AggregatedIndex, CapabilityKind, MountEngine};
pub use server::{serve_stdio, MaggServer};
pub use watcher::{spawn_watcher, ConfigWatcher, ReloadRequester, ReloadTrigger};
