//! MCP wire layer for the magg aggregator.
//!
//! JSON-RPC framing, MCP entity types, the concrete transports (stdio child
//! process, HTTP/streamable, in-process), and the async client used to
//! drive backends.

#![deny(unsafe_code)]

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod types;

pub use client::{McpClient, RawNotification, DEFAULT_REQUEST_TIMEOUT};
pub use error::McpError;
pub use protocol::{ErrorObject, Message, Notification, Request, RequestId, Response};
pub use transport::{
    in_process_pair, select_transport, EnvInheritance, TransportGuard, TransportHandle,
    TransportKind, TransportOptions,
};
pub use types::{
    Annotations, CallToolResult, ClientCapabilities, Content, GetPromptResult, Implementation,
    InitializeResult, ListChangedCapability, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, Prompt, PromptArgument, PromptMessage,
    ReadResourceResult, ResourceContents, ResourceInfo, ResourceTemplate, ResourcesCapability,
    ServerCapabilities, Tool,
};
