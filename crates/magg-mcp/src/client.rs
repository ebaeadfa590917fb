//! Async MCP client.
//!
//! One router task per connection reads inbound frames and routes them:
//! responses to the pending-request map, notifications to the owner's
//! channel, reverse requests (ping) to an immediate reply. Requests are
//! issued from any task through the outbound channel; per-request timeouts
//! and cancellation are enforced here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::McpError;
use crate::protocol::{self, Message, Notification, Request, RequestId, Response};
use crate::transport::{TransportGuard, TransportHandle, TransportKind};
use crate::types::{
    CallToolResult, ClientCapabilities, GetPromptResult, Implementation, InitializeResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Prompt,
    ReadResourceResult, ResourceInfo, ResourceTemplate, Tool,
};

/// Default budget for a downstream request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A notification received from the backend: method plus params.
pub type RawNotification = (String, Option<Value>);

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, McpError>>>>>;

/// Client side of one MCP connection.
pub struct McpClient {
    outbound: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicI64,
    initialize_result: Mutex<Option<InitializeResult>>,
    /// Cancelled when the router sees the transport close.
    closed: CancellationToken,
    guard: TransportGuard,
    request_timeout: Duration,
}

impl McpClient {
    /// Take ownership of a transport and start the router task.
    ///
    /// Notifications are forwarded to `notifications`; dropping that
    /// receiver silently discards them.
    #[must_use]
    pub fn connect(
        transport: TransportHandle,
        notifications: mpsc::Sender<RawNotification>,
    ) -> Self {
        let TransportHandle {
            outbound,
            inbound,
            guard,
        } = transport;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let router_pending = Arc::clone(&pending);
        let router_closed = closed.clone();
        let router_outbound = outbound.clone();
        tokio::spawn(async move {
            route_inbound(inbound, router_pending, notifications, router_outbound).await;
            router_closed.cancel();
        });

        Self {
            outbound,
            pending,
            next_id: AtomicI64::new(1),
            initialize_result: Mutex::new(None),
            closed,
            guard,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the default per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn transport_kind(&self) -> TransportKind {
        self.guard.kind()
    }

    #[must_use]
    pub const fn child_pid(&self) -> Option<u32> {
        self.guard.child_pid()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Server info captured at initialize.
    #[must_use]
    pub fn initialize_result(&self) -> Option<InitializeResult> {
        self.initialize_result.lock().expect("poisoned").clone()
    }

    /// Perform the MCP handshake and send `notifications/initialized`.
    pub async fn initialize(&self, client_info: Implementation) -> Result<InitializeResult, McpError> {
        let params = json!({
            "protocolVersion": protocol::PROTOCOL_VERSION,
            "capabilities": ClientCapabilities::default(),
            "clientInfo": client_info,
        });

        let value = self
            .request("initialize", Some(params), self.request_timeout, None)
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;

        *self.initialize_result.lock().expect("poisoned") = Some(result.clone());

        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// List tools; empty when the server does not advertise the capability.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        if !self.has_capability(|c| c.capabilities.tools.is_some()) {
            return Ok(Vec::new());
        }
        let value = self
            .request("tools/list", None, self.request_timeout, None)
            .await?;
        let result: ListToolsResult = serde_json::from_value(value)?;
        Ok(result.tools)
    }

    /// List resources; empty without the capability.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, McpError> {
        if !self.has_capability(|c| c.capabilities.resources.is_some()) {
            return Ok(Vec::new());
        }
        let value = self
            .request("resources/list", None, self.request_timeout, None)
            .await?;
        let result: ListResourcesResult = serde_json::from_value(value)?;
        Ok(result.resources)
    }

    /// List resource templates; empty without the capability or when the
    /// server does not implement the method.
    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>, McpError> {
        if !self.has_capability(|c| c.capabilities.resources.is_some()) {
            return Ok(Vec::new());
        }
        match self
            .request("resources/templates/list", None, self.request_timeout, None)
            .await
        {
            Ok(value) => {
                let result: ListResourceTemplatesResult = serde_json::from_value(value)?;
                Ok(result.resource_templates)
            }
            // Optional method: treat method-not-found as empty.
            Err(McpError::Server { code, .. }) if code == protocol::code::METHOD_NOT_FOUND => {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// List prompts; empty without the capability.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, McpError> {
        if !self.has_capability(|c| c.capabilities.prompts.is_some()) {
            return Ok(Vec::new());
        }
        let value = self
            .request("prompts/list", None, self.request_timeout, None)
            .await?;
        let result: ListPromptsResult = serde_json::from_value(value)?;
        Ok(result.prompts)
    }

    /// Call a tool. Cancellation propagates downstream as
    /// `notifications/cancelled` before the error is returned.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<CallToolResult, McpError> {
        self.call_tool_with_id(self.allocate_request_id(), name, arguments, cancel)
            .await
    }

    /// Call a tool under a pre-allocated request id, so the caller can
    /// correlate backend-originated `notifications/cancelled` with the
    /// request before it is in flight.
    pub async fn call_tool_with_id(
        &self,
        id: i64,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<CallToolResult, McpError> {
        let params = json!({"name": name, "arguments": arguments});
        let value = self
            .request_with_id(id, "tools/call", Some(params), self.request_timeout, cancel)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Read a resource by URI.
    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReadResourceResult, McpError> {
        self.read_resource_with_id(self.allocate_request_id(), uri, cancel)
            .await
    }

    /// Read a resource under a pre-allocated request id.
    pub async fn read_resource_with_id(
        &self,
        id: i64,
        uri: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReadResourceResult, McpError> {
        let params = json!({"uri": uri});
        let value = self
            .request_with_id(id, "resources/read", Some(params), self.request_timeout, cancel)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetch a prompt with arguments.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<GetPromptResult, McpError> {
        self.get_prompt_with_id(self.allocate_request_id(), name, arguments, cancel)
            .await
    }

    /// Fetch a prompt under a pre-allocated request id.
    pub async fn get_prompt_with_id(
        &self,
        id: i64,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<GetPromptResult, McpError> {
        let params = json!({"name": name, "arguments": arguments});
        let value = self
            .request_with_id(id, "prompts/get", Some(params), self.request_timeout, cancel)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Subscribe to updates for one resource URI.
    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        self.request(
            "resources/subscribe",
            Some(json!({"uri": uri})),
            self.request_timeout,
            None,
        )
        .await
        .map(|_| ())
    }

    /// Cheap health probe: a capability list with a tight budget.
    pub async fn probe(&self, timeout: Duration) -> Result<(), McpError> {
        self.request("tools/list", None, timeout, None).await.map(|_| ())
    }

    /// Send a notification frame.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let frame = Message::Notification(Notification::new(method, params)).to_line()?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| McpError::Closed)
    }

    /// Close the connection: the router stops and the transport shuts down.
    pub fn close(&self) {
        self.closed.cancel();
        self.guard.close();
        self.fail_pending();
    }

    fn has_capability(&self, check: impl Fn(&InitializeResult) -> bool) -> bool {
        self.initialize_result
            .lock()
            .expect("poisoned")
            .as_ref()
            .is_some_and(check)
    }

    fn fail_pending(&self) {
        let mut pending = self.pending.lock().expect("poisoned");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(McpError::Closed));
        }
    }

    /// Reserve the next outbound request id.
    #[must_use]
    pub fn allocate_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Issue one request and await its response.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        self.request_with_id(self.allocate_request_id(), method, params, timeout, cancel)
            .await
    }

    /// Issue one request under a caller-chosen id.
    async fn request_with_id(
        &self,
        id: i64,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        if self.closed.is_cancelled() {
            return Err(McpError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("poisoned").insert(id, tx);

        let frame = Message::Request(Request::new(id, method, params)).to_line()?;
        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().expect("poisoned").remove(&id);
            return Err(McpError::Closed);
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            reply = rx => reply.map_err(|_| McpError::Closed)?,
            () = tokio::time::sleep(timeout) => {
                self.pending.lock().expect("poisoned").remove(&id);
                Err(McpError::Timeout(timeout))
            }
            () = cancelled => {
                self.pending.lock().expect("poisoned").remove(&id);
                let _ = self
                    .notify("notifications/cancelled", Some(json!({"requestId": id})))
                    .await;
                Err(McpError::Cancelled)
            }
            () = self.closed.cancelled() => {
                self.pending.lock().expect("poisoned").remove(&id);
                Err(McpError::Closed)
            }
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.closed.cancel();
        self.guard.close();
    }
}

/// Router loop: runs until the transport's inbound channel closes.
async fn route_inbound(
    mut inbound: mpsc::Receiver<String>,
    pending: PendingMap,
    notifications: mpsc::Sender<RawNotification>,
    outbound: mpsc::Sender<String>,
) {
    while let Some(frame) = inbound.recv().await {
        let message = match Message::parse(&frame) {
            Ok(m) => m,
            Err(_) => {
                // Startup banners and stray prints from npx-style launchers.
                tracing::trace!(frame = %frame, "skipping non-JSON-RPC frame");
                continue;
            }
        };

        match message {
            Message::Response(response) => dispatch_response(&pending, response),
            Message::Notification(notification) => {
                let _ = notifications
                    .send((notification.method, notification.params))
                    .await;
            }
            Message::Request(request) => {
                // Reverse requests: answer pings, refuse everything else.
                let reply = if request.method == "ping" {
                    Response::ok(request.id, json!({}))
                } else {
                    Response::err(
                        request.id,
                        crate::protocol::ErrorObject::method_not_found(&request.method),
                    )
                };
                if let Ok(line) = Message::Response(reply).to_line() {
                    let _ = outbound.send(line).await;
                }
            }
        }
    }

    // Transport closed: fail whatever is still waiting.
    let mut pending = pending.lock().expect("poisoned");
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(McpError::Closed));
    }
}

fn dispatch_response(pending: &PendingMap, response: Response) {
    let RequestId::Number(id) = response.id else {
        tracing::debug!("response with non-numeric id ignored");
        return;
    };

    let Some(tx) = pending.lock().expect("poisoned").remove(&id) else {
        // Late reply after timeout or cancellation.
        tracing::trace!(id, "response for unknown request");
        return;
    };

    let outcome = match response.error {
        Some(err) => Err(McpError::Server {
            code: err.code,
            message: err.message,
            data: err.data,
        }),
        None => match response.result {
            Some(value) => Ok(value),
            None => Err(McpError::Protocol("response has neither result nor error".into())),
        },
    };

    let _ = tx.send(outcome);
}
