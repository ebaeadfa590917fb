//! Backend connections: one owning task per downstream server.
//!
//! The task drives the state machine, owns the transport, and serializes
//! all I/O: external callers enqueue [`BackendCommand`]s and get replies on
//! oneshot channels, which makes requests FIFO per backend. The capability
//! snapshot is read through a copy-on-write pointer; callers always see an
//! immutable view.
//!
//! State machine:
//!
//! ```text
//! CONFIGURED ──enable──▶ CONNECTING ──ok──▶ RUNNING
//!                              │               │
//!                              │ err           │ disconnect
//!                              ▼               ▼
//!                          FAILED ◀──retry── DEGRADED
//!                              │               │
//!                              └───── disable ─┘──▶ DISABLED
//! ```

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use magg_core::{MaggError, NotificationEnvelope, NotificationKind, ServerConfig};
use magg_mcp::{
    select_transport, CallToolResult, GetPromptResult, Implementation, McpClient, McpError,
    ReadResourceResult, TransportOptions,
};

use crate::coordinator::SessionId;

/// Health probe budget.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between health probes while running.
pub const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// First reconnect delay; doubles each attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Reconnect delay ceiling.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Reconnect attempts before giving up and parking in `Failed`.
pub const DEFAULT_RECONNECT_BUDGET: u32 = 8;

/// Backend lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum BackendState {
    /// Known but not yet started.
    Configured,
    /// Transport coming up, handshake in flight.
    Connecting,
    /// Healthy and serving.
    Running,
    /// Transport lost; reconnecting with backoff.
    Degraded(String),
    /// Reconnect budget exhausted, or blocked by a name collision.
    Failed(String),
    /// Disabled by config or removed.
    Disabled,
}

impl BackendState {
    /// Whether capabilities from this backend belong in the aggregated
    /// index.
    #[must_use]
    pub const fn is_mountable(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Immutable capability snapshot fetched from a backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CapabilitySnapshot {
    pub tools: Vec<magg_mcp::Tool>,
    pub resources: Vec<magg_mcp::ResourceInfo>,
    pub resource_templates: Vec<magg_mcp::ResourceTemplate>,
    pub prompts: Vec<magg_mcp::Prompt>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Requests serviced by the backend's owning task, in arrival order.
/// `origin` names the client session a request is issued for, so
/// backend-originated `cancelled` notifications can be routed back 1:1.
pub enum BackendCommand {
    CallTool {
        name: String,
        arguments: Value,
        cancel: CancellationToken,
        origin: Option<SessionId>,
        reply: oneshot::Sender<Result<CallToolResult, MaggError>>,
    },
    ReadResource {
        uri: String,
        cancel: CancellationToken,
        origin: Option<SessionId>,
        reply: oneshot::Sender<Result<ReadResourceResult, MaggError>>,
    },
    GetPrompt {
        name: String,
        arguments: Value,
        cancel: CancellationToken,
        origin: Option<SessionId>,
        reply: oneshot::Sender<Result<GetPromptResult, MaggError>>,
    },
    SubscribeResource {
        uri: String,
        reply: oneshot::Sender<Result<(), MaggError>>,
    },
    Probe {
        reply: oneshot::Sender<Result<(), MaggError>>,
    },
    Shutdown,
}

/// Events the backend task publishes to the server core.
#[derive(Debug)]
pub enum BackendEvent {
    StateChanged {
        server: String,
        state: BackendState,
    },
    Notification(NotificationEnvelope),
    /// A downstream request went out on behalf of a session; the pair
    /// `(server, request_id)` keys `cancelled` routing.
    RequestIssued {
        server: String,
        request_id: i64,
        session: SessionId,
    },
    /// The downstream request settled; the routing entry can go.
    RequestSettled {
        server: String,
        request_id: i64,
    },
}

/// Tunables handed to each backend task.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub transport: TransportOptions,
    pub reconnect_budget: u32,
    pub probe_interval: Duration,
    pub client_info: Implementation,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            transport: TransportOptions::default(),
            reconnect_budget: DEFAULT_RECONNECT_BUDGET,
            probe_interval: HEALTH_PROBE_INTERVAL,
            client_info: Implementation::new("magg", env!("CARGO_PKG_VERSION")),
        }
    }
}

struct BackendShared {
    state: Mutex<BackendState>,
    snapshot: RwLock<Arc<CapabilitySnapshot>>,
    last_healthy: Mutex<Option<DateTime<Utc>>>,
}

/// Handle to a running backend task. Owned exclusively by the mount engine.
pub struct BackendHandle {
    config: ServerConfig,
    commands: mpsc::Sender<BackendCommand>,
    shared: Arc<BackendShared>,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackendHandle {
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> BackendState {
        self.shared.state.lock().expect("poisoned").clone()
    }

    /// Current capability snapshot (copy-on-write pointer).
    #[must_use]
    pub fn snapshot(&self) -> Arc<CapabilitySnapshot> {
        Arc::clone(&self.shared.snapshot.read().expect("poisoned"))
    }

    #[must_use]
    pub fn last_healthy(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_healthy.lock().expect("poisoned")
    }

    /// Park the backend in `Failed` from outside the task. Used by the
    /// mount engine when a name collision blocks mounting.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let mut state = self.shared.state.lock().expect("poisoned");
        if matches!(*state, BackendState::Running | BackendState::Connecting) {
            *state = BackendState::Failed(reason.into());
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
        origin: Option<SessionId>,
    ) -> Result<CallToolResult, MaggError> {
        let (reply, rx) = oneshot::channel();
        self.send(BackendCommand::CallTool {
            name: name.to_string(),
            arguments,
            cancel,
            origin,
            reply,
        })
        .await?;
        rx.await.map_err(|_| backend_gone(&self.config.name))?
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: CancellationToken,
        origin: Option<SessionId>,
    ) -> Result<ReadResourceResult, MaggError> {
        let (reply, rx) = oneshot::channel();
        self.send(BackendCommand::ReadResource {
            uri: uri.to_string(),
            cancel,
            origin,
            reply,
        })
        .await?;
        rx.await.map_err(|_| backend_gone(&self.config.name))?
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
        origin: Option<SessionId>,
    ) -> Result<GetPromptResult, MaggError> {
        let (reply, rx) = oneshot::channel();
        self.send(BackendCommand::GetPrompt {
            name: name.to_string(),
            arguments,
            cancel,
            origin,
            reply,
        })
        .await?;
        rx.await.map_err(|_| backend_gone(&self.config.name))?
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), MaggError> {
        let (reply, rx) = oneshot::channel();
        self.send(BackendCommand::SubscribeResource {
            uri: uri.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| backend_gone(&self.config.name))?
    }

    /// One-shot health probe, used by the admin `check` operation.
    pub async fn probe(&self) -> Result<(), MaggError> {
        let (reply, rx) = oneshot::channel();
        self.send(BackendCommand::Probe { reply }).await?;
        rx.await.map_err(|_| backend_gone(&self.config.name))?
    }

    /// Stop the backend: graceful transport close, state `Disabled`.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(BackendCommand::Shutdown).await;
    }

    async fn send(&self, command: BackendCommand) -> Result<(), MaggError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| backend_gone(&self.config.name))
    }
}

fn backend_gone(name: &str) -> MaggError {
    MaggError::Transport(format!("backend {name:?} is gone"))
}

/// Spawn the owning task for one backend.
#[must_use]
pub fn spawn_backend(
    config: ServerConfig,
    options: BackendOptions,
    events: mpsc::Sender<BackendEvent>,
) -> BackendHandle {
    let shared = Arc::new(BackendShared {
        state: Mutex::new(BackendState::Configured),
        snapshot: RwLock::new(Arc::new(CapabilitySnapshot::default())),
        last_healthy: Mutex::new(None),
    });

    let (command_tx, command_rx) = mpsc::channel(32);

    let task = BackendTask {
        config: config.clone(),
        options,
        shared: Arc::clone(&shared),
        events,
        commands: command_rx,
    };
    tokio::spawn(task.run());

    BackendHandle {
        config,
        commands: command_tx,
        shared,
    }
}

struct BackendTask {
    config: ServerConfig,
    options: BackendOptions,
    shared: Arc<BackendShared>,
    events: mpsc::Sender<BackendEvent>,
    commands: mpsc::Receiver<BackendCommand>,
}

/// Why the serving loop stopped.
enum LoopExit {
    Disconnected(String),
    Shutdown,
}

impl BackendTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(BackendState::Connecting).await;

            match self.connect().await {
                Ok((client, mut notif_rx)) => {
                    attempt = 0;
                    self.set_state(BackendState::Running).await;
                    *self.shared.last_healthy.lock().expect("poisoned") = Some(Utc::now());
                    self.emit_list_changes().await;

                    match self.serve(&client, &mut notif_rx).await {
                        LoopExit::Shutdown => {
                            client.close();
                            self.set_state(BackendState::Disabled).await;
                            self.clear_snapshot().await;
                            return;
                        }
                        LoopExit::Disconnected(reason) => {
                            client.close();
                            self.set_state(BackendState::Degraded(reason)).await;
                            self.clear_snapshot().await;
                        }
                    }
                }
                Err(e) => {
                    self.set_state(BackendState::Degraded(e.to_string())).await;
                }
            }

            // Backoff between reconnect attempts; commands arriving while
            // degraded fail fast instead of queueing forever.
            attempt += 1;
            if attempt > self.options.reconnect_budget {
                let reason = format!(
                    "gave up after {} reconnect attempts",
                    self.options.reconnect_budget
                );
                tracing::warn!(server = %self.config.name, "{reason}");
                self.set_state(BackendState::Failed(reason)).await;
                self.drain_until_shutdown().await;
                return;
            }

            let delay = reconnect_delay(attempt);
            tracing::debug!(
                server = %self.config.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );

            if self.reject_commands_for(delay).await {
                self.set_state(BackendState::Disabled).await;
                return;
            }
        }
    }

    /// Bring up transport, handshake, and the initial capability fetch.
    async fn connect(
        &mut self,
    ) -> Result<(McpClient, mpsc::Receiver<magg_mcp::RawNotification>), McpError> {
        let transport = select_transport(&self.config, &self.options.transport)?;
        let (notif_tx, notif_rx) = mpsc::channel(64);
        let client = McpClient::connect(transport, notif_tx);

        let init = client.initialize(self.options.client_info.clone()).await?;
        tracing::info!(
            server = %self.config.name,
            backend = %init.server_info.name,
            protocol = %init.protocol_version,
            "backend connected"
        );

        self.refresh_snapshot(&client).await?;
        Ok((client, notif_rx))
    }

    /// Serve commands and notifications until disconnect or shutdown.
    async fn serve(
        &mut self,
        client: &McpClient,
        notif_rx: &mut mpsc::Receiver<magg_mcp::RawNotification>,
    ) -> LoopExit {
        let mut probe = tokio::time::interval(self.options.probe_interval);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        probe.reset();

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None | Some(BackendCommand::Shutdown) => return LoopExit::Shutdown,
                        Some(command) => {
                            if let Err(reason) = self.handle_command(client, notif_rx, command).await {
                                return LoopExit::Disconnected(reason);
                            }
                        }
                    }
                }
                notification = notif_rx.recv() => {
                    match notification {
                        Some((method, params)) => {
                            self.handle_notification(client, &method, params).await;
                        }
                        None => return LoopExit::Disconnected("transport closed".into()),
                    }
                }
                _ = probe.tick() => {
                    if let Err(e) = client.probe(HEALTH_PROBE_TIMEOUT).await {
                        return LoopExit::Disconnected(format!("health probe failed: {e}"));
                    }
                    *self.shared.last_healthy.lock().expect("poisoned") = Some(Utc::now());
                }
            }
        }
    }

    /// Run one command against the live client. `Err` means the transport
    /// is gone and the loop should degrade; per-request errors go to the
    /// caller on the reply channel.
    ///
    /// Session-originated requests are bracketed by issued/settled events
    /// keyed on our outbound request id, and any notifications that raced
    /// in during the request (a backend-side `cancelled` in particular)
    /// are drained before the routing entry is released.
    async fn handle_command(
        &self,
        client: &McpClient,
        notif_rx: &mut mpsc::Receiver<magg_mcp::RawNotification>,
        command: BackendCommand,
    ) -> Result<(), String> {
        match command {
            BackendCommand::CallTool {
                name,
                arguments,
                cancel,
                origin,
                reply,
            } => {
                let id = client.allocate_request_id();
                self.note_issued(origin, id).await;
                let result = client
                    .call_tool_with_id(id, &name, arguments, Some(&cancel))
                    .await;
                self.drain_notifications(client, notif_rx).await;
                self.note_settled(origin, id).await;
                self.finish(reply, result)
            }
            BackendCommand::ReadResource {
                uri,
                cancel,
                origin,
                reply,
            } => {
                let id = client.allocate_request_id();
                self.note_issued(origin, id).await;
                let result = client.read_resource_with_id(id, &uri, Some(&cancel)).await;
                self.drain_notifications(client, notif_rx).await;
                self.note_settled(origin, id).await;
                self.finish(reply, result)
            }
            BackendCommand::GetPrompt {
                name,
                arguments,
                cancel,
                origin,
                reply,
            } => {
                let id = client.allocate_request_id();
                self.note_issued(origin, id).await;
                let result = client
                    .get_prompt_with_id(id, &name, arguments, Some(&cancel))
                    .await;
                self.drain_notifications(client, notif_rx).await;
                self.note_settled(origin, id).await;
                self.finish(reply, result)
            }
            BackendCommand::SubscribeResource { uri, reply } => {
                let result = client.subscribe_resource(&uri).await;
                self.finish(reply, result)
            }
            BackendCommand::Probe { reply } => {
                let result = client.probe(HEALTH_PROBE_TIMEOUT).await;
                if result.is_ok() {
                    *self.shared.last_healthy.lock().expect("poisoned") = Some(Utc::now());
                }
                self.finish(reply, result)
            }
            BackendCommand::Shutdown => unreachable!("handled by the serve loop"),
        }
    }

    /// Deliver a result, separating transport faults (degrade) from
    /// per-request errors (caller's problem).
    fn finish<T>(
        &self,
        reply: oneshot::Sender<Result<T, MaggError>>,
        result: Result<T, McpError>,
    ) -> Result<(), String> {
        match result {
            Ok(value) => {
                let _ = reply.send(Ok(value));
                Ok(())
            }
            Err(e) => {
                let fault = matches!(
                    e,
                    McpError::Closed | McpError::Io(_) | McpError::NotConnected
                );
                let reason = e.to_string();
                let _ = reply.send(Err(e.into()));
                if fault {
                    Err(reason)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Announce that a downstream request left on behalf of a session.
    async fn note_issued(&self, origin: Option<SessionId>, request_id: i64) {
        if let Some(session) = origin {
            let _ = self
                .events
                .send(BackendEvent::RequestIssued {
                    server: self.config.name.clone(),
                    request_id,
                    session,
                })
                .await;
        }
    }

    async fn note_settled(&self, origin: Option<SessionId>, request_id: i64) {
        if origin.is_some() {
            let _ = self
                .events
                .send(BackendEvent::RequestSettled {
                    server: self.config.name.clone(),
                    request_id,
                })
                .await;
        }
    }

    /// Forward notifications that queued up while a request was in
    /// flight, before its cancel-routing entry is released.
    async fn drain_notifications(
        &self,
        client: &McpClient,
        notif_rx: &mut mpsc::Receiver<magg_mcp::RawNotification>,
    ) {
        while let Ok((method, params)) = notif_rx.try_recv() {
            self.handle_notification(client, &method, params).await;
        }
    }

    async fn handle_notification(
        &self,
        client: &McpClient,
        method: &str,
        params: Option<Value>,
    ) {
        let Some(kind) = NotificationKind::from_method(method) else {
            tracing::trace!(server = %self.config.name, method, "unknown notification");
            return;
        };

        // List changes refresh our cached snapshot before forwarding so
        // the aggregated index catches up in the same breath.
        if kind.is_list_change() {
            if let Err(e) = self.refresh_snapshot(client).await {
                tracing::debug!(server = %self.config.name, error = %e, "snapshot refresh failed");
            }
        }

        let envelope = NotificationEnvelope::new(
            self.config.name.clone(),
            kind,
            params.unwrap_or(Value::Null),
        );
        let _ = self.events.send(BackendEvent::Notification(envelope)).await;
    }

    async fn refresh_snapshot(&self, client: &McpClient) -> Result<(), McpError> {
        let tools = client.list_tools().await?;
        let resources = client.list_resources().await?;
        let resource_templates = client.list_resource_templates().await?;
        let prompts = client.list_prompts().await?;

        let snapshot = CapabilitySnapshot {
            tools,
            resources,
            resource_templates,
            prompts,
            fetched_at: Some(Utc::now()),
        };
        *self.shared.snapshot.write().expect("poisoned") = Arc::new(snapshot);
        Ok(())
    }

    async fn clear_snapshot(&self) {
        *self.shared.snapshot.write().expect("poisoned") =
            Arc::new(CapabilitySnapshot::default());
        self.emit_list_changes().await;
    }

    /// Announce that this backend's contribution to the index changed.
    async fn emit_list_changes(&self) {
        for kind in [
            NotificationKind::ToolsChanged,
            NotificationKind::ResourcesChanged,
            NotificationKind::PromptsChanged,
        ] {
            let envelope =
                NotificationEnvelope::new(self.config.name.clone(), kind, Value::Null);
            let _ = self.events.send(BackendEvent::Notification(envelope)).await;
        }
    }

    /// While waiting out a backoff delay, answer commands with an error
    /// instead of letting them sit in the queue. Returns true on shutdown.
    async fn reject_commands_for(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => return false,
                command = self.commands.recv() => match command {
                    None | Some(BackendCommand::Shutdown) => return true,
                    Some(command) => reject_command(command, &self.config.name),
                }
            }
        }
    }

    /// After `Failed`, only shutdown matters.
    async fn drain_until_shutdown(&mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                BackendCommand::Shutdown => break,
                other => reject_command(other, &self.config.name),
            }
        }
        self.set_state(BackendState::Disabled).await;
        self.clear_snapshot().await;
    }

    async fn set_state(&self, state: BackendState) {
        {
            let mut current = self.shared.state.lock().expect("poisoned");
            if *current == state {
                return;
            }
            tracing::debug!(
                server = %self.config.name,
                from = ?*current,
                to = ?state,
                "backend state change"
            );
            *current = state.clone();
        }
        let _ = self
            .events
            .send(BackendEvent::StateChanged {
                server: self.config.name.clone(),
                state,
            })
            .await;
    }
}

fn reject_command(command: BackendCommand, name: &str) {
    let err = || {
        MaggError::Transport(format!(
            "backend {name:?} is not connected"
        ))
    };
    match command {
        BackendCommand::CallTool { reply, .. } => {
            let _ = reply.send(Err(err()));
        }
        BackendCommand::ReadResource { reply, .. } => {
            let _ = reply.send(Err(err()));
        }
        BackendCommand::GetPrompt { reply, .. } => {
            let _ = reply.send(Err(err()));
        }
        BackendCommand::SubscribeResource { reply, .. } => {
            let _ = reply.send(Err(err()));
        }
        BackendCommand::Probe { reply } => {
            let _ = reply.send(Err(err()));
        }
        BackendCommand::Shutdown => {}
    }
}

/// Exponential backoff with jitter: 100 ms, 200 ms, 400 ms ... capped,
/// each sample jittered ±25 %.
#[must_use]
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = RECONNECT_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(RECONNECT_MAX_DELAY);
    let jitter = 0.75 + rand::random::<f64>() * 0.5;
    base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_config() -> ServerConfig {
        ServerConfig::stdio("broken", "/nonexistent/not-a-real-binary")
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        // Jitter is ±25 %, so compare against widened bounds.
        let first = reconnect_delay(1);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));

        let third = reconnect_delay(3);
        assert!(third >= Duration::from_millis(300) && third <= Duration::from_millis(500));

        let huge = reconnect_delay(40);
        assert!(huge <= RECONNECT_MAX_DELAY.mul_f64(1.25));
    }

    #[test]
    fn mountable_only_when_running() {
        assert!(BackendState::Running.is_mountable());
        assert!(!BackendState::Connecting.is_mountable());
        assert!(!BackendState::Degraded("x".into()).is_mountable());
        assert!(!BackendState::Failed("x".into()).is_mountable());
        assert!(!BackendState::Disabled.is_mountable());
    }

    #[tokio::test]
    async fn spawn_failure_degrades_then_fails() {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let options = BackendOptions {
            reconnect_budget: 1,
            ..BackendOptions::default()
        };
        let handle = spawn_backend(failing_config(), options, events_tx);

        // Watch states until Failed shows up.
        let mut saw_degraded = false;
        let mut saw_failed = false;
        let deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(deadline);
        while !(saw_failed) {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(BackendEvent::StateChanged { state, .. }) => {
                        match state {
                            BackendState::Degraded(_) => saw_degraded = true,
                            BackendState::Failed(_) => saw_failed = true,
                            _ => {}
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                () = &mut deadline => break,
            }
        }
        assert!(saw_degraded, "expected a Degraded transition");
        assert!(saw_failed, "expected a Failed transition");

        // Requests against a failed backend error out rather than hanging.
        let err = handle.probe().await.unwrap_err();
        assert!(matches!(err, MaggError::Transport(_)));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn mark_failed_applies_only_to_live_states() {
        let (events_tx, _events_rx) = mpsc::channel(64);
        let options = BackendOptions {
            reconnect_budget: 0,
            ..BackendOptions::default()
        };
        let handle = spawn_backend(failing_config(), options, events_tx);

        // Once Failed on its own, a collision verdict must not overwrite
        // the existing reason.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let before = handle.state();
        handle.mark_failed("collision: x_foo");
        if matches!(before, BackendState::Failed(_)) {
            assert_eq!(handle.state(), before);
        }
        handle.shutdown().await;
    }
}
