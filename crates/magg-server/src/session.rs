//! Client sessions: one per connected MCP client.
//!
//! A session owns the outbound frame channel, the client's declared
//! capabilities, the cancellation scopes of its in-flight requests, and the
//! reply slots for server-initiated requests (sampling goes back out to the
//! session that triggered it). The frame loop in [`run_session`] is shared
//! by the stdio runner and the in-process transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use magg_core::MaggError;
use magg_mcp::{ClientCapabilities, ErrorObject, Message, Notification, Request, RequestId, Response};

use crate::coordinator::SessionId;
use crate::server::MaggServer;

/// Budget for a sampling round-trip through the client's model.
pub const SAMPLING_TIMEOUT: Duration = Duration::from_secs(120);

/// One connected client.
pub struct ClientSession {
    pub id: SessionId,
    outbound: mpsc::Sender<String>,
    client_caps: Mutex<Option<ClientCapabilities>>,
    initialized: AtomicBool,
    /// Server→client requests awaiting replies, keyed by our request id.
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, MaggError>>>>,
    next_request_id: AtomicI64,
    /// Cancellation scopes of the client's in-flight requests.
    scopes: Mutex<HashMap<String, CancellationToken>>,
    closed: CancellationToken,
}

impl ClientSession {
    #[must_use]
    pub fn new(id: SessionId, outbound: mpsc::Sender<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            outbound,
            client_caps: Mutex::new(None),
            initialized: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicI64::new(1),
            scopes: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        })
    }

    pub fn set_client_capabilities(&self, caps: ClientCapabilities) {
        *self.client_caps.lock().expect("poisoned") = Some(caps);
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn supports_sampling(&self) -> bool {
        self.client_caps
            .lock()
            .expect("poisoned")
            .as_ref()
            .is_some_and(|caps| caps.sampling.is_some())
    }

    /// New cancellation scope for an inbound request.
    pub fn open_scope(&self, request_id: &RequestId) -> CancellationToken {
        let token = self.closed.child_token();
        self.scopes
            .lock()
            .expect("poisoned")
            .insert(request_id.to_string(), token.clone());
        token
    }

    pub fn close_scope(&self, request_id: &RequestId) {
        self.scopes
            .lock()
            .expect("poisoned")
            .remove(&request_id.to_string());
    }

    /// Cancel an in-flight request by the id the client sent.
    pub fn cancel_request(&self, request_id: &str) {
        if let Some(token) = self.scopes.lock().expect("poisoned").get(request_id) {
            token.cancel();
        }
    }

    /// Send a notification frame to this client.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) {
        if let Ok(line) = Message::Notification(Notification::new(method, params)).to_line() {
            let _ = self.outbound.send(line).await;
        }
    }

    /// Ask the client-side model to sample. Fails with a validation-class
    /// error when the session never declared the sampling capability.
    pub async fn create_message(&self, params: Value) -> Result<Value, MaggError> {
        if !self.supports_sampling() {
            return Err(MaggError::Validation(
                "client session does not support sampling".into(),
            ));
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("poisoned").insert(id, tx);

        let frame = Message::Request(Request::new(id, "sampling/createMessage", Some(params)))
            .to_line()
            .map_err(|e| MaggError::Protocol(e.to_string()))?;
        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().expect("poisoned").remove(&id);
            return Err(MaggError::Transport("session closed".into()));
        }

        tokio::select! {
            reply = rx => reply.map_err(|_| MaggError::Transport("session closed".into()))?,
            () = tokio::time::sleep(SAMPLING_TIMEOUT) => {
                self.pending.lock().expect("poisoned").remove(&id);
                Err(MaggError::Timeout("sampling request".into()))
            }
            () = self.closed.cancelled() => {
                self.pending.lock().expect("poisoned").remove(&id);
                Err(MaggError::Cancelled)
            }
        }
    }

    /// Route a response frame from the client to its waiting request.
    pub fn handle_response(&self, response: Response) {
        let RequestId::Number(id) = response.id else {
            return;
        };
        let Some(tx) = self.pending.lock().expect("poisoned").remove(&id) else {
            return;
        };
        let outcome = match response.error {
            Some(err) => Err(MaggError::Protocol(format!(
                "client error {}: {}",
                err.code, err.message
            ))),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }

    /// Tear down: cancels every scope and fails pending sampling calls.
    pub fn close(&self) {
        self.closed.cancel();
        self.scopes.lock().expect("poisoned").clear();
        for (_, tx) in self.pending.lock().expect("poisoned").drain() {
            let _ = tx.send(Err(MaggError::Cancelled));
        }
    }
}

/// Drive one session over a frame channel pair until the inbound side
/// closes. Used by the stdio runner and by in-process clients.
pub async fn run_session(
    server: Arc<MaggServer>,
    mut inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
) {
    let (session_id, mut notifications) = server.coordinator().attach();
    let session = ClientSession::new(session_id, outbound.clone());

    // Pump coordinator notifications out to this client.
    let pump_session = Arc::clone(&session);
    let pump = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            pump_session
                .send_notification(&notification.method, notification.params)
                .await;
        }
    });

    while let Some(frame) = inbound.recv().await {
        let message = match Message::parse(&frame) {
            Ok(m) => m,
            Err(err) => {
                let reply = Message::Response(Response {
                    jsonrpc: "2.0".to_string(),
                    id: RequestId::Number(0),
                    result: None,
                    error: Some(err),
                });
                if let Ok(line) = reply.to_line() {
                    let _ = outbound.send(line).await;
                }
                continue;
            }
        };

        match message {
            Message::Request(request) => {
                let server = Arc::clone(&server);
                let session = Arc::clone(&session);
                let outbound = outbound.clone();
                // Requests run concurrently; each gets its own scope.
                tokio::spawn(async move {
                    let id = request.id.clone();
                    let cancel = session.open_scope(&id);
                    let outcome = server
                        .handle_request(&session, &request.method, request.params, cancel)
                        .await;
                    session.close_scope(&id);

                    let reply = match outcome {
                        Ok(result) => Response::ok(id, result),
                        Err(e) => Response::err(
                            id,
                            ErrorObject::new(e.jsonrpc_code(), e.to_string()),
                        ),
                    };
                    if let Ok(line) = Message::Response(reply).to_line() {
                        let _ = outbound.send(line).await;
                    }
                });
            }
            Message::Notification(notification) => {
                handle_client_notification(&session, &notification.method, notification.params);
            }
            Message::Response(response) => session.handle_response(response),
        }
    }

    session.close();
    server.coordinator().detach(session_id);
    pump.abort();
    tracing::debug!(session = session_id, "client session ended");
}

fn handle_client_notification(session: &ClientSession, method: &str, params: Option<Value>) {
    match method {
        "notifications/initialized" => session.mark_initialized(),
        "notifications/cancelled" => {
            let request_id = params
                .as_ref()
                .and_then(|p| p.get("requestId"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            if let Some(request_id) = request_id {
                tracing::debug!(request_id = %request_id, "client cancelled request");
                session.cancel_request(&request_id);
            }
        }
        other => {
            tracing::trace!(method = other, "ignoring client notification");
        }
    }
}

/// Build the standard sampling request params for a single user prompt.
#[must_use]
pub fn sampling_request(prompt: &str, max_tokens: u32) -> Value {
    json!({
        "messages": [{
            "role": "user",
            "content": {"type": "text", "text": prompt},
        }],
        "maxTokens": max_tokens,
    })
}

/// Pull the text out of a sampling reply.
#[must_use]
pub fn sampling_reply_text(reply: &Value) -> Option<String> {
    let content = reply.get("content")?;
    match content {
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("text").and_then(Value::as_str))
            .map(ToString::to_string),
        Value::Object(_) => content
            .get("text")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sampling_requires_capability() {
        let (tx, _rx) = mpsc::channel(8);
        let session = ClientSession::new(1, tx);
        let err = session.create_message(json!({})).await.unwrap_err();
        assert!(matches!(err, MaggError::Validation(_)));
    }

    #[tokio::test]
    async fn sampling_round_trip() {
        let (tx, mut rx) = mpsc::channel(8);
        let session = ClientSession::new(1, tx);
        session.set_client_capabilities(ClientCapabilities {
            sampling: Some(json!({})),
            roots: None,
        });

        let waiter = Arc::clone(&session);
        let task = tokio::spawn(async move {
            waiter
                .create_message(sampling_request("hello", 256))
                .await
        });

        // The session wrote a sampling request; answer it.
        let frame = rx.recv().await.unwrap();
        let Ok(Message::Request(request)) = Message::parse(&frame) else {
            panic!("expected a sampling request");
        };
        assert_eq!(request.method, "sampling/createMessage");

        session.handle_response(Response::ok(
            request.id,
            json!({"content": {"type": "text", "text": "hi back"}, "model": "test"}),
        ));

        let reply = task.await.unwrap().unwrap();
        assert_eq!(sampling_reply_text(&reply).as_deref(), Some("hi back"));
    }

    #[tokio::test]
    async fn cancel_request_fires_scope() {
        let (tx, _rx) = mpsc::channel(8);
        let session = ClientSession::new(1, tx);
        let token = session.open_scope(&RequestId::Number(9));
        assert!(!token.is_cancelled());
        session.cancel_request("9");
        assert!(token.is_cancelled());
    }

    #[test]
    fn sampling_reply_text_variants() {
        assert_eq!(
            sampling_reply_text(&json!({"content": {"type": "text", "text": "a"}})).as_deref(),
            Some("a")
        );
        assert_eq!(
            sampling_reply_text(&json!({"content": [{"type": "text", "text": "b"}]})).as_deref(),
            Some("b")
        );
        assert_eq!(sampling_reply_text(&json!({"x": 1})), None);
    }
}
