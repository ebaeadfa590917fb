//! HTTP transport for the aggregator: JSON-RPC over POST plus an SSE
//! notification stream, with optional bearer-token authentication.
//!
//! `POST /mcp` carries one JSON-RPC frame per request. `GET /mcp` opens a
//! server-sent-events stream delivering notification frames; each SSE
//! connection is its own client session with its own queue. Sampling is a
//! stdio-session affordance; HTTP sessions do not advertise it.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use magg_mcp::{ErrorObject, Message, Notification, RequestId, Response};

use crate::auth::{bearer_token, BearerAuth};
use crate::coordinator::SessionReceiver;
use crate::server::MaggServer;
use crate::session::ClientSession;

/// Shared router state.
#[derive(Clone)]
pub struct HttpState {
    server: Arc<MaggServer>,
    auth: Option<Arc<BearerAuth>>,
}

/// Build the router for the aggregator's HTTP surface.
#[must_use]
pub fn router(server: Arc<MaggServer>, auth: Option<Arc<BearerAuth>>) -> Router {
    let state = HttpState { server, auth };
    Router::new()
        .route("/mcp", post(handle_frame).get(handle_events))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Serve until cancelled.
pub async fn serve_http(
    server: Arc<MaggServer>,
    auth: Option<Arc<BearerAuth>>,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "http transport listening");

    let app = router(server, auth);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

/// The request is authenticated when auth is disabled or the bearer token
/// validates. The core consumes exactly this boolean.
fn authenticated(auth: Option<&Arc<BearerAuth>>, headers: &HeaderMap) -> bool {
    let Some(auth) = auth else { return true };
    if !auth.enabled() {
        return true;
    }

    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .is_some_and(|token| match auth.validate(token) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "token rejected");
                false
            }
        })
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_frame(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    if !authenticated(state.auth.as_ref(), &headers) {
        return (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response();
    }

    let message = match Message::parse(&body) {
        Ok(m) => m,
        Err(err) => {
            let reply = Response {
                jsonrpc: "2.0".to_string(),
                id: RequestId::Number(0),
                result: None,
                error: Some(err),
            };
            return (StatusCode::BAD_REQUEST, Json(json!(reply))).into_response();
        }
    };

    match message {
        Message::Request(request) => {
            // Each POSTed request runs in an ephemeral session: no
            // notification stream, no sampling capability.
            let (outbound_tx, _outbound_rx) = tokio::sync::mpsc::channel(8);
            let (session_id, _receiver) = state.server.coordinator().attach();
            let session = ClientSession::new(session_id, outbound_tx);

            let cancel = session.open_scope(&request.id);
            let outcome = state
                .server
                .handle_request(&session, &request.method, request.params, cancel)
                .await;
            session.close_scope(&request.id);
            state.server.coordinator().detach(session_id);

            let reply = match outcome {
                Ok(result) => Response::ok(request.id, result),
                Err(e) => Response::err(
                    request.id,
                    ErrorObject::new(e.jsonrpc_code(), e.to_string()),
                ),
            };
            Json(json!(reply)).into_response()
        }
        Message::Notification(notification) => {
            tracing::trace!(method = %notification.method, "client notification over http");
            StatusCode::ACCEPTED.into_response()
        }
        Message::Response(_) => {
            (StatusCode::BAD_REQUEST, "unexpected response frame").into_response()
        }
    }
}

/// Detaches the SSE session when the client goes away.
struct SseGuard {
    server: Arc<MaggServer>,
    session_id: crate::coordinator::SessionId,
    receiver: SessionReceiver,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        self.server.coordinator().detach(self.session_id);
    }
}

async fn handle_events(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !authenticated(state.auth.as_ref(), &headers) {
        return (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response();
    }

    let (session_id, receiver) = state.server.coordinator().attach();
    tracing::debug!(session = session_id, "sse notification stream attached");

    let guard = SseGuard {
        server: Arc::clone(&state.server),
        session_id,
        receiver,
    };

    Sse::new(notification_stream(guard))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn notification_stream(guard: SseGuard) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(guard, |mut guard| async move {
        let notification = guard.receiver.recv().await?;
        let frame = Message::Notification(Notification::new(
            notification.method,
            notification.params,
        ))
        .to_line()
        .ok()?;
        Some((Ok(Event::default().data(frame)), guard))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use magg_core::Settings;

    fn test_state(auth: Option<Arc<BearerAuth>>) -> (tempfile::TempDir, HttpState) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            config_path: dir.path().join(".magg/config.json"),
            auto_reload: false,
            ..Settings::default()
        };
        let server = MaggServer::new(settings).unwrap();
        (dir, HttpState { server, auth })
    }

    fn auth_with_keys(dir: &tempfile::TempDir) -> Arc<BearerAuth> {
        let mut auth = BearerAuth::new(dir.path().join("keys"), None);
        auth.init_keys().unwrap();
        Arc::new(auth)
    }

    #[test]
    fn requests_pass_when_auth_disabled() {
        let headers = HeaderMap::new();
        assert!(authenticated(None, &headers));

        let dir = tempfile::tempdir().unwrap();
        let no_keys = Arc::new(BearerAuth::new(dir.path().join("keys"), None));
        assert!(authenticated(Some(&no_keys), &headers));
    }

    #[test]
    fn requests_need_valid_token_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let auth = auth_with_keys(&dir);

        let empty = HeaderMap::new();
        assert!(!authenticated(Some(&auth), &empty));

        let mut bad = HeaderMap::new();
        bad.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer garbage".parse().unwrap(),
        );
        assert!(!authenticated(Some(&auth), &bad));

        let token = auth.create_token("tester", 1, None).unwrap();
        let mut good = HeaderMap::new();
        good.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        assert!(authenticated(Some(&auth), &good));
    }

    #[tokio::test]
    async fn post_dispatches_initialize() {
        let (_dir, state) = test_state(None);
        state.server.start().await;

        let body = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t"}}}"#;
        let response = handle_frame(State(state.clone()), HeaderMap::new(), body.to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);

        state.server.stop().await;
    }

    #[tokio::test]
    async fn malformed_frame_is_bad_request() {
        let (_dir, state) = test_state(None);
        state.server.start().await;

        let response =
            handle_frame(State(state.clone()), HeaderMap::new(), "not json".to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        state.server.stop().await;
    }
}
