//! Concrete transports and the transport selector.
//!
//! Every transport is pumped by background tasks and exposed as a pair of
//! channels carrying whole JSON frames: the owner sends outbound frames
//! through `outbound` and reads inbound frames from `inbound`. This keeps
//! exactly one task touching each pipe and lets the client route responses
//! and notifications without sharing the transport itself.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use magg_core::ServerConfig;

use crate::error::McpError;

/// Grace period between closing a child's stdin and killing it.
const CHILD_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Channel depth for frame pumps.
const FRAME_BUFFER: usize = 64;

/// Environment handling for stdio child processes.
///
/// Explicit-only starts the child from a minimal baseline (PATH and friends)
/// plus the configured overlay; inherit-plus-overlay passes the whole parent
/// environment through first. HTTP transports never inherit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvInheritance {
    #[default]
    ExplicitOnly,
    InheritPlusOverlay,
}

/// Baseline variables a child still needs when inheritance is off.
const BASELINE_ENV: &[&str] = &["PATH", "HOME", "USER", "SHELL", "TMPDIR", "LANG", "TERM"];

/// Options applied when a transport is brought up.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Forward child stderr to our logs instead of discarding it.
    pub stderr_show: bool,
    /// Environment mode for stdio children.
    pub env_inheritance: EnvInheritance,
    /// Bearer token attached to HTTP requests.
    pub bearer_token: Option<String>,
}

/// Which concrete transport a config selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    InProcess,
}

/// Shutdown handle for a transport's pump tasks. Dropping it closes the
/// transport; for stdio that triggers the close-wait-kill sequence.
#[derive(Debug)]
pub struct TransportGuard {
    kind: TransportKind,
    cancel: CancellationToken,
    child_pid: Option<u32>,
}

impl TransportGuard {
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    #[must_use]
    pub const fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Begin shutdown without waiting for the drop.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A live transport: channel pair plus shutdown guard.
pub struct TransportHandle {
    /// Frames to the peer.
    pub outbound: mpsc::Sender<String>,
    /// Frames from the peer. Channel closure means the transport died.
    pub inbound: mpsc::Receiver<String>,
    /// Keeps the pumps (and any child process) alive.
    pub guard: TransportGuard,
}

impl TransportHandle {
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.guard.kind()
    }

    /// Begin shutdown. Pumps drain and, for stdio, the child gets the
    /// close-wait-kill sequence.
    pub fn close(&self) {
        self.guard.close();
    }
}

/// Pick and start the transport for a catalog entry.
///
/// Non-empty `command` selects the stdio child-process transport; an
/// http(s) `uri` selects the HTTP transport. The in-process transport is
/// reserved for the aggregator itself and built with [`in_process_pair`].
pub fn select_transport(
    server: &ServerConfig,
    options: &TransportOptions,
) -> Result<TransportHandle, McpError> {
    if let Some(command) = server.command.as_deref().filter(|c| !c.trim().is_empty()) {
        return spawn_stdio(
            &server.name,
            command,
            server.args.as_deref().unwrap_or(&[]),
            server.env.as_ref(),
            server.cwd.as_deref(),
            options,
        );
    }

    if let Some(uri) = server.uri.as_deref().filter(|u| !u.trim().is_empty()) {
        if !uri.starts_with("http://") && !uri.starts_with("https://") {
            return Err(McpError::InvalidConfig(format!(
                "unsupported uri scheme: {uri}"
            )));
        }
        return spawn_http(&server.name, uri, server.transport.as_ref(), options);
    }

    Err(McpError::InvalidConfig(format!(
        "server {:?} has neither command nor uri",
        server.name
    )))
}

/// Spawn a stdio child process speaking newline-delimited JSON-RPC.
pub fn spawn_stdio(
    server_name: &str,
    command: &str,
    args: &[String],
    env: Option<&BTreeMap<String, String>>,
    cwd: Option<&str>,
    options: &TransportOptions,
) -> Result<TransportHandle, McpError> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if options.stderr_show {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    if options.env_inheritance == EnvInheritance::ExplicitOnly {
        cmd.env_clear();
        for key in BASELINE_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
    }
    if let Some(env) = env {
        cmd.envs(env);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        McpError::SpawnFailed(format!("{command} {}: {e}", args.join(" ")))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| McpError::SpawnFailed("child stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| McpError::SpawnFailed("child stdout unavailable".into()))?;
    let child_pid = child.id();

    let cancel = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);

    if options.stderr_show {
        if let Some(stderr) = child.stderr.take() {
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, "stderr: {line}");
                }
            });
        }
    }

    // Writer: frames out, then close stdin to signal EOF.
    let writer_cancel = cancel.clone();
    let writer_name = server_name.to_string();
    tokio::spawn(async move {
        let mut stdin = stdin;
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let mut line = frame;
                    line.push('\n');
                    if let Err(e) = stdin.write_all(line.as_bytes()).await {
                        tracing::debug!(server = %writer_name, error = %e, "stdin write failed");
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
                () = writer_cancel.cancelled() => break,
            }
        }
        drop(stdin);
    });

    // Reader: lines in. Non-JSON startup noise is skipped by the client.
    let reader_name = server_name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if in_tx.send(trimmed.to_string()).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!(server = %reader_name, "stdout closed");
                    break;
                }
                Err(e) => {
                    tracing::debug!(server = %reader_name, error = %e, "stdout read failed");
                    break;
                }
            }
        }
    });

    // Reaper: owns the child. Graceful close on cancel, then hard kill.
    let reaper_cancel = cancel.clone();
    let reaper_name = server_name.to_string();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                tracing::debug!(server = %reaper_name, ?status, "backend process exited");
            }
            () = reaper_cancel.cancelled() => {
                match tokio::time::timeout(CHILD_SHUTDOWN_GRACE, child.wait()).await {
                    Ok(status) => {
                        tracing::debug!(server = %reaper_name, ?status, "backend exited after close");
                    }
                    Err(_) => {
                        tracing::warn!(server = %reaper_name, "backend did not exit, killing");
                        let _ = child.kill().await;
                    }
                }
            }
        }
    });

    Ok(TransportHandle {
        outbound: out_tx,
        inbound: in_rx,
        guard: TransportGuard {
            kind: TransportKind::Stdio,
            cancel,
            child_pid,
        },
    })
}

/// Open an HTTP transport: each outbound frame is POSTed to the endpoint
/// and any response body (JSON, or SSE events from a streamable server) is
/// fed back as inbound frames. No process is owned.
pub fn spawn_http(
    server_name: &str,
    uri: &str,
    transport_config: Option<&serde_json::Value>,
    options: &TransportOptions,
) -> Result<TransportHandle, McpError> {
    let url: url::Url = uri
        .parse()
        .map_err(|e| McpError::InvalidConfig(format!("invalid uri {uri:?}: {e}")))?;

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/json, text/event-stream"),
    );
    if let Some(token) = &options.bearer_token {
        let value = format!("Bearer {token}");
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&value)
                .map_err(|e| McpError::InvalidConfig(format!("invalid bearer token: {e}")))?,
        );
    }
    // Extra headers from the free-form transport mapping.
    if let Some(extra) = transport_config
        .and_then(|c| c.get("headers"))
        .and_then(|h| h.as_object())
    {
        for (key, value) in extra {
            if let (Ok(name), Some(text)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.as_str(),
            ) {
                if let Ok(val) = reqwest::header::HeaderValue::from_str(text) {
                    headers.insert(name, val);
                }
            }
        }
    }

    let client = reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(60))
        .build()?;

    let cancel = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);

    let pump_cancel = cancel.clone();
    let name = server_name.to_string();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = out_rx.recv() => frame,
                () = pump_cancel.cancelled() => None,
            };
            let Some(frame) = frame else { break };

            let response = client
                .post(url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(frame)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(server = %name, error = %e, "http post failed");
                    // Closing inbound tells the owner the transport died.
                    break;
                }
            };

            if !response.status().is_success() {
                tracing::debug!(server = %name, status = %response.status(), "http error status");
                break;
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();

            let body = match response.text().await {
                Ok(b) => b,
                Err(e) => {
                    tracing::debug!(server = %name, error = %e, "http body read failed");
                    break;
                }
            };

            let frames = if content_type.starts_with("text/event-stream") {
                parse_sse_frames(&body)
            } else if body.trim().is_empty() {
                Vec::new()
            } else {
                vec![body]
            };

            for frame in frames {
                if in_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    });

    Ok(TransportHandle {
        outbound: out_tx,
        inbound: in_rx,
        guard: TransportGuard {
            kind: TransportKind::Http,
            cancel,
            child_pid: None,
        },
    })
}

/// Extract `data:` payloads from a buffered SSE body, one frame per event.
fn parse_sse_frames(body: &str) -> Vec<String> {
    let mut frames = Vec::new();
    for event in body.split("\n\n") {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if !data.is_empty() {
            frames.push(data.join("\n"));
        }
    }
    frames
}

/// Build a connected in-process transport pair.
///
/// The aggregator hands one end to its own dispatcher and the other to a
/// client (the proxy tool introspecting our own capabilities) — same frame
/// contract, no network hop.
#[must_use]
pub fn in_process_pair() -> (TransportHandle, TransportHandle) {
    let (a_tx, a_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let (b_tx, b_rx) = mpsc::channel::<String>(FRAME_BUFFER);

    let left = TransportHandle {
        outbound: a_tx,
        inbound: b_rx,
        guard: TransportGuard {
            kind: TransportKind::InProcess,
            cancel: CancellationToken::new(),
            child_pid: None,
        },
    };
    let right = TransportHandle {
        outbound: b_tx,
        inbound: a_rx,
        guard: TransportGuard {
            kind: TransportKind::InProcess,
            cancel: CancellationToken::new(),
            child_pid: None,
        },
    };
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> TransportOptions {
        TransportOptions::default()
    }

    #[test]
    fn selector_rejects_empty_config() {
        let missing = ServerConfig {
            name: "none".into(),
            enabled: true,
            ..ServerConfig::default()
        };
        assert!(matches!(
            select_transport(&missing, &options()),
            Err(McpError::InvalidConfig(_))
        ));
    }

    #[test]
    fn selector_rejects_non_http_uri() {
        let server = ServerConfig::http("s", "ftp://example.com/mcp");
        assert!(matches!(
            select_transport(&server, &options()),
            Err(McpError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn stdio_round_trip_with_cat() {
        let handle = spawn_stdio("cat", "cat", &[], None, None, &options()).unwrap();
        let mut handle = handle;

        handle
            .outbound
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
            .await
            .unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(5), handle.inbound.recv())
            .await
            .expect("timed out")
            .expect("closed");
        assert!(echoed.contains("\"ping\""));

        handle.close();
    }

    #[tokio::test]
    async fn stdio_spawn_failure_is_reported() {
        let result = spawn_stdio(
            "missing",
            "/nonexistent/definitely-not-a-binary",
            &[],
            None,
            None,
            &options(),
        );
        assert!(matches!(result, Err(McpError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn in_process_pair_is_cross_wired() {
        let (mut left, mut right) = in_process_pair();

        left.outbound.send("ping".to_string()).await.unwrap();
        assert_eq!(right.inbound.recv().await.unwrap(), "ping");

        right.outbound.send("pong".to_string()).await.unwrap();
        assert_eq!(left.inbound.recv().await.unwrap(), "pong");
    }

    #[test]
    fn sse_body_parses_into_frames() {
        let body = "event: message\ndata: {\"a\":1}\n\ndata: {\"b\":2}\n\n";
        let frames = parse_sse_frames(body);
        assert_eq!(frames, vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]);
    }
}
