//! The `serve` command: run the aggregator on stdio, HTTP, or both.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use magg_core::Settings;
use magg_server::{http, serve_stdio, BearerAuth, MaggServer};

use crate::commands::ServeMode;

pub async fn execute(settings: Settings, mode: ServeMode, host: &str, port: u16) -> anyhow::Result<()> {
    let server = MaggServer::new(settings.clone()).map_err(|e| anyhow::anyhow!(e))?;
    server.start().await;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let auth = auth_for(&settings);
    let result = match mode {
        ServeMode::Stdio => run_stdio(&server, &cancel).await,
        ServeMode::Http => run_http(&server, auth, host, port, &cancel).await,
        ServeMode::Hybrid => {
            let http_server = Arc::clone(&server);
            let http_cancel = cancel.clone();
            let host = host.to_string();
            let http_task = tokio::spawn(async move {
                run_http(&http_server, auth, &host, port, &http_cancel).await
            });

            let stdio_result = run_stdio(&server, &cancel).await;
            cancel.cancel();
            let _ = http_task.await;
            stdio_result
        }
    };

    server.stop().await;

    if cancel.is_cancelled() {
        // Conventional exit code for an interrupt.
        std::process::exit(130);
    }
    result
}

fn auth_for(settings: &Settings) -> Option<Arc<BearerAuth>> {
    let auth = BearerAuth::new(settings.key_dir(), settings.private_key.clone());
    if auth.enabled() {
        tracing::info!("bearer authentication enabled");
        Some(Arc::new(auth))
    } else {
        None
    }
}

async fn run_stdio(server: &Arc<MaggServer>, cancel: &CancellationToken) -> anyhow::Result<()> {
    tokio::select! {
        result = serve_stdio(Arc::clone(server)) => result,
        () = cancel.cancelled() => Ok(()),
    }
}

async fn run_http(
    server: &Arc<MaggServer>,
    auth: Option<Arc<BearerAuth>>,
    host: &str,
    port: u16,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    http::serve_http(Arc::clone(server), auth, listener, cancel.clone()).await
}
