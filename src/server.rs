use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, Router},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::inspector::{InboundRequest, Inspector, ACK_BODY};
use crate::trace::TraceSink;

struct AppState {
    inspector: Inspector,
    sink: Arc<dyn TraceSink>,
}

/// Fixed acknowledgment, whatever happened while inspecting.
pub fn acknowledge() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        ACK_BODY,
    )
        .into_response()
}

async fn inspect_request(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let inbound = InboundRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
    };
    let trace = state.inspector.inspect(inbound).await;
    state.sink.emit(&trace);

    acknowledge()
}

/// The capture route, accepting any method, wired to `sink`.
pub fn router(config: &Config, sink: Arc<dyn TraceSink>) -> Router {
    let state = Arc::new(AppState {
        inspector: Inspector::new(config),
        sink,
    });

    Router::new()
        .route(&config.path, any(inspect_request))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

pub async fn serve(config: Config) -> Result<()> {
    let addr = config.listen_addr()?;
    let app = router(&config, config.trace_output.sink());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        address = %listener.local_addr()?,
        path = %config.path,
        profile = ?config.profile,
        max_output_bytes = config.max_output_bytes,
        "Listening for connections"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
