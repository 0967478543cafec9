//! HTTP command injector
//!
//! | Route                    | Queued command                  |
//! |--------------------------|---------------------------------|
//! | `GET /message/:msg`      | `msg`                           |
//! | `GET /connect/*multiaddr`| `/connect /<multiaddr>`         |
//! | `GET /relay/*multiaddr`  | `/relay /<multiaddr>`           |
//! | `GET /addrs`             | none, lists this node's address |
//! | `GET /contacts`          | none, lists contacts            |
//!
//! Commands are queued without waiting; a full queue answers 503.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use peerchat_core::{ContactSummary, NodeSession};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type Rejection = (StatusCode, String);

pub fn router(session: Arc<NodeSession>) -> Router {
    Router::new()
        .route("/message/:msg", get(push_message))
        .route("/connect/*multiaddr", get(push_connect))
        .route("/relay/*multiaddr", get(push_relay))
        .route("/addrs", get(list_addrs))
        .route("/contacts", get(list_contacts))
        .with_state(session)
}

/// Serve the injector until `shutdown` fires
pub async fn serve(
    session: Arc<NodeSession>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP command injector listening");

    axum::serve(listener, router(session))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("HTTP command injector stopped");
    Ok(())
}

fn enqueue(session: &NodeSession, command: String) -> Result<Json<String>, Rejection> {
    session.queue().try_submit(command.clone()).map_err(|e| {
        warn!(%command, error = %e, "Rejecting HTTP command");
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;
    Ok(Json(command))
}

fn control(keyword: &str, multiaddr: &str) -> String {
    format!("/{} /{}", keyword, multiaddr.trim_matches('/'))
}

async fn push_message(
    State(session): State<Arc<NodeSession>>,
    Path(msg): Path<String>,
) -> Result<Json<String>, Rejection> {
    enqueue(&session, msg)
}

async fn push_connect(
    State(session): State<Arc<NodeSession>>,
    Path(multiaddr): Path<String>,
) -> Result<Json<String>, Rejection> {
    enqueue(&session, control("connect", &multiaddr))
}

async fn push_relay(
    State(session): State<Arc<NodeSession>>,
    Path(multiaddr): Path<String>,
) -> Result<Json<String>, Rejection> {
    enqueue(&session, control("relay", &multiaddr))
}

async fn list_addrs(State(session): State<Arc<NodeSession>>) -> Json<Vec<String>> {
    Json(
        session
            .p2p_addresses()
            .iter()
            .map(|addr| addr.to_string())
            .collect(),
    )
}

async fn list_contacts(State(session): State<Arc<NodeSession>>) -> Json<Vec<ContactSummary>> {
    Json(session.contacts())
}
