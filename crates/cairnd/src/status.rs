//! HTTP status endpoint — exposes node identity and membership as JSON.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use cairn_core::NodeIdentity;
use cairn_services::{PeerRegistry, PeerSnapshot, TcpConnector};

#[derive(Clone)]
pub struct StatusState {
    pub identity: Arc<NodeIdentity>,
    pub registry: Arc<PeerRegistry<TcpConnector>>,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub node:      String,
    pub instance:  String,
    pub interface: String,
    pub ips:       Vec<String>,
    pub rpc_port:  u16,
    pub peers:     Vec<PeerSnapshot>,
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    let mut peers = state.registry.snapshot();
    peers.sort_by(|a, b| a.name.cmp(&b.name));

    Json(StatusResponse {
        node:      state.identity.name().to_string(),
        instance:  state.identity.instance().to_string(),
        interface: state.identity.interface().name.clone(),
        ips:       state.identity.ips().iter().map(|ip| ip.to_string()).collect(),
        rpc_port:  state.identity.rpc_port(),
        peers,
    })
}

pub async fn serve(
    state: StatusState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/status", get(handle_status))
        .with_state(state);

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status listening on 127.0.0.1");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
