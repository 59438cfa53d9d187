//! ==============================================================================
//! web.rs - dashboard read api
//! ==============================================================================
//!
//! purpose:
//!     thin json surface over the hub for the dashboard front end.
//!
//! routes:
//!
//! ```text
//! GET  /api/active                  -> {identity: {name, liveness, address, socketURL}}
//! GET  /api/devices/:identity       -> full detail for one device
//! POST /api/command?device=&cmd=&sub=   optional json body = telemetry patch
//! ```
//!
//! identities contain slashes (`http://greenhouse1.local`), so clients
//! percent-encode them in the path. `sub` must not contain one.
//!
//! ==============================================================================

use crate::commands::SocketCommand;
use crate::correlator::Outcome;
use crate::domain::{DeviceDetail, DeviceSummary, Telemetry};
use crate::error::HubResult;
use crate::hub::Hub;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;

pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/api/active", get(active_handler))
        .route("/api/devices/:identity", get(detail_handler))
        .route("/api/command", post(command_handler))
        .with_state(hub)
}

pub async fn serve(hub: Hub, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "dashboard api listening");
    axum::serve(listener, router(hub)).await?;
    Ok(())
}

async fn active_handler(State(hub): State<Hub>) -> Json<BTreeMap<String, DeviceSummary>> {
    Json(hub.directory().active())
}

async fn detail_handler(
    State(hub): State<Hub>,
    Path(identity): Path<String>,
) -> Result<Json<DeviceDetail>, StatusCode> {
    hub.directory()
        .detail(&identity)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct CommandParams {
    device: String,
    cmd: String,
    #[serde(default)]
    sub: Option<String>,
}

/// POST /api/command?device=http://greenhouse1.local&cmd=RELAY_CTRL&sub=1
async fn command_handler(
    State(hub): State<Hub>,
    Query(params): Query<CommandParams>,
    body: Option<Json<Telemetry>>,
) -> Json<Value> {
    let patch = body.map(|Json(patch)| patch);

    match run_command(&hub, params, patch).await {
        Ok((command, Outcome::Resolved(reply))) => Json(json!({
            "status": "ok",
            "command": command.name(),
            "reply": reply.payload,
        })),
        Ok((_, Outcome::Failed(reply))) => Json(json!({
            "status": "error",
            "message": "device reported failure",
            "reply": reply.payload,
        })),
        Ok((_, Outcome::Expired)) => Json(json!({"status": "error", "message": "request timed out"})),
        Ok((_, Outcome::Cancelled)) => Json(json!({"status": "error", "message": "request cancelled"})),
        Err(e) => Json(json!({"status": "error", "message": e.to_string()})),
    }
}

async fn run_command(
    hub: &Hub,
    params: CommandParams,
    patch: Option<Telemetry>,
) -> HubResult<(SocketCommand, Outcome)> {
    let command: SocketCommand = params.cmd.parse()?;
    let sub = params.sub.unwrap_or_else(|| "0".to_string());
    let outcome = hub.command(&params.device, command, sub, patch).await?;
    Ok((command, outcome))
}
