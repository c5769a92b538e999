//! HTTP and WebSocket handlers for the relay

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;

use crate::auth::Handshake;
use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::identity::Identity;
use crate::protocol::ServerMessage;
use crate::queue::QueueStats;
use crate::session::DashboardBucket;

/// Shared state for handlers
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub started_at: Instant,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsConnectParams {
    /// Handshake auth field
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

fn deny_json(status: StatusCode, body: impl Serialize) -> Response {
    (status, Json(body)).into_response()
}

fn handshake_from(headers: &HeaderMap, params: WsConnectParams) -> Handshake {
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string());

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    Handshake {
        auth_token: params.token,
        authorization,
        client_ip,
        user_agent,
    }
}

/// WebSocket endpoint; the token is checked before the upgrade
pub async fn ws_connect(
    State(state): State<GatewayState>,
    Query(params): Query<WsConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let handshake = handshake_from(&headers, params);

    let identity = match state.dispatcher.authenticate(&handshake) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(client_ip = ?handshake.client_ip, error = %e, "Connection refused");
            return deny_json(
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: e.to_string(),
                    code: "AUTHENTICATION_ERROR",
                },
            );
        }
    };

    tracing::info!(
        user_id = %identity.id,
        role = %identity.role,
        client_ip = ?handshake.client_ip,
        "New relay connection"
    );

    ws.on_upgrade(move |socket| run_socket(state, socket, identity, handshake))
}

async fn run_socket(state: GatewayState, socket: WebSocket, identity: Identity, handshake: Handshake) {
    let dispatcher = state.dispatcher;
    let rooms = dispatcher.broadcaster().rooms().clone();

    let (connection, mut outbound) = Connection::new(
        identity,
        rooms.instance_id().to_string(),
        handshake.client_ip,
        handshake.user_agent,
    );
    let connection_id = connection.id.clone();
    dispatcher.on_connect(connection.clone()).await;

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = rooms.subscribe_heartbeat();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                message = outbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                tick = heartbeat.recv() => match tick {
                    Ok(ts) => ServerMessage::heartbeat(ts),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            };

            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(connection_id = %writer_id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Ping frames are answered by the websocket layer
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => dispatcher.handle_text(&connection, text.as_str()).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    writer.abort();
    tracing::info!(connection_id = %connection_id, "Connection closed");
    dispatcher.on_disconnect(&connection_id).await;
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    /// Seconds since start
    pub uptime: f64,
}

pub async fn health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime: state.started_at.elapsed().as_secs_f64(),
    })
}

pub async fn ready(State(state): State<GatewayState>) -> impl IntoResponse {
    let broadcaster = state.dispatcher.broadcaster();
    let presence_ok = broadcaster.presence().is_available().await;
    let store_ok = broadcaster.store().is_available().await;

    if presence_ok && store_ok {
        (StatusCode::OK, "READY")
    } else {
        tracing::warn!(presence_ok, store_ok, "Readiness check failed");
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub queue_stats: QueueStats,
    pub online_users_count: usize,
    pub dashboard_stats: Vec<DashboardBucket>,
}

pub async fn get_stats(State(state): State<GatewayState>) -> Response {
    let store = state.dispatcher.broadcaster().store();
    let queue_stats = state.dispatcher.queue().queue_stats();

    let stats = async {
        let online = store.get_online_users().await?;
        let dashboard_stats = store.get_dashboard_stats().await?;
        crate::Result::Ok(StatsResponse {
            queue_stats,
            online_users_count: online.len(),
            dashboard_stats,
        })
    };

    match stats.await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to collect stats");
            deny_json(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error: e.to_string(),
                    code: e.code(),
                },
            )
        }
    }
}

/// Health verdict with its checks and the underlying metrics
pub async fn get_metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.dispatcher.monitoring().get_health())
}
