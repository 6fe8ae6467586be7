pub mod connection;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use self::connection::WsConnection;
use crate::broker::{connection::ConnectionHandle, Broker};
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, RelayError};

#[derive(Clone)]
struct WsRouterState {
    broker: Broker,
    max_frame_bytes: usize,
}

/// Query string of `GET /ws`.
#[derive(Debug, Default, Deserialize)]
pub struct AdmissionParams {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub device: String,
}

pub fn router(broker: Broker, max_frame_bytes: usize) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(WsRouterState { broker, max_frame_bytes })
}

async fn ws_upgrade(
    State(state): State<WsRouterState>,
    Query(params): Query<AdmissionParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    for (field, value) in [("user", &params.user), ("device", &params.device)] {
        if value.trim().is_empty() {
            warn!(field, "rejecting websocket admission without identity");
            return RelayError::new(ErrorCode::ValidationFailed, format!("{field} must not be empty"))
                .with_details(json!({ "field": field }))
                .into_response();
        }
    }
    if state.broker.is_shut_down() {
        return RelayError::from_code(ErrorCode::ShuttingDown).into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    let broker = state.broker;
    ws.max_frame_size(state.max_frame_bytes)
        .max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, serve_socket(broker, params, socket)).await;
        })
}

async fn serve_socket(broker: Broker, params: AdmissionParams, socket: WebSocket) {
    let connection: ConnectionHandle = Arc::new(WsConnection::new(socket));
    match broker.admit(&params.user, &params.device, connection) {
        Ok(handler) => {
            if let Err(error) = handler.await {
                warn!(user_id = %params.user, device_id = %params.device, error = %error, "connection handler failed");
            }
        }
        Err(error) => {
            warn!(user_id = %params.user, device_id = %params.device, error = %error, "admission rejected");
        }
    }
}
