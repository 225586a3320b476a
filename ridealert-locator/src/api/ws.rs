//! WebSocket channels
//!
//! Observer channels are pure subscribers: the path picks the scope, the
//! connection is registered with the [`BroadcastHub`](crate::broadcast::BroadcastHub)
//! and every frame sent is a serialized `CorrectedFix`. Inbound frames on an
//! observer channel are ignored apart from close.
//!
//! `/ws/iot/telemetry` is the device ingest channel: each text frame is a
//! `/predict` body, and each gets exactly one reply frame.

use super::predict::{run_prediction, PredictOutcome};
use crate::broadcast::{forward_to_sink, ConnectionId};
use crate::error::ApiError;
use crate::pipeline::TelemetryReading;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use ridealert_common::{CorrectedFix, ScopeKey};
use serde::Serialize;
use tracing::{debug, info, warn};

/// GET /ws/vehicle/:vehicle_id/location
pub async fn vehicle_location(
    ws: WebSocketUpgrade,
    Path(vehicle_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    observe(ws, state, scoped(ScopeKey::Vehicle, vehicle_id))
}

/// GET /ws/device/:device_id/location
pub async fn device_location(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    observe(ws, state, scoped(ScopeKey::Device, device_id))
}

/// GET /ws/fleet/:fleet_id/vehicles
pub async fn fleet_vehicles(
    ws: WebSocketUpgrade,
    Path(fleet_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    observe(ws, state, scoped(ScopeKey::Fleet, fleet_id))
}

/// GET /ws/vehicles/locations
pub async fn all_locations(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    observe(ws, state, Ok(ScopeKey::All))
}

fn scoped(make: fn(String) -> ScopeKey, id: String) -> Result<ScopeKey, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest("Identifier must not be empty".to_string()));
    }
    Ok(make(id.to_string()))
}

fn observe(ws: WebSocketUpgrade, state: AppState, scope: Result<ScopeKey, ApiError>) -> Response {
    match scope {
        Ok(scope) => ws
            .on_upgrade(move |socket| run_observer(socket, state, scope))
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn run_observer(socket: WebSocket, state: AppState, scope: ScopeKey) {
    let connection_id = ConnectionId::new();
    let subscriber = match state.hub.subscribe(connection_id, vec![scope]) {
        Ok(s) => s,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "Observer subscription refused");
            return;
        }
    };

    let (sink, mut inbound) = socket.split();
    let forward = forward_to_sink(subscriber, sink, state.send_timeout, encode_fix);
    tokio::pin!(forward);

    loop {
        tokio::select! {
            end = &mut forward => {
                debug!(connection_id = %connection_id, end = ?end, "Observer forwarding ended");
                break;
            }
            frame = inbound.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection_id = %connection_id, error = %e, "Observer socket error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

fn encode_fix(fix: &CorrectedFix) -> Option<Message> {
    match serde_json::to_string(fix) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!(error = %e, "Failed to serialize corrected fix");
            None
        }
    }
}

/// Reply frame on the ingest channel
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestReply {
    Fix {
        #[serde(flatten)]
        fix: CorrectedFix,
        delivered: usize,
    },
    Pending {
        status: &'static str,
        message: String,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

/// Handle one ingest frame
pub fn ingest_frame(state: &AppState, text: &str) -> IngestReply {
    let reading: TelemetryReading = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            return IngestReply::Error {
                code: "BAD_REQUEST",
                message: format!("Invalid telemetry frame: {}", e),
            }
        }
    };

    match run_prediction(state, &reading) {
        PredictOutcome::Corrected(c) => IngestReply::Fix {
            fix: c.fix,
            delivered: c.delivered,
        },
        PredictOutcome::Pending(p) => IngestReply::Pending {
            status: p.status,
            message: p.message,
        },
        PredictOutcome::Invalid(message) => IngestReply::Error {
            code: "BAD_REQUEST",
            message,
        },
        PredictOutcome::Unavailable(message) => IngestReply::Error {
            code: "SERVICE_UNAVAILABLE",
            message,
        },
    }
}

/// GET /ws/iot/telemetry
pub async fn iot_telemetry(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_ingest(socket, state))
}

async fn run_ingest(mut socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::new();
    info!(connection_id = %connection_id, "IoT device connected");

    while let Some(frame) = socket.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "IoT socket error");
                break;
            }
        };

        let reply = ingest_frame(&state, &text);
        let json = match serde_json::to_string(&reply) {
            Ok(json) => json,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Failed to serialize reply");
                continue;
            }
        };

        match tokio::time::timeout(state.send_timeout, socket.send(Message::Text(json))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "IoT reply failed");
                break;
            }
            Err(_) => {
                warn!(connection_id = %connection_id, "IoT reply timed out, disconnecting");
                break;
            }
        }
    }

    info!(connection_id = %connection_id, "IoT device disconnected");
}

/// Build WebSocket routes
pub fn ws_routes() -> Router<AppState> {
    Router::new()
        .route("/ws/vehicle/:vehicle_id/location", get(vehicle_location))
        .route("/ws/device/:device_id/location", get(device_location))
        .route("/ws/fleet/:fleet_id/vehicles", get(fleet_vehicles))
        .route("/ws/vehicles/locations", get(all_locations))
        .route("/ws/iot/telemetry", get(iot_telemetry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_scoped_rejects_blank_id() {
        assert!(scoped(ScopeKey::Vehicle, "  ".into()).is_err());
        assert_eq!(
            scoped(ScopeKey::Fleet, "f1".into()).unwrap(),
            ScopeKey::Fleet("f1".into())
        );
    }

    #[test]
    fn test_fix_reply_is_flat() {
        let reply = IngestReply::Fix {
            fix: CorrectedFix {
                latitude: 1.0,
                longitude: 2.0,
                source_device_id: None,
                vehicle_id: Some("v1".into()),
                fleet_id: None,
                timestamp: Utc::now(),
            },
            delivered: 3,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "fix");
        assert_eq!(json["vehicleId"], "v1");
        assert_eq!(json["delivered"], 3);
    }
}
