//! WebSocket push channel (`/jobs`)
//!
//! Clients subscribe to job ids and receive `job-update` events as the
//! status fabric publishes them. The protocol is a small tagged-JSON
//! dialect; unknown messages get an `error` reply rather than a disconnect.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use cg_common::JobStatusUpdate;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;

/// Client-to-server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    Subscribe { #[serde(rename = "jobId")] job_id: String },
    Unsubscribe { #[serde(rename = "jobId")] job_id: String },
    Status { #[serde(rename = "jobId")] job_id: String },
    Stats,
    Ping,
}

/// Server-to-client messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ServerMessage {
    Welcome {
        #[serde(rename = "clientId")]
        client_id: String,
        timestamp: i64,
    },
    JobUpdate {
        #[serde(flatten)]
        update: JobStatusUpdate,
    },
    SubscriptionConfirmed {
        #[serde(rename = "jobId")]
        job_id: String,
        subscribed: bool,
    },
    Status {
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        update: Option<JobStatusUpdate>,
    },
    StatisticsResponse {
        statistics: crate::status::StatusStatistics,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        message: String,
    },
}

pub async fn jobs_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_socket(state, socket))
}

async fn run_socket(state: AppState, mut socket: WebSocket) {
    let (handle, mut updates) = state.fabric.register();
    info!(client = %handle, "Push subscriber connected");

    let welcome = ServerMessage::Welcome {
        client_id: handle.to_string(),
        timestamp: Utc::now().timestamp_millis(),
    };
    if send(&mut socket, &welcome).await.is_err() {
        state.fabric.drop_handle(handle);
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Some(update) => {
                        let message = ServerMessage::JobUpdate { update };
                        if send(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                    // Fabric dropped us (slow consumer or housekeeping).
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        state.fabric.touch(handle);
                        let reply = handle_client_message(&state, handle, &text);
                        if send(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        state.fabric.touch(handle);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        let reply = ServerMessage::Error {
                            message: "expected text frames".to_string(),
                        };
                        if send(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(client = %handle, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    state.fabric.drop_handle(handle);
    info!(client = %handle, "Push subscriber disconnected");
}

fn handle_client_message(state: &AppState, handle: Uuid, text: &str) -> ServerMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(client = %handle, error = %e, "Unparseable push-channel message");
            return ServerMessage::Error {
                message: format!("unrecognized message: {}", e),
            };
        }
    };

    match message {
        ClientMessage::Subscribe { job_id } => {
            let subscribed = state.fabric.subscribe(handle, &job_id);
            ServerMessage::SubscriptionConfirmed {
                job_id,
                subscribed,
            }
        }
        ClientMessage::Unsubscribe { job_id } => {
            state.fabric.unsubscribe(handle, &job_id);
            ServerMessage::SubscriptionConfirmed {
                job_id,
                subscribed: false,
            }
        }
        ClientMessage::Status { job_id } => ServerMessage::Status {
            update: state.fabric.get_status(&job_id),
            job_id,
        },
        ClientMessage::Stats => ServerMessage::StatisticsResponse {
            statistics: state.fabric.statistics(),
        },
        ClientMessage::Ping => ServerMessage::Pong {
            timestamp: Utc::now().timestamp_millis(),
        },
    }
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_else(|_| {
        r#"{"type":"error","message":"serialization failure"}"#.to_string()
    });
    socket.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_kebab_case_types() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","jobId":"j1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { job_id } if job_id == "j1"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn server_messages_serialize_with_type_tag() {
        let json = serde_json::to_value(ServerMessage::Pong { timestamp: 1 }).unwrap();
        assert_eq!(json["type"], "pong");

        let json = serde_json::to_value(ServerMessage::SubscriptionConfirmed {
            job_id: "j1".to_string(),
            subscribed: true,
        })
        .unwrap();
        assert_eq!(json["type"], "subscription-confirmed");
        assert_eq!(json["jobId"], "j1");
    }

    #[test]
    fn job_update_flattens_the_status_fields() {
        let update = JobStatusUpdate::now("j1", cg_common::JobStatus::Completed, "standard");
        let json = serde_json::to_value(ServerMessage::JobUpdate { update }).unwrap();
        assert_eq!(json["type"], "job-update");
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["status"], "completed");
    }
}
