//! WebSocket handlers — stream one block's or one job's progress bus topic.
//!
//! The subscription is registered before the upgrade completes so no message
//! published after the handshake is missed. Each bus message is sent as a JSON
//! text frame; a `{type:"ping", t}` keep-alive goes out every 25 seconds. When
//! the topic is closed the socket is closed with code 1000.
//!
//! A job socket opened after the job finished ends right away with 1000.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::routes_jobs::parse_job_id;
use super::AppState;
use crate::events::{to_json, Subscription};
use crate::scheduler::SchedulerError;

const PING_INTERVAL: Duration = Duration::from_secs(25);

pub(super) async fn handler_ws_block(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(block_id): Path<i64>,
) -> impl IntoResponse {
    let sub = state.bus.subscribe(block_id);
    ws.on_upgrade(move |socket| ws_loop(socket, sub))
}

pub(super) async fn handler_ws_job(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Response {
    let id = match parse_job_id(&raw) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let sub = state.job_bus.subscribe(id);
    // Status is final before the topic closes, so checking after subscribing
    // cannot miss the close.
    match state.scheduler.job(&id) {
        None => return SchedulerError::NotFound("job".to_string()).into_response(),
        Some(job) if job.status.is_finished() => {
            state.job_bus.unsubscribe(&sub);
        }
        Some(_) => {}
    }
    ws.on_upgrade(move |socket| ws_loop(socket, sub))
}

fn ping_frame() -> String {
    let t = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    serde_json::json!({"type": "ping", "t": t}).to_string()
}

async fn ws_loop<K, M>(mut socket: WebSocket, mut sub: Subscription<K, M>)
where
    K: Eq + Hash + Copy + Debug,
    M: Serialize,
{
    let topic = sub.topic();
    info!(?topic, "progress stream opened");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    let ended = loop {
        tokio::select! {
            message = sub.recv() => {
                match message {
                    Some(message) => {
                        let frame = Message::Text(to_json(message.as_ref()).into());
                        if socket.send(frame).await.is_err() {
                            break false;
                        }
                    }
                    None => break true,
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Text(ping_frame().into())).await.is_err() {
                    break false;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break false,
                    _ => {}
                }
            }
        }
    };

    if ended {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
    }
    debug!(?topic, end_of_stream = ended, "progress stream closed");
}
