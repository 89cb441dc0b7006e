//! WebSocket endpoints: live log and plan streams.
//!
//! One JSON object per text frame. On connect the last `history` events are
//! replayed, then live events follow. A subscriber that falls behind gets a
//! `{"type":"dropped","count":N}` marker instead of the lost frames.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use conductor_core::bus::{self, Subscription};

use crate::context::Ctx;

/// Default replay depth for `/ws/logs`.
const DEFAULT_HISTORY: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub history: Option<usize>,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
}

pub async fn logs_ws(
    State(ctx): State<Ctx>,
    Path(worker_id): Path<String>,
    Query(query): Query<LogsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let history = query.history.unwrap_or(DEFAULT_HISTORY).min(bus::LOG_RING);
    let subscription = ctx.bus.subscribe(&bus::topic_log(&worker_id), history);
    upgrade.on_upgrade(move |socket| {
        stream_events(socket, subscription, query.project_id, query.task_id)
    })
}

pub async fn plan_ws(
    State(ctx): State<Ctx>,
    Path((project_id, task_id)): Path<(String, String)>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let subscription = ctx
        .bus
        .subscribe(&bus::topic_plan(&project_id, &task_id), DEFAULT_HISTORY);
    upgrade.on_upgrade(move |socket| stream_events(socket, subscription, None, None))
}

/// Pump bus events to the socket until either side goes away.
async fn stream_events(
    socket: WebSocket,
    mut subscription: Subscription,
    project_filter: Option<String>,
    task_filter: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if !passes_filter(&event, project_filter.as_deref(), task_filter.as_deref()) {
                    continue;
                }
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    // Clients only ever send pings/closes on these sockets.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Frames that carry routing metadata are matched against the filters;
/// frames without it (markers, plan messages) always pass.
fn passes_filter(event: &serde_json::Value, project: Option<&str>, task: Option<&str>) -> bool {
    if let Some(project) = project {
        if let Some(frame_project) = event.get("project_id").and_then(|v| v.as_str()) {
            if frame_project != project {
                return false;
            }
        }
    }
    if let Some(task) = task {
        if let Some(frame_task) = event.get("task_id").and_then(|v| v.as_str()) {
            if frame_task != task {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_on_metadata() {
        let frame = json!({"type":"assistant","project_id":"p1","task_id":"t-000001"});
        assert!(passes_filter(&frame, None, None));
        assert!(passes_filter(&frame, Some("p1"), None));
        assert!(!passes_filter(&frame, Some("p2"), None));
        assert!(passes_filter(&frame, Some("p1"), Some("t-000001")));
        assert!(!passes_filter(&frame, Some("p1"), Some("t-000002")));
    }

    #[test]
    fn frames_without_metadata_always_pass() {
        let marker = json!({"type":"dropped","count":3});
        assert!(passes_filter(&marker, Some("p1"), Some("t-000001")));
    }
}
