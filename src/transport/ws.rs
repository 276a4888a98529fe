//! Full-duplex WebSocket attach: binary frames for output, JSON frames for
//! control/input. Generalizes this crate's existing `tokio::select!`
//! dual-pump handler (one branch draining the subscriber, one reading
//! inbound frames) from an all-JSON per-connection protocol onto the
//! hub/subscriber model.
//!
//! The actual socket write is owned by a dedicated task fed through a
//! bounded channel rather than by the select loop itself: a `select!`
//! branch's body runs to completion before any other branch is polled
//! again, so a write blocked on real client-side backpressure would
//! otherwise stall ping/idle detection and inbound frame reads right
//! along with it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SessionError;
use crate::registry::Registry;
use crate::session::hub::{ChunkKind, SubscribeConfig, Subscriber};
use crate::session::Session;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Number of recently-published output chunks to replay on attach.
    #[serde(default)]
    pub replay: usize,
    /// Whether this attach may send `input`/`resize` frames. Defaults to
    /// `true` to preserve the historical WS behavior; a proxy fronting
    /// this crate can pass `write=false` to hand out read-only viewer
    /// links without relying on the client to behave.
    #[serde(default = "default_write")]
    pub write: bool,
}

fn default_write() -> bool {
    true
}

pub async fn upgrade(
    State(registry): State<Registry>,
    State(config): State<Arc<Config>>,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let session = match registry.get(&id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle(socket, session, query, config))
}

/// Outbound channel depth between the select loop and the socket-writer
/// task. Deep enough to absorb a burst of control frames landing alongside
/// a run of output chunks without the loop itself ever blocking on it.
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

async fn handle(socket: WebSocket, session: Arc<Session>, query: WsQuery, config: Arc<Config>) {
    let subscriber = match session
        .attach(SubscribeConfig {
            writer_permitted: query.write,
            queue_capacity: None,
            replay_backlog: query.replay,
            already_ended: None,
        })
        .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!(session_id = %session.id, "attach rejected: {e}");
            return;
        }
    };

    let idle_timeout = Duration::from_secs(config.idle_timeout_seconds);
    let (sink, mut stream) = futures::StreamExt::split(socket);
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let mut ping_interval = tokio::time::interval(idle_timeout);
    ping_interval.tick().await; // first tick fires immediately
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            chunk = subscriber.recv() => {
                let Some(chunk) = chunk else { break };
                match chunk.kind {
                    ChunkKind::Output => {
                        if out_tx.try_send(Message::Binary(chunk.data.into())).is_err() {
                            warn!(session_id = %session.id, "websocket send queue full, disconnecting slow consumer");
                            let _ = out_tx.try_send(json_message(&slow_consumer_error()));
                            break;
                        }
                    }
                    ChunkKind::Resize { cols, rows } => {
                        let msg = json!({"type": "resize", "cols": cols, "rows": rows});
                        if out_tx.try_send(json_message(&msg)).is_err() {
                            break;
                        }
                    }
                    ChunkKind::Ended { reason, exit_status } => {
                        let msg = json!({"type": "ended", "reason": reason, "exit_status": exit_status});
                        let _ = out_tx.try_send(json_message(&msg));
                        break;
                    }
                }
            }

            // Raced independently of whether the current chunk's send has
            // completed: an eviction means this subscriber can't keep up
            // with the live stream, so disconnect as soon as the hub
            // reports one rather than waiting on the next delivered chunk.
            _ = subscriber.dropped_signal() => {
                warn!(session_id = %session.id, dropped = subscriber.dropped_count(), "websocket subscriber slow, disconnecting");
                let _ = out_tx.try_send(json_message(&slow_consumer_error()));
                break;
            }

            frame = futures::StreamExt::next(&mut stream) => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    Message::Text(text) => {
                        let (flow, reply) =
                            handle_inbound(&session, &subscriber, &text, &mut last_pong).await;
                        if let Some(msg) = reply {
                            let _ = out_tx.try_send(json_message(&msg));
                        }
                        if flow.is_break() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }

            _ = ping_interval.tick() => {
                if last_pong.elapsed() > idle_timeout {
                    let msg = json!({"type": "error", "reason": "idle_timeout"});
                    let _ = out_tx.try_send(json_message(&msg));
                    warn!(session_id = %session.id, "websocket idle timeout");
                    break;
                }
                if out_tx.try_send(json_message(&json!({"type": "ping"}))).is_err() {
                    break;
                }
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    info!(session_id = %session.id, "websocket detached");
}

fn slow_consumer_error() -> Value {
    json!({"type": "error", "reason": "slow_consumer"})
}

/// Owns the socket's write half. Runs on its own task so a write blocked on
/// real backpressure can never stall the connection's select loop — it just
/// backs up `rx` instead.
async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if futures::SinkExt::send(&mut sink, msg).await.is_err() {
            break;
        }
    }
}

enum ControlFlow {
    Continue,
    Break,
}

impl ControlFlow {
    fn is_break(&self) -> bool {
        matches!(self, ControlFlow::Break)
    }
}

/// Returns the frame's control-flow outcome alongside an optional reply
/// frame the caller should send back (e.g. a `permission_denied` error),
/// so this stays testable without a live socket to write into.
async fn handle_inbound(
    session: &Arc<Session>,
    subscriber: &Subscriber,
    text: &str,
    last_pong: &mut tokio::time::Instant,
) -> (ControlFlow, Option<serde_json::Value>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return (ControlFlow::Continue, None);
    };
    match value.get("type").and_then(|v| v.as_str()) {
        Some("input") => {
            let mut reply = None;
            if let Some(data) = value.get("data").and_then(|v| v.as_str()) {
                let writer_permitted = subscriber.writer_permitted();
                if let Err(e) = session.write_input(data.as_bytes(), writer_permitted).await {
                    warn!(session_id = %session.id, "input rejected: {e}");
                    if matches!(e, SessionError::PermissionDenied) {
                        reply = Some(json!({"type": "error", "reason": "permission_denied"}));
                    }
                }
            }
            (ControlFlow::Continue, reply)
        }
        Some("resize") => {
            let cols = value.get("cols").and_then(serde_json::Value::as_u64).unwrap_or(0) as u16;
            let rows = value.get("rows").and_then(serde_json::Value::as_u64).unwrap_or(0) as u16;
            let writer_permitted = subscriber.writer_permitted();
            let mut reply = None;
            if let Err(e) = session.resize(cols, rows, writer_permitted).await {
                warn!(session_id = %session.id, "resize rejected: {e}");
                if matches!(e, SessionError::PermissionDenied) {
                    reply = Some(json!({"type": "error", "reason": "permission_denied"}));
                }
            }
            (ControlFlow::Continue, reply)
        }
        Some("pong") => {
            *last_pong = tokio::time::Instant::now();
            (ControlFlow::Continue, None)
        }
        _ => (ControlFlow::Continue, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionSpec};

    async fn running_session(dir: &tempfile::TempDir) -> Arc<Session> {
        let spec = SessionSpec {
            id: uuid::Uuid::new_v4().to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "cat".to_string()],
            cwd: "/".to_string(),
            title: "test".to_string(),
            env: None,
            cols: 80,
            rows: 24,
        };
        Session::spawn(spec, dir.path(), 64).await.unwrap()
    }

    async fn attached(session: &Arc<Session>, writer_permitted: bool) -> Subscriber {
        session
            .attach(SubscribeConfig {
                writer_permitted,
                queue_capacity: None,
                replay_backlog: 0,
                already_ended: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pong_frame_refreshes_last_pong() {
        let dir = tempfile::tempdir().unwrap();
        let session = running_session(&dir).await;
        let subscriber = attached(&session, true).await;
        let mut last_pong = tokio::time::Instant::now() - Duration::from_secs(120);
        let before = last_pong;

        handle_inbound(&session, &subscriber, r#"{"type":"pong"}"#, &mut last_pong).await;

        assert!(last_pong > before);
        session.kill().await;
    }

    #[tokio::test]
    async fn resize_frame_applies_to_session_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let session = running_session(&dir).await;
        let subscriber = attached(&session, true).await;
        let mut last_pong = tokio::time::Instant::now();

        handle_inbound(
            &session,
            &subscriber,
            r#"{"type":"resize","cols":100,"rows":50}"#,
            &mut last_pong,
        )
        .await;

        assert_eq!(session.dims(), (100, 50));
        session.kill().await;
    }

    #[tokio::test]
    async fn malformed_frame_is_ignored_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let session = running_session(&dir).await;
        let subscriber = attached(&session, true).await;
        let mut last_pong = tokio::time::Instant::now();

        let (flow, reply) = handle_inbound(&session, &subscriber, "not json", &mut last_pong).await;
        assert!(!flow.is_break());
        assert!(reply.is_none());
        session.kill().await;
    }

    #[tokio::test]
    async fn input_frame_rejected_without_writer_permission() {
        let dir = tempfile::tempdir().unwrap();
        let session = running_session(&dir).await;
        let subscriber = attached(&session, false).await;
        let mut last_pong = tokio::time::Instant::now();

        let (flow, reply) = handle_inbound(
            &session,
            &subscriber,
            r#"{"type":"input","data":"echo hi\n"}"#,
            &mut last_pong,
        )
        .await;

        assert!(!flow.is_break());
        assert_eq!(
            reply,
            Some(json!({"type": "error", "reason": "permission_denied"}))
        );
        session.kill().await;
    }
}

fn json_message(value: &Value) -> Message {
    Message::Text(value.to_string().into())
}
