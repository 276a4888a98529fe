//! Read-only SSE attach: snapshot-then-tail replay of a session's transcript,
//! serialized as the same `[offset, kind, payload]` events the on-disk cast
//! format uses. Generalizes this crate's single shared-`broadcast`-channel
//! event stream onto the hub's per-subscriber model.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream;
use tokio::io::AsyncBufReadExt;
use tracing::warn;

use crate::registry::Registry;
use crate::session::hub::{ChunkKind, SubscribeConfig, Subscriber};

enum Phase {
    /// Streaming the transcript lines captured at snapshot-open time.
    Snapshot(VecDeque<String>),
    /// Draining the hub subscriber, discarding anything already covered by
    /// the snapshot (offset <= last_offset).
    Live,
    Done,
}

pub async fn stream(
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let session = match registry.get(&id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    // Subscribe to the hub *before* opening the transcript snapshot: any
    // output produced in the window between snapshot-open and subscribe
    // would otherwise be silently lost. See the replay-boundary design
    // note this crate's session engine follows.
    let subscriber = match session
        .attach(SubscribeConfig {
            writer_permitted: false,
            queue_capacity: None,
            replay_backlog: 0,
            already_ended: None,
        })
        .await
    {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    let (lines, last_offset) = match session.snapshot_transcript().await {
        Ok(reader) => read_snapshot(reader).await,
        Err(e) => {
            warn!(session_id = %id, "failed to open transcript snapshot: {e}");
            (VecDeque::new(), 0.0)
        }
    };

    let guard = Guard(subscriber);
    let state = (Phase::Snapshot(lines), guard, last_offset);

    let events = stream::unfold(state, move |(mut phase, mut guard, last_offset)| async move {
        loop {
            match phase {
                Phase::Snapshot(mut lines) => {
                    if let Some(line) = lines.pop_front() {
                        let ev: Result<Event, Infallible> = Ok(Event::default().data(line));
                        return Some((ev, (Phase::Snapshot(lines), guard, last_offset)));
                    }
                    phase = Phase::Live;
                }
                Phase::Live => match guard.0.recv().await {
                    None => return None,
                    Some(chunk) => match chunk.kind {
                        ChunkKind::Output if chunk.offset > last_offset => {
                            let payload = String::from_utf8_lossy(&chunk.data).into_owned();
                            let line = serde_json::json!([chunk.offset, "o", payload]).to_string();
                            let ev: Result<Event, Infallible> = Ok(Event::default().data(line));
                            return Some((ev, (Phase::Live, guard, last_offset)));
                        }
                        ChunkKind::Resize { cols, rows } if chunk.offset > last_offset => {
                            let line =
                                serde_json::json!([chunk.offset, "r", format!("{cols}x{rows}")])
                                    .to_string();
                            let ev: Result<Event, Infallible> = Ok(Event::default().data(line));
                            return Some((ev, (Phase::Live, guard, last_offset)));
                        }
                        ChunkKind::Ended { reason, exit_status } => {
                            let body =
                                serde_json::json!({ "reason": reason, "exit_status": exit_status })
                                    .to_string();
                            let ev: Result<Event, Infallible> =
                                Ok(Event::default().event("end").data(body));
                            return Some((ev, (Phase::Done, guard, last_offset)));
                        }
                        // Already covered by the snapshot we just streamed.
                        _ => {
                            phase = Phase::Live;
                        }
                    },
                },
                Phase::Done => return None,
            }
        }
    });

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("heartbeat"))
        .into_response()
}

/// Wraps the subscriber so it (and the connection-count decrement, if one is
/// threaded in by the caller) is released when the SSE stream is dropped —
/// e.g. on client disconnect, detected by axum as a write failure on the
/// underlying body rather than anything this handler polls for explicitly.
struct Guard(Subscriber);

async fn read_snapshot(
    reader: impl tokio::io::AsyncRead + Unpin,
) -> (VecDeque<String>, f64) {
    let mut lines = tokio::io::BufReader::new(reader).lines();
    let mut out = VecDeque::new();
    let mut last_offset = 0.0;
    let mut first = true;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if first {
                    // Header line, not a replayable event.
                    first = false;
                    continue;
                }
                if let Some(offset) = parse_offset(&line) {
                    last_offset = offset;
                }
                out.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("error reading transcript snapshot: {e}");
                break;
            }
        }
    }
    (out, last_offset)
}

fn parse_offset(line: &str) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value.get(0)?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::time::Duration as StdDuration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn replay_then_end_for_a_short_lived_command() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(8, dir.path().to_path_buf(), StdDuration::from_secs(30), 64);
        let session = registry
            .create(
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "sleep 0.2; echo hello".to_string(),
                ],
                "/".to_string(),
                None,
                80,
                24,
            )
            .await
            .unwrap();
        let id = session.id.clone();

        let app = Router::new()
            .route("/sessions/{id}/stream", get(stream))
            .with_state(registry);

        let req = Request::builder()
            .uri(format!("/sessions/{id}/stream"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);

        // The child exits almost immediately, so the hub emits `Ended` and
        // the stream terminates on its own rather than running forever.
        let bytes = tokio::time::timeout(StdDuration::from_secs(5), resp.into_body().collect())
            .await
            .expect("sse stream should end once the session exits")
            .unwrap()
            .to_bytes();
        let body = String::from_utf8_lossy(&bytes);

        assert!(body.contains("hello"), "replay should include the echoed output: {body}");
        assert!(body.contains("event: end"), "stream should end with a terminal event: {body}");
        assert!(body.contains("\"normal\""), "exit reason should be normal: {body}");
    }

    #[tokio::test]
    async fn unknown_session_returns_404() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(8, dir.path().to_path_buf(), StdDuration::from_secs(30), 64);

        let app = Router::new()
            .route("/sessions/{id}/stream", get(stream))
            .with_state(registry);

        let req = Request::builder()
            .uri("/sessions/does-not-exist/stream")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
