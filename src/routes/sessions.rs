//! REST endpoints for session lifecycle.
//!
//! - `POST   /sessions`              — create
//! - `GET    /sessions`              — list
//! - `GET    /sessions/{id}`         — metadata
//! - `POST   /sessions/{id}/input`   — forward input
//! - `POST   /sessions/{id}/resize`  — resize
//! - `DELETE /sessions/{id}`         — kill
//! - `GET    /sessions/{id}/snapshot` — one-shot transcript dump
//!
//! WebSocket and SSE attach live in [`crate::transport`] rather than here —
//! they aren't request/response REST calls.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;

use crate::error::SessionError;
use crate::registry::{Registry, SessionMetadata};
use crate::util::expand_tilde;

fn describe(meta: &SessionMetadata) -> Value {
    json!({
        "id": meta.id,
        "title": meta.title,
        "command": meta.command,
        "cwd": meta.cwd,
        "cols": meta.cols,
        "rows": meta.rows,
        "pid": meta.pid,
        "created_unix": meta.created_unix,
        "state": meta.state,
        "exit_code": meta.exit_code,
    })
}

#[derive(Deserialize)]
pub struct CreateRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}

/// `POST /sessions` — spawn a new PTY-backed session.
pub async fn create(
    State(registry): State<Registry>,
    Json(req): Json<CreateRequest>,
) -> Result<(StatusCode, Json<Value>), SessionError> {
    if req.command.is_empty() {
        return Err(SessionError::InvalidRequest("command must not be empty".to_string()));
    }
    let cwd = req
        .cwd
        .map_or_else(|| "/".to_string(), |cwd| expand_tilde(&cwd).into_owned());
    let session = registry
        .create(req.command, cwd, req.title, req.cols, req.rows)
        .await?;
    let meta = registry.describe_one(&session.id).await?;
    Ok((StatusCode::CREATED, Json(describe(&meta))))
}

/// `GET /sessions` — list all sessions known to the registry.
pub async fn list(State(registry): State<Registry>) -> Json<Value> {
    let sessions: Vec<Value> = registry.list().await.iter().map(describe).collect();
    Json(json!({ "sessions": sessions }))
}

/// `GET /sessions/{id}` — metadata for one session.
pub async fn get(
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SessionError> {
    let meta = registry.describe_one(&id).await?;
    Ok(Json(describe(&meta)))
}

/// `DELETE /sessions/{id}` — kill a session.
pub async fn kill(
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SessionError> {
    registry.kill(&id).await?;
    Ok(Json(json!({ "ok": true, "id": id })))
}

#[derive(Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /sessions/{id}/resize`.
pub async fn resize(
    State(registry): State<Registry>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<Json<Value>, SessionError> {
    let session = registry.get(&id).await?;
    // REST has no subscriber/writer-token concept; authorization for this
    // surface is delegated entirely to upstream middleware.
    session.resize(req.cols, req.rows, true).await?;
    Ok(Json(json!({ "ok": true, "cols": req.cols, "rows": req.rows })))
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum InputRequest {
    Text { text: String },
    Key { key: String },
}

/// `POST /sessions/{id}/input` — forward literal text or a named key.
pub async fn input(
    State(registry): State<Registry>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<Json<Value>, SessionError> {
    let session = registry.get(&id).await?;
    let bytes: &[u8] = match &req {
        InputRequest::Text { text } => text.as_bytes(),
        InputRequest::Key { key } => key_bytes(key).ok_or_else(|| SessionError::UnknownKey(key.clone()))?,
    };
    session.write_input(bytes, true).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Maps the input endpoint's symbolic key names to their byte sequences.
/// Unknown names are rejected by the caller rather than silently forwarded.
fn key_bytes(key: &str) -> Option<&'static [u8]> {
    match key {
        "enter" => Some(b"\r"),
        "escape" => Some(b"\x1b"),
        "tab" => Some(b"\t"),
        "backspace" => Some(b"\x7f"),
        "delete" => Some(b"\x1b[3~"),
        "arrow_up" => Some(b"\x1b[A"),
        "arrow_down" => Some(b"\x1b[B"),
        "arrow_right" => Some(b"\x1b[C"),
        "arrow_left" => Some(b"\x1b[D"),
        "ctrl_enter" => Some(b"\n"),
        "shift_enter" => Some(b"\x1b\r"),
        _ => None,
    }
}

/// `GET /sessions/{id}/snapshot` — one-shot dump of the transcript as
/// recorded so far, in the same newline-delimited cast format it's stored
/// in on disk.
pub async fn snapshot(
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> Result<Response, SessionError> {
    let session = registry.get(&id).await?;
    let reader = session.snapshot_transcript().await?;
    let stream = ReaderStream::new(reader);
    let body = Body::from_stream(stream);
    Ok((
        StatusCode::OK,
        [("content-type", "application/x-ndjson")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::{get as get_route, post};
    use axum::Router;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn router(registry: Registry) -> Router {
        Router::new()
            .route("/sessions", post(create).get(list))
            .route("/sessions/{id}", get_route(get).delete(kill))
            .route("/sessions/{id}/input", post(input))
            .route("/sessions/{id}/resize", post(resize))
            .route("/sessions/{id}/snapshot", get_route(snapshot))
            .with_state(registry)
    }

    fn test_registry(dir: &tempfile::TempDir) -> Registry {
        Registry::new(8, dir.path().to_path_buf(), Duration::from_secs(30), 64)
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_then_list_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let app = router(registry.clone());

        let req = Request::builder()
            .method("POST")
            .uri("/sessions")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"command": ["/bin/sh", "-c", "sleep 30"]}).to_string(),
            ))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_string();

        let req = Request::builder().uri("/sessions").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let listed = body_json(resp).await;
        assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);

        let req = Request::builder()
            .uri(format!("/sessions/{id}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let meta = body_json(resp).await;
        assert_eq!(meta["id"], id);

        registry.get(&id).await.unwrap().kill().await;
    }

    #[tokio::test]
    async fn create_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_registry(&dir));

        let req = Request::builder()
            .method("POST")
            .uri("/sessions")
            .header("content-type", "application/json")
            .body(Body::from(json!({"command": []}).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_missing_session_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_registry(&dir));

        let req = Request::builder()
            .uri("/sessions/does-not-exist")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn input_rejects_unknown_named_key() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let session = registry
            .create(
                vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
                "/".to_string(),
                None,
                80,
                24,
            )
            .await
            .unwrap();
        let id = session.id.clone();
        let app = router(registry);

        let req = Request::builder()
            .method("POST")
            .uri(format!("/sessions/{id}/input"))
            .header("content-type", "application/json")
            .body(Body::from(json!({"key": "super_delete"}).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        session.kill().await;
    }

    #[tokio::test]
    async fn resize_rejects_invalid_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let session = registry
            .create(
                vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
                "/".to_string(),
                None,
                80,
                24,
            )
            .await
            .unwrap();
        let id = session.id.clone();
        let app = router(registry);

        let req = Request::builder()
            .method("POST")
            .uri(format!("/sessions/{id}/resize"))
            .header("content-type", "application/json")
            .body(Body::from(json!({"cols": 0, "rows": 0}).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        session.kill().await;
    }
}
