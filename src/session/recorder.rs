//! Append-only transcript recorder.
//!
//! Writes one JSON header line followed by `[offset, kind, payload]` event
//! lines to `<storage_dir>/<session-id>/cast`. A dedicated background task
//! owns the file handle; `record_*` calls hand events to it over a channel
//! so the hot path (the session's output pump) never blocks on disk I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::SessionError;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptHeader {
    pub version: u32,
    pub width: u16,
    pub height: u16,
    pub timestamp: u64,
    pub title: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl TranscriptHeader {
    pub fn new(width: u16, height: u16, title: impl Into<String>) -> Self {
        Self {
            version: 2,
            width,
            height,
            timestamp: now_unix_seconds(),
            title: title.into(),
            env: HashMap::new(),
        }
    }
}

fn now_unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One event record: `[offset_seconds, kind, payload]` once serialized.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub offset: f64,
    pub kind: EventKind,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Output,
    Input,
    Resize,
    Marker,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            EventKind::Output => "o",
            EventKind::Input => "i",
            EventKind::Resize => "r",
            EventKind::Marker => "m",
        }
    }
}

impl TranscriptEvent {
    fn to_line(&self) -> Result<String, SessionError> {
        let value = serde_json::json!([self.offset, self.kind.as_str(), self.payload]);
        Ok(serde_json::to_string(&value)?)
    }
}

/// Handle to a session's transcript file. Cheap to clone; clones share the
/// background writer task and the degraded-state flag.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::Sender<TranscriptEvent>,
    degraded: Arc<AtomicBool>,
    path: PathBuf,
}

impl Recorder {
    /// Create the transcript file, write its header, and spawn the writer
    /// task. Returns `RecorderIo` if the file can't be created.
    pub async fn create(
        storage_dir: &Path,
        session_id: &str,
        header: &TranscriptHeader,
    ) -> Result<Self, SessionError> {
        let dir = storage_dir.join(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("cast");

        let mut file = File::create(&path).await?;
        let header_line = serde_json::to_string(header)?;
        file.write_all(header_line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let degraded = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer_task(file, rx, Arc::clone(&degraded)));

        Ok(Self {
            tx,
            degraded,
            path,
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn record_output(&self, offset: f64, bytes: &[u8]) {
        self.enqueue(TranscriptEvent {
            offset,
            kind: EventKind::Output,
            payload: String::from_utf8_lossy(bytes).into_owned(),
        });
    }

    pub fn record_input(&self, offset: f64, bytes: &[u8]) {
        self.enqueue(TranscriptEvent {
            offset,
            kind: EventKind::Input,
            payload: String::from_utf8_lossy(bytes).into_owned(),
        });
    }

    pub fn record_resize(&self, offset: f64, cols: u16, rows: u16) {
        self.enqueue(TranscriptEvent {
            offset,
            kind: EventKind::Resize,
            payload: format!("{cols}x{rows}"),
        });
    }

    pub fn record_marker(&self, offset: f64, payload: impl Into<String>) {
        self.enqueue(TranscriptEvent {
            offset,
            kind: EventKind::Marker,
            payload: payload.into(),
        });
    }

    fn enqueue(&self, event: TranscriptEvent) {
        if self.degraded.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.try_send(event).is_err() {
            warn!(path = %self.path.display(), "transcript writer backlogged, dropping event");
        }
    }

    /// Open a reader bounded to the file's length at the moment of the call.
    /// Events appended after this call are not observed through it.
    pub async fn snapshot(&self) -> Result<impl tokio::io::AsyncRead + Unpin, SessionError> {
        let file = File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        Ok(file.take(len))
    }
}

/// Metadata mirror written alongside the transcript (`<id>/meta.json`).
/// Not read back by this process — it exists so a boot-time scan after a
/// restart (which cannot recover a live PTY) can still identify which pid
/// produced a given transcript and whether it is still running.
#[derive(Debug, Serialize)]
pub struct MetaMirror<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub command: &'a [String],
    pub cwd: &'a str,
    pub pid: u32,
    pub cols: u16,
    pub rows: u16,
    pub created_unix: u64,
    pub state: &'a str,
}

pub async fn write_meta_mirror(storage_dir: &Path, id: &str, meta: &MetaMirror<'_>) {
    let path = storage_dir.join(id).join("meta.json");
    match serde_json::to_vec_pretty(meta) {
        Ok(bytes) => {
            if let Err(e) = tokio::fs::write(&path, bytes).await {
                warn!(path = %path.display(), "failed to write metadata mirror: {e}");
            }
        }
        Err(e) => warn!("failed to serialize metadata mirror: {e}"),
    }
}

async fn writer_task(
    mut file: File,
    mut rx: mpsc::Receiver<TranscriptEvent>,
    degraded: Arc<AtomicBool>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(event) = rx.try_recv() {
            batch.push(event);
        }

        let mut buf = String::new();
        for event in &batch {
            match event.to_line() {
                Ok(line) => {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Err(e) => warn!("failed to serialize transcript event: {e}"),
            }
        }

        if let Err(e) = file.write_all(buf.as_bytes()).await {
            warn!("transcript write failed, entering degraded state: {e}");
            degraded.store(true, Ordering::Relaxed);
            continue;
        }
        if let Err(e) = file.flush().await {
            warn!("transcript flush failed, entering degraded state: {e}");
            degraded.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    #[tokio::test]
    async fn records_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let header = TranscriptHeader::new(80, 24, "test");
        let recorder = Recorder::create(dir.path(), "abc", &header).await.unwrap();

        recorder.record_output(0.1, b"hello");
        recorder.record_resize(0.2, 120, 40);
        recorder.record_input(0.3, b"ls\n");

        // Give the writer task a chance to drain and flush.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut reader = recorder.snapshot().await.unwrap();
        let mut contents = String::new();
        reader.read_to_string(&mut contents).await.unwrap();

        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4); // header + 3 events
        assert!(lines[1].contains("\"o\""));
        assert!(lines[2].contains("120x40"));
        assert!(lines[3].contains("\"i\""));
    }

    #[tokio::test]
    async fn snapshot_does_not_observe_later_events() {
        let dir = tempfile::tempdir().unwrap();
        let header = TranscriptHeader::new(80, 24, "test");
        let recorder = Recorder::create(dir.path(), "abc", &header).await.unwrap();

        recorder.record_output(0.1, b"first");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut reader = recorder.snapshot().await.unwrap();
        recorder.record_output(0.2, b"second");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut contents = String::new();
        reader.read_to_string(&mut contents).await.unwrap();
        assert!(contents.contains("first"));
        assert!(!contents.contains("second"));
    }
}
