//! A single PTY-backed shell session: owns the pty, the transcript
//! recorder, and the output fan-out hub, and drives the lifecycle state
//! machine described for the session engine.

pub mod hub;
pub mod recorder;

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::pty;
use hub::{Chunk, ChunkKind, Hub, SubscribeConfig, Subscriber};
use recorder::{write_meta_mirror, MetaMirror, Recorder, TranscriptHeader};

const OUTPUT_CHUNK_SIZE: usize = 16 * 1024;

/// Lifecycle state of a session. Collapsed into one enum (rather than
/// separate running/exited/killed flags) so transitions can never drift
/// out of sync across the tasks that observe them.
#[derive(Debug, Clone)]
pub enum SessionState {
    Initializing,
    Running,
    Exiting,
    Exited {
        exit_status: Option<i32>,
        reason: &'static str,
    },
    /// Never constructed by [`Session::spawn`] in this implementation — a
    /// failed spawn returns `Err` before a `Session` value exists at all,
    /// so nothing is ever inserted into the registry in this state. Kept
    /// as an explicit variant because the session lifecycle contract
    /// names it as a reachable, queryable terminal state.
    #[allow(dead_code)]
    Failed {
        reason: String,
    },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Exited { .. } | SessionState::Failed { .. })
    }
}

pub struct SessionSpec {
    pub id: String,
    pub command: Vec<String>,
    pub cwd: String,
    pub title: String,
    pub env: Option<HashMap<String, String>>,
    pub cols: u16,
    pub rows: u16,
}

pub struct Session {
    pub id: String,
    pub title: String,
    pub command: Vec<String>,
    pub cwd: String,
    pub pid: u32,
    pub created_at: Instant,
    pub created_unix: u64,
    cols: AtomicU16,
    rows: AtomicU16,
    state: Arc<Mutex<SessionState>>,
    hub: Hub,
    recorder: Recorder,
    master: OwnedFd,
    write_half: Mutex<tokio::fs::File>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    exit_reason_hint: Mutex<&'static str>,
    storage_dir: std::path::PathBuf,
}

impl Session {
    /// Allocates a PTY, spawns `spec.command`, opens the transcript, and
    /// starts the output pump and reaper tasks. On success the returned
    /// session is already in the `Running` state.
    pub async fn spawn(
        spec: SessionSpec,
        storage_dir: &Path,
        queue_capacity: usize,
    ) -> Result<Arc<Self>, SessionError> {
        if spec.cols == 0 || spec.rows == 0 || spec.cols > 4096 || spec.rows > 4096 {
            return Err(SessionError::InvalidDimensions {
                cols: u32::from(spec.cols),
                rows: u32::from(spec.rows),
            });
        }

        let pair = pty::allocate(spec.cols, spec.rows)?;
        let child = pty::spawn(&pair, &spec.command, &spec.cwd, spec.env.as_ref())?;
        let pid = child.id().ok_or_else(|| {
            SessionError::SpawnFailed("child exited before id() could be read".into())
        })?;

        let master_raw = pair.master.as_raw_fd();
        // Separate fds for the read and write halves so the async read loop
        // and writer mutex never contend on the same File's internal cursor.
        let read_fd = dup_fd(master_raw)?;
        let write_fd = dup_fd(master_raw)?;
        // SAFETY: `dup_fd` returns a fresh, uniquely-owned fd.
        let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };
        let read_file = tokio::fs::File::from_std(read_file);
        let write_file = tokio::fs::File::from_std(write_file);

        let header = TranscriptHeader::new(spec.cols, spec.rows, spec.title.clone());
        let recorder = Recorder::create(storage_dir, &spec.id, &header).await?;

        let session = Arc::new(Session {
            id: spec.id.clone(),
            title: spec.title,
            command: spec.command,
            cwd: spec.cwd,
            pid,
            created_at: Instant::now(),
            created_unix: header.timestamp,
            cols: AtomicU16::new(spec.cols),
            rows: AtomicU16::new(spec.rows),
            state: Arc::new(Mutex::new(SessionState::Running)),
            hub: Hub::new(queue_capacity),
            recorder,
            master: pair.master,
            write_half: Mutex::new(write_file),
            tasks: Mutex::new(Vec::new()),
            exit_reason_hint: Mutex::new("normal"),
            storage_dir: storage_dir.to_path_buf(),
        });

        let (meta_cols, meta_rows) = session.dims();
        write_meta_mirror(
            storage_dir,
            &session.id,
            &MetaMirror {
                id: &session.id,
                title: &session.title,
                command: &session.command,
                cwd: &session.cwd,
                pid: session.pid,
                cols: meta_cols,
                rows: meta_rows,
                created_unix: session.created_unix,
                state: "running",
            },
        )
        .await;

        let pump = tokio::spawn(output_pump(Arc::clone(&session), read_file));
        let reaper = tokio::spawn(reap(Arc::clone(&session), child));
        session.tasks.lock().await.extend([pump, reaper]);

        info!(session_id = %session.id, pid, "session started");
        Ok(session)
    }

    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    pub fn dims(&self) -> (u16, u16) {
        (self.cols.load(Ordering::Relaxed), self.rows.load(Ordering::Relaxed))
    }

    fn elapsed_seconds(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64()
    }

    pub async fn attach(&self, mut config: SubscribeConfig) -> Result<Subscriber, SessionError> {
        let state = self.state.lock().await;
        match &*state {
            SessionState::Failed { reason } => return Err(SessionError::NotAttachable(reason.clone())),
            // The output pump and reaper are long gone and `close_all` has
            // already run once, so a fresh subscriber would otherwise block
            // on `recv()` forever. Hand it the terminal event directly.
            SessionState::Exited { reason, exit_status } => {
                config.already_ended = Some((*reason, *exit_status));
            }
            _ => {}
        }
        drop(state);
        Ok(self.hub.subscribe(config).await)
    }

    pub async fn unattach(&self, subscriber_id: u64) {
        self.hub.unsubscribe(subscriber_id).await;
    }

    pub async fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count().await
    }

    /// Forwards `bytes` to the pty and records them as one atomic `i` event.
    /// Concurrent writers are serialized by `write_half`'s mutex; a single
    /// call is one atomic chunk, never interleaved with another caller's.
    pub async fn write_input(&self, bytes: &[u8], writer_permitted: bool) -> Result<(), SessionError> {
        if !writer_permitted {
            return Err(SessionError::PermissionDenied);
        }
        {
            let state = self.state.lock().await;
            if !matches!(&*state, SessionState::Running) {
                return Err(SessionError::NotWritable(self.id.clone()));
            }
        }
        let offset = self.elapsed_seconds();
        let mut write_half = self.write_half.lock().await;
        write_half
            .write_all(bytes)
            .await
            .map_err(|e| SessionError::NotWritable(format!("{}: {e}", self.id)))?;
        drop(write_half);
        self.recorder.record_input(offset, bytes);
        Ok(())
    }

    /// Applies a resize to the pty and records it. Last writer wins under
    /// concurrent resizes; the ioctl write itself is atomic so no
    /// subscriber ever observes a half-applied dimension change.
    pub async fn resize(&self, cols: u16, rows: u16, writer_permitted: bool) -> Result<(), SessionError> {
        if !writer_permitted {
            return Err(SessionError::PermissionDenied);
        }
        {
            let state = self.state.lock().await;
            if !matches!(&*state, SessionState::Running) {
                return Err(SessionError::NotWritable(self.id.clone()));
            }
        }
        pty::resize(&self.master, cols, rows)?;
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);
        let offset = self.elapsed_seconds();
        self.recorder.record_resize(offset, cols, rows);
        self.hub
            .publish(Chunk {
                offset,
                kind: ChunkKind::Resize { cols, rows },
                data: Vec::new(),
            })
            .await;
        Ok(())
    }

    /// Sends `signal` to the session's process group. Idempotent: signaling
    /// an already-exited process group is a silent no-op.
    pub fn send_signal(&self, signal: i32) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        // SAFETY: kill(2) with a negative pid targets the process group;
        // ESRCH (already dead) is an expected, harmless outcome.
        unsafe {
            libc::kill(-pgid, signal);
        }
    }

    pub async fn kill(&self) {
        self.kill_with_reason("killed").await;
    }

    pub async fn kill_with_reason(&self, reason: &'static str) {
        *self.exit_reason_hint.lock().await = reason;
        self.send_signal(libc::SIGKILL);
    }

    /// SIGTERM, poll for exit up to `grace`, then SIGKILL. Idempotent.
    pub async fn graceful_kill(&self, grace: std::time::Duration) {
        self.graceful_kill_with_reason(grace, "killed").await;
    }

    pub async fn graceful_kill_with_reason(&self, grace: std::time::Duration, reason: &'static str) {
        if matches!(self.state().await, SessionState::Exited { .. }) {
            return;
        }
        *self.exit_reason_hint.lock().await = reason;
        self.send_signal(libc::SIGTERM);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if matches!(self.state().await, SessionState::Exited { .. }) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.send_signal(libc::SIGKILL);
    }

    /// Pushes a terminal "ended" chunk with reason `server_shutdown` to every
    /// live subscriber, without touching the child process. Called by the
    /// supervisor before it starts actually killing sessions, so attached
    /// transports get a chance to push a final control message to their
    /// peers rather than just seeing the TCP connection vanish.
    pub async fn notify_shutdown(&self) {
        if matches!(self.state().await, SessionState::Exited { .. }) {
            return;
        }
        self.hub.close_all("server_shutdown", None).await;
    }

    pub fn is_recorder_degraded(&self) -> bool {
        self.recorder.is_degraded()
    }

    pub async fn snapshot_transcript(&self) -> Result<impl tokio::io::AsyncRead + Unpin, SessionError> {
        self.recorder.snapshot().await
    }

    pub async fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        for t in tasks.drain(..) {
            t.abort();
        }
    }
}

fn dup_fd(fd: std::os::unix::io::RawFd) -> Result<std::os::unix::io::RawFd, SessionError> {
    // SAFETY: fd is a valid, open descriptor owned by this process.
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(SessionError::SpawnFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(dup)
}

async fn output_pump(session: Arc<Session>, mut read_file: tokio::fs::File) {
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    loop {
        match read_file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let offset = session.elapsed_seconds();
                let data = buf[..n].to_vec();
                session.recorder.record_output(offset, &data);
                session
                    .hub
                    .publish(Chunk {
                        offset,
                        kind: ChunkKind::Output,
                        data,
                    })
                    .await;
            }
            Err(e) => {
                warn!(session_id = %session.id, "pty read error: {e}");
                break;
            }
        }
    }

    let mut state = session.state.lock().await;
    if matches!(&*state, SessionState::Running) {
        *state = SessionState::Exiting;
    }
}

async fn reap(session: Arc<Session>, mut child: Child) {
    let status = child.wait().await.ok();
    let exit_code = status.and_then(|s| s.code());
    let reason = *session.exit_reason_hint.lock().await;

    let mut state = session.state.lock().await;
    *state = SessionState::Exited {
        exit_status: exit_code,
        reason,
    };
    drop(state);

    let offset = session.elapsed_seconds();
    session.recorder.record_marker(offset, "session ended");
    session.hub.close_all(reason, exit_code).await;

    let (cols, rows) = session.dims();
    write_meta_mirror(
        &session.storage_dir,
        &session.id,
        &MetaMirror {
            id: &session.id,
            title: &session.title,
            command: &session.command,
            cwd: &session.cwd,
            pid: session.pid,
            cols,
            rows,
            created_unix: session.created_unix,
            state: "exited",
        },
    )
    .await;

    info!(session_id = %session.id, exit_code, reason, "session ended");
}
