//! Process-wide catalog of live sessions.
//!
//! Mirrors the teacher's `SessionManager` map shape, but splits admission
//! control into a brief read-lock check, an unlocked construction, and a
//! re-checked write-lock insert — holding the write lock across the whole
//! PTY spawn (as the teacher does) conflicts with this crate's locking
//! discipline of keeping critical sections to map mutation only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::session::{Session, SessionSpec, SessionState};

pub struct RegistryEntry {
    pub session: Arc<Session>,
    pub created_at: Instant,
    pub exited_at: Option<Instant>,
}

#[derive(Clone)]
pub struct Registry {
    sessions: Arc<RwLock<HashMap<String, RegistryEntry>>>,
    max_sessions: usize,
    storage_dir: PathBuf,
    post_exit_retention: Duration,
    queue_capacity: usize,
}

pub struct SessionMetadata {
    pub id: String,
    pub title: String,
    pub command: Vec<String>,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub pid: u32,
    pub created_unix: u64,
    pub state: String,
    pub exit_code: Option<i32>,
}

impl Registry {
    pub fn new(
        max_sessions: usize,
        storage_dir: PathBuf,
        post_exit_retention: Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
            storage_dir,
            post_exit_retention,
            queue_capacity,
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub async fn create(
        &self,
        command: Vec<String>,
        cwd: String,
        title: Option<String>,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Session>, SessionError> {
        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.max_sessions {
                return Err(SessionError::SessionLimitReached(self.max_sessions));
            }
        }

        let id = Uuid::new_v4().to_string();
        let title = title.unwrap_or_else(|| command.join(" "));
        let spec = SessionSpec {
            id: id.clone(),
            command,
            cwd,
            title,
            env: None,
            cols,
            rows,
        };

        let session = Session::spawn(spec, &self.storage_dir, self.queue_capacity).await?;

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            // Lost the admission race to a concurrent creator; roll back.
            drop(sessions);
            session.kill_with_reason("spawn_failed").await;
            return Err(SessionError::SessionLimitReached(self.max_sessions));
        }
        sessions.insert(
            id.clone(),
            RegistryEntry {
                session: Arc::clone(&session),
                created_at: Instant::now(),
                exited_at: None,
            },
        );
        info!(session_id = %id, total = sessions.len(), "session registered");
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|e| Arc::clone(&e.session))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionMetadata> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for (id, entry) in sessions.iter() {
            out.push(describe(id, &entry.session).await);
        }
        out
    }

    pub async fn describe_one(&self, id: &str) -> Result<SessionMetadata, SessionError> {
        let session = self.get(id).await?;
        Ok(describe(id, &session).await)
    }

    pub async fn kill(&self, id: &str) -> Result<(), SessionError> {
        let session = self.get(id).await?;
        session.graceful_kill_with_reason(Duration::from_secs(3), "killed").await;
        Ok(())
    }

    pub async fn close_all(&self, shutdown_grace: Duration) {
        let sessions = self.sessions.read().await;
        let count = sessions.len();
        if count == 0 {
            return;
        }
        for (id, entry) in sessions.iter() {
            entry.session.notify_shutdown().await;
            entry.session.send_signal(libc::SIGTERM);
            info!(session_id = %id, "SIGTERM sent (shutdown)");
        }
        drop(sessions);

        tokio::time::sleep(shutdown_grace).await;

        let sessions = self.sessions.read().await;
        for (id, entry) in sessions.iter() {
            if !matches!(entry.session.state().await, SessionState::Exited { .. }) {
                entry.session.send_signal(libc::SIGKILL);
            }
            entry.session.abort_tasks().await;
            info!(session_id = %id, "session stopped (shutdown)");
        }
        info!("shut down {count} session(s)");
    }

    /// Removes exited entries past their retention window (and with no
    /// attached subscribers). Returns the ids removed so callers can
    /// broadcast a destroyed notification.
    pub async fn sweep(&self) -> Vec<String> {
        let mut expired = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            for entry in sessions.values_mut() {
                if entry.exited_at.is_none()
                    && matches!(entry.session.state().await, SessionState::Exited { .. })
                {
                    entry.exited_at = Some(Instant::now());
                }
            }
            for (id, entry) in sessions.iter() {
                let past_retention = entry
                    .exited_at
                    .is_some_and(|t| t.elapsed() > self.post_exit_retention);
                if past_retention && entry.session.subscriber_count().await == 0 {
                    expired.push(id.clone());
                }
            }
        }

        let mut removed = Vec::new();
        let mut sessions = self.sessions.write().await;
        for id in expired {
            if let Some(entry) = sessions.remove(&id) {
                entry.session.abort_tasks().await;
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            warn!(count = removed.len(), "swept exited sessions past retention");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::hub::SubscribeConfig;

    fn test_registry(dir: &tempfile::TempDir, max: usize, retention: Duration) -> Registry {
        Registry::new(max, dir.path().to_path_buf(), retention, 64)
    }

    #[tokio::test]
    async fn create_rejects_once_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 1, Duration::from_secs(30));

        let first = registry
            .create(
                vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
                "/".to_string(),
                None,
                80,
                24,
            )
            .await
            .unwrap();

        let err = registry
            .create(
                vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
                "/".to_string(),
                None,
                80,
                24,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionLimitReached(1)));

        first.kill().await;
    }

    #[tokio::test]
    async fn sweep_leaves_exited_session_with_live_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 8, Duration::from_millis(0));

        let session = registry
            .create(
                vec!["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()],
                "/".to_string(),
                None,
                80,
                24,
            )
            .await
            .unwrap();
        let id = session.id.clone();

        let subscriber = session.attach(SubscribeConfig::default()).await.unwrap();

        for _ in 0..50 {
            if matches!(
                session.state().await,
                crate::session::SessionState::Exited { .. }
            ) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Zero-retention would normally make this immediately eligible, but
        // the attached subscriber must keep it alive until it detaches.
        let removed = registry.sweep().await;
        assert!(!removed.contains(&id));
        assert!(registry.get(&id).await.is_ok());

        drop(subscriber);
        // Dropping a Subscriber unsubscribes via a spawned detached task;
        // give it a tick to run before sweeping again.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let removed = registry.sweep().await;
        assert!(removed.contains(&id));
        assert!(matches!(registry.get(&id).await, Err(SessionError::NotFound(_))));
    }
}

async fn describe(id: &str, session: &Arc<Session>) -> SessionMetadata {
    let (cols, rows) = session.dims();
    let (state, exit_code) = match session.state().await {
        SessionState::Initializing => ("initializing".to_string(), None),
        SessionState::Running => ("running".to_string(), None),
        SessionState::Exiting => ("exiting".to_string(), None),
        SessionState::Exited { exit_status, .. } => ("exited".to_string(), exit_status),
        SessionState::Failed { .. } => ("failed".to_string(), None),
    };
    SessionMetadata {
        id: id.to_string(),
        title: session.title.clone(),
        command: session.command.clone(),
        cwd: session.cwd.clone(),
        cols,
        rows,
        pid: session.pid,
        created_unix: session.created_unix,
        state,
        exit_code,
    }
}
