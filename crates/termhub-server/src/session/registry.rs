//! Session table: identity, capacity cap, close/close-all.
//!
//! The table is an explicitly constructed value shared by handle; there is no
//! global state. Capacity is checked under the same write lock that inserts,
//! so concurrent creates cannot overshoot the cap.

use super::activity::{self, ActivityClassifier, ActivityConfig};
use super::fanout::{OutputHub, Subscription};
use super::pty::{PtyProcess, SpawnConfig, Termination};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use termhub_core::{TermError, TermResult};
use tokio::sync::{watch, OnceCell, RwLock};
use tracing::{debug, info, warn};

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of simultaneously active sessions.
    pub max_sessions: usize,
    /// How long a terminate signal may take before the process is killed.
    pub graceful_timeout: Duration,
    /// Per-subscriber output queue length, in chunks.
    pub subscriber_buffer: usize,
    pub spawn: SpawnConfig,
    pub activity: ActivityConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            graceful_timeout: Duration::from_millis(5000),
            subscriber_buffer: 256,
            spawn: SpawnConfig::default(),
            activity: ActivityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Exited,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub cwd: PathBuf,
    pub status: SessionStatus,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub waiting: bool,
}

/// One supervised process and its streams.
pub struct Session {
    id: String,
    cwd: PathBuf,
    created_at: SystemTime,
    process: PtyProcess,
    output: OutputHub,
    activity: Arc<ActivityClassifier>,
    termination: OnceCell<Termination>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn status(&self) -> SessionStatus {
        if self.process.has_exited() {
            SessionStatus::Exited
        } else {
            SessionStatus::Active
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.process.exit_code()
    }

    pub fn is_waiting(&self) -> bool {
        self.activity.is_waiting()
    }

    /// Observe flips of the waiting-for-input flag.
    pub fn waiting_watch(&self) -> watch::Receiver<bool> {
        self.activity.watch()
    }

    /// Live output from now on.
    pub fn subscribe(&self) -> Subscription {
        self.output.subscribe()
    }

    /// Resolves to `Some(code)` once the process exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.process.exit_watch()
    }

    /// Whether the output stream has ended for everyone.
    pub fn output_closed(&self) -> bool {
        self.output.is_closed()
    }

    /// Output subscribers, including the activity classifier's own.
    pub fn subscriber_count(&self) -> usize {
        self.output.subscriber_count()
    }

    pub fn exit_listener_count(&self) -> usize {
        self.process.exit_listener_count()
    }

    pub fn summary(&self) -> SessionSummary {
        let created_at = self
            .created_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        SessionSummary {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            status: self.status(),
            created_at,
            exit_code: self.exit_code(),
            waiting: self.is_waiting(),
        }
    }

    /// Send input to the process. Input to an exited process is dropped.
    pub fn write(&self, data: &[u8]) -> TermResult<()> {
        if self.process.has_exited() {
            debug!(session_id = %self.id, bytes = data.len(), "dropping input for exited session");
            return Ok(());
        }
        self.activity.note_input();
        match self.process.write(data) {
            Ok(()) => Ok(()),
            // Raced with exit.
            Err(_) if self.process.has_exited() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Change the terminal geometry. A no-op once the process has exited.
    pub fn resize(&self, cols: u16, rows: u16) -> TermResult<()> {
        if cols == 0 || rows == 0 {
            return Err(TermError::Protocol(format!(
                "invalid terminal size {cols}x{rows}"
            )));
        }
        if self.process.has_exited() {
            return Ok(());
        }
        match self.process.resize(cols, rows) {
            Ok(()) => Ok(()),
            Err(_) if self.process.has_exited() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Terminate once. Concurrent and later callers share the first outcome.
    async fn terminate(&self, timeout: Duration) -> Termination {
        let outcome = *self
            .termination
            .get_or_init(|| self.process.terminate(timeout))
            .await;
        // Ends every bridge even if the process could not be reaped.
        self.output.close();
        outcome
    }
}

/// All sessions of one server instance.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Ids of sessions being spawned. Only added to while holding the
    /// `sessions` write lock, so the capacity check never undercounts.
    reserved: Mutex<HashSet<String>>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Spawn a new session in `cwd`.
    ///
    /// A slot is reserved under the table lock, the process is spawned on a
    /// blocking thread with the lock released, then the session is inserted.
    pub async fn create(&self, cwd: &Path) -> TermResult<SessionSummary> {
        let cwd = validate_cwd(cwd)?;

        let reservation = {
            let sessions = self.sessions.write().await;
            let mut reserved = lock_reserved(&self.reserved);
            let active = sessions.values().filter(|s| !s.process.has_exited()).count();
            if active + reserved.len() >= self.config.max_sessions {
                warn!(
                    active,
                    pending = reserved.len(),
                    max = self.config.max_sessions,
                    "session capacity reached"
                );
                return Err(TermError::CapacityExceeded {
                    max: self.config.max_sessions,
                });
            }
            let id = loop {
                let candidate = generate_session_id();
                if !sessions.contains_key(&candidate) && !reserved.contains(&candidate) {
                    break candidate;
                }
            };
            reserved.insert(id.clone());
            Reservation {
                reserved: &self.reserved,
                id,
            }
        };
        let id = reservation.id.clone();

        let output = OutputHub::new(self.config.subscriber_buffer);
        let activity = Arc::new(ActivityClassifier::new(self.config.activity.clone()));
        // Subscribe before spawning so the classifier sees the first bytes.
        let activity_feed = output.subscribe_unbounded();
        let process = {
            let id = id.clone();
            let cwd = cwd.clone();
            let spawn = self.config.spawn.clone();
            let output = output.clone();
            tokio::task::spawn_blocking(move || PtyProcess::spawn(&id, &cwd, &spawn, output))
                .await
                .map_err(|e| TermError::SpawnFailed(format!("spawn task failed: {e}")))??
        };
        tokio::spawn(activity::run(activity.clone(), activity_feed, id.clone()));

        let session = Arc::new(Session {
            id: id.clone(),
            cwd,
            created_at: SystemTime::now(),
            process,
            output,
            activity,
            termination: OnceCell::new(),
        });
        let summary = session.summary();

        let mut sessions = self.sessions.write().await;
        sessions.insert(id.clone(), session);
        // Release the slot only once the session itself counts.
        drop(reservation);
        info!(session_id = %id, cwd = %summary.cwd.display(), total = sessions.len(), "session created");
        Ok(summary)
    }

    pub async fn get(&self, id: &str) -> TermResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TermError::SessionNotFound(id.to_string()))
    }

    /// Snapshot of every session, oldest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<_> = sessions.values().map(|s| s.summary()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Terminate the session and remove it from the table.
    ///
    /// Fails with `SessionNotFound` once a previous close has completed.
    pub async fn close(&self, id: &str) -> TermResult<Termination> {
        let session = self.get(id).await?;
        let outcome = session.terminate(self.config.graceful_timeout).await;

        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(id) {
                Some(current) if Arc::ptr_eq(current, &session) => sessions.remove(id),
                _ => None,
            }
        };
        if removed.is_some() {
            info!(session_id = %id, outcome = ?outcome, "session closed");
        }
        Ok(outcome)
    }

    /// Close every session concurrently and wait for all of them.
    pub async fn close_all(&self) -> Vec<(String, TermResult<Termination>)> {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        if ids.is_empty() {
            return Vec::new();
        }
        info!(count = ids.len(), "closing all sessions");
        let outcomes = join_all(ids.iter().map(|id| self.close(id))).await;
        ids.into_iter().zip(outcomes).collect()
    }

    /// Forward input to a session.
    pub async fn write(&self, id: &str, data: &[u8]) -> TermResult<()> {
        self.get(id).await?.write(data)
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> TermResult<()> {
        self.get(id).await?.resize(cols, rows)
    }

    /// Drop sessions that exited on their own more than `retention` ago.
    ///
    /// Returns the removed ids.
    pub async fn reap_exited(&self, retention: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let mut removed = Vec::new();
        sessions.retain(|id, session| {
            let expired = session
                .process
                .exited_at()
                .is_some_and(|at| at.elapsed() >= retention);
            if expired {
                removed.push(id.clone());
            }
            !expired
        });
        if !removed.is_empty() {
            info!(count = removed.len(), "reaped exited sessions");
        }
        removed
    }

    /// Number of sessions whose process is still running.
    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.process.has_exited())
            .count()
    }

    /// Number of table entries, exited ones included.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// A capacity slot held while a session is being spawned. Dropping it
/// frees the slot, including when `create` fails or is cancelled.
struct Reservation<'a> {
    reserved: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock_reserved(self.reserved).remove(&self.id);
    }
}

fn lock_reserved(reserved: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    reserved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn validate_cwd(cwd: &Path) -> TermResult<PathBuf> {
    if cwd.as_os_str().is_empty() {
        return Err(TermError::InvalidTarget("empty working directory".into()));
    }
    match std::fs::metadata(cwd) {
        Ok(meta) if meta.is_dir() => Ok(cwd.to_path_buf()),
        Ok(_) => Err(TermError::InvalidTarget(format!(
            "{} is not a directory",
            cwd.display()
        ))),
        Err(e) => Err(TermError::InvalidTarget(format!("{}: {e}", cwd.display()))),
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}
