//! PTY-backed child process using portable-pty.
//!
//! Owns one child from spawn to reap. Two OS threads run per process: one
//! pumps PTY output into the session's [`OutputHub`], one waits for the
//! child and publishes its exit code. Termination is graceful first, then
//! forced after a timeout.

use super::fanout::OutputHub;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use termhub_core::{TermError, TermResult};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long the exit observer waits for the output pump to drain before
/// announcing the exit.
const EXIT_DRAIN_WINDOW: Duration = Duration::from_millis(250);

/// How long to wait for the reap after a force kill.
const FORCE_KILL_GRACE: Duration = Duration::from_millis(500);

const READ_BUF_SIZE: usize = 8192;

/// What to launch for each session.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            command: crate::config::default_shell(),
            args: Vec::new(),
            env: HashMap::new(),
            cols: termhub_core::DEFAULT_COLS,
            rows: termhub_core::DEFAULT_ROWS,
        }
    }
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited on its own.
    AlreadyExited,
    /// The process exited after the graceful signal.
    Graceful,
    /// The timeout elapsed and the process was force-killed.
    Forced,
}

/// A managed PTY child process.
pub struct PtyProcess {
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    /// Mutex because MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    exited_at: Arc<OnceLock<Instant>>,
    /// Set as soon as `wait()` returns, before the exit is published.
    reaped: Arc<AtomicBool>,
}

impl PtyProcess {
    /// Spawn the configured command inside `cwd` and start pumping its
    /// output into `output`.
    pub fn spawn(
        session_id: &str,
        cwd: &Path,
        config: &SpawnConfig,
        output: OutputHub,
    ) -> TermResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        if config.command.trim().is_empty() {
            return Err(TermError::SpawnFailed("empty command".into()));
        }
        let mut cmd = CommandBuilder::new(&config.command);
        cmd.args(&config.args);
        cmd.cwd(cwd);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermError::SpawnFailed(format!("{}: {e}", config.command)))?;
        // Only the child holds the slave side, so the reader sees EOF on exit.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TermError::SpawnFailed(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TermError::SpawnFailed(format!("failed to take PTY writer: {e}")))?;

        let (exit_tx, _) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        let exited_at = Arc::new(OnceLock::new());
        let reaped = Arc::new(AtomicBool::new(false));
        let (drained_tx, drained_rx) = std_mpsc::channel();

        {
            let output = output.clone();
            let session_id = session_id.to_string();
            std::thread::Builder::new()
                .name(format!("pty-read-{}", short(&session_id)))
                .spawn(move || pump_output(reader, output, drained_tx, &session_id))?;
        }
        {
            let exit_tx = exit_tx.clone();
            let exited_at = exited_at.clone();
            let reaped = reaped.clone();
            let session_id = session_id.to_string();
            std::thread::Builder::new()
                .name(format!("pty-wait-{}", short(&session_id)))
                .spawn(move || {
                    let exit = ExitSignals {
                        exit_tx,
                        exited_at,
                        reaped,
                    };
                    observe_exit(child, exit, drained_rx, output, &session_id)
                })?;
        }

        info!(
            session_id,
            pid,
            command = %config.command,
            cwd = %cwd.display(),
            cols = config.cols,
            rows = config.rows,
            "PTY spawned"
        );

        Ok(Self {
            pid,
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            exit_tx,
            exited_at,
            reaped,
        })
    }

    /// Exit code, once the child has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_tx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// When the exit was observed.
    pub fn exited_at(&self) -> Option<Instant> {
        self.exited_at.get().copied()
    }

    /// Receiver that resolves to `Some(code)` when the child exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_tx.subscribe()
    }

    /// Number of live exit listeners.
    pub fn exit_listener_count(&self) -> usize {
        self.exit_tx.receiver_count()
    }

    /// Write bytes to the child's terminal input.
    pub fn write(&self, data: &[u8]) -> TermResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TermError::Other("PTY writer lock poisoned".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Change the terminal geometry.
    pub fn resize(&self, cols: u16, rows: u16) -> TermResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| TermError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Ask the child to stop, force-kill it if it is still alive after
    /// `timeout`. Resolves once the child has exited or the force kill has
    /// been issued and given a short grace period to reap.
    pub async fn terminate(&self, timeout: Duration) -> Termination {
        let mut exit_rx = self.exit_watch();
        let already_exited = exit_rx.borrow().is_some();
        if already_exited {
            return Termination::AlreadyExited;
        }

        if let Err(e) = self.signal_terminate() {
            warn!(pid = self.pid, error = %e, "failed to deliver terminate signal");
        }

        // The losing branch (timer or exit wait) is dropped with the timeout future.
        let graceful = tokio::time::timeout(timeout, exit_rx.wait_for(Option::is_some))
            .await
            .is_ok();
        if graceful {
            return Termination::Graceful;
        }

        warn!(
            pid = self.pid,
            timeout_ms = timeout.as_millis() as u64,
            "process ignored terminate signal, force killing"
        );
        if let Err(e) = self.force_kill() {
            warn!(pid = self.pid, error = %e, "force kill failed");
        }
        let reaped = tokio::time::timeout(FORCE_KILL_GRACE, exit_rx.wait_for(Option::is_some))
            .await
            .is_ok();
        if !reaped {
            warn!(pid = self.pid, "process not reaped after force kill");
        }
        Termination::Forced
    }

    /// Hang up the terminal, then ask politely. Interactive shells ignore
    /// SIGTERM but exit on SIGHUP.
    #[cfg(unix)]
    fn signal_terminate(&self) -> std::io::Result<()> {
        self.signal(libc::SIGHUP)?;
        self.signal(libc::SIGTERM)
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) -> std::io::Result<()> {
        self.force_kill()
    }

    #[cfg(unix)]
    fn force_kill(&self) -> std::io::Result<()> {
        self.signal(libc::SIGKILL)
    }

    #[cfg(not(unix))]
    fn force_kill(&self) -> std::io::Result<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| std::io::Error::other("child killer lock poisoned"))?;
        killer.kill()
    }

    /// Signal the child's process group, falling back to the child alone.
    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) -> std::io::Result<()> {
        if self.reaped.load(Ordering::Acquire) {
            // The pid may already belong to someone else.
            return Ok(());
        }
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()).filter(|p| *p > 0) else {
            let mut killer = self
                .killer
                .lock()
                .map_err(|_| std::io::Error::other("child killer lock poisoned"))?;
            return killer.kill();
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(-pid, signal) } == 0 {
            return Ok(());
        }
        // SAFETY: as above.
        if unsafe { libc::kill(pid, signal) } == 0 {
            return Ok(());
        }
        Err(std::io::Error::last_os_error())
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            debug!(pid = self.pid, "dropping live PTY process, killing it");
            let _ = self.force_kill();
        }
    }
}

/// Read PTY output until EOF, publishing whole UTF-8 text chunks.
fn pump_output(
    mut reader: Box<dyn Read + Send>,
    output: OutputHub,
    drained_tx: std_mpsc::Sender<()>,
    session_id: &str,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut decoder = Utf8Carry::default();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Some(text) = decoder.push(&buf[..n]) {
                    output.publish(Arc::from(text));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the slave side is gone.
                debug!(session_id, error = %e, "PTY read ended");
                break;
            }
        }
    }
    if let Some(rest) = decoder.finish() {
        output.publish(Arc::from(rest));
    }
    let _ = drained_tx.send(());
}

/// Shared state the exit observer updates.
struct ExitSignals {
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    exited_at: Arc<OnceLock<Instant>>,
    reaped: Arc<AtomicBool>,
}

/// Wait for the child, then publish its exit code and end the output stream.
fn observe_exit(
    mut child: Box<dyn Child + Send + Sync>,
    exit: ExitSignals,
    drained_rx: std_mpsc::Receiver<()>,
    output: OutputHub,
    session_id: &str,
) {
    let code = match child.wait() {
        Ok(status) => status.exit_code() as i32,
        Err(e) => {
            warn!(session_id, error = %e, "wait on child failed");
            -1
        }
    };
    exit.reaped.store(true, Ordering::Release);

    // Background jobs may hold the PTY open; don't wait on them forever.
    if drained_rx.recv_timeout(EXIT_DRAIN_WINDOW).is_err() {
        debug!(session_id, "output not drained before exit notification");
    }

    let _ = exit.exited_at.set(Instant::now());
    exit.exit_tx.send_replace(Some(code));
    output.close();
    info!(session_id, code, "process exited");
}

/// Splits a byte stream into valid UTF-8 text without breaking multi-byte
/// sequences across chunks. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Append bytes, returning all text that is complete so far.
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let keep = incomplete_tail_len(&self.pending);
        let complete_len = self.pending.len() - keep;
        if complete_len == 0 {
            return None;
        }
        let tail = self.pending.split_off(complete_len);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        Some(text)
    }

    /// Flush whatever is left, lossily.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence (0..=3).
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue; // continuation byte, keep looking for the lead byte
        }
        let needed = match b {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

fn short(id: &str) -> &str {
    &id[..8.min(id.len())]
}
