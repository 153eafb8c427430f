//! Waiting-for-input detection from raw process output.
//!
//! Output is appended to a rolling text buffer. The last few non-blank lines
//! (ANSI sequences stripped) are matched against a "working" pattern set and
//! a "waiting" pattern set; working wins. A change of the computed value is
//! published only after it survives a debounce window. User input clears the
//! flag at once.

use super::fanout::Subscription;
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Tuning for the classifier.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// How long a changed verdict must hold before it is published.
    pub debounce: Duration,
    /// Size of the rolling buffer, in characters.
    pub buffer_chars: usize,
    /// Number of trailing non-blank lines analysed.
    pub window_lines: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(150),
            buffer_chars: 2000,
            window_lines: 5,
        }
    }
}

/// CSI, OSC, DCS/PM/APC strings and two-byte escapes.
static ANSI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b[PX^_][^\x1b]*(?:\x1b\\)?|\x1b[@-Z\\-_]",
    )
    .unwrap()
});

/// Spinners, trailing ellipses, gerund status lines.
static WORKING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
        r"(?m)^\s*[·✻✽✶✳✢]\s+\S",
        r"(?m)\w(?:\.\.\.|…)\s*$",
        r"(?m)^\s*(?:\S\s+)?[A-Z][a-z]+ing\b[^?\n]*(?:\.\.\.|…)",
        r"(?i)\b(?:esc|ctrl\+c) to interrupt\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Questions, yes/no prompts, selection markers, instruction phrasing.
static WAITING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?m)\?\s*$",
        r"(?i)[(\[]\s*y(?:es)?\s*/\s*n(?:o)?\s*[)\]]",
        r"(?m)^\s*[>❯›]",
        r"(?im)^\s*(?:enter|select|choose|type|press)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Remove terminal escape sequences and carriage-return overwrites.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    let stripped = ANSI_PATTERN.replace_all(text, "");
    if stripped.contains('\r') {
        Cow::Owned(stripped.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        stripped
    }
}

/// Last `lines` non-blank lines of `text`, joined with newlines.
fn analysis_window(text: &str, lines: usize) -> String {
    let mut window: Vec<&str> = text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(lines)
        .collect();
    window.reverse();
    window.join("\n")
}

/// Whether buffered output looks like a prompt waiting for the user.
pub fn classify(text: &str, window_lines: usize) -> bool {
    let clean = strip_ansi(text);
    let window = analysis_window(&clean, window_lines);
    if window.is_empty() {
        return false;
    }
    let working = WORKING_PATTERNS.iter().any(|p| p.is_match(&window));
    let waiting = WAITING_PATTERNS.iter().any(|p| p.is_match(&window));
    waiting && !working
}

fn truncate_front(buf: &mut String, max_chars: usize) {
    let count = buf.chars().count();
    if count <= max_chars {
        return;
    }
    let cut = buf
        .char_indices()
        .nth(count - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(buf.len());
    buf.drain(..cut);
}

struct ClassifierState {
    buffer: String,
    pending: Option<Instant>,
}

/// Per-session waiting-for-input signal.
pub struct ActivityClassifier {
    config: ActivityConfig,
    state: Mutex<ClassifierState>,
    waiting_tx: watch::Sender<bool>,
}

impl ActivityClassifier {
    pub fn new(config: ActivityConfig) -> Self {
        let (waiting_tx, _) = watch::channel(false);
        Self {
            config,
            state: Mutex::new(ClassifierState {
                buffer: String::new(),
                pending: None,
            }),
            waiting_tx,
        }
    }

    /// Currently published flag.
    pub fn is_waiting(&self) -> bool {
        *self.waiting_tx.borrow()
    }

    /// Receiver that observes every published flip.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.waiting_tx.subscribe()
    }

    /// Pending debounce deadline, if a flip is being considered.
    pub fn deadline(&self) -> Option<Instant> {
        self.lock().pending
    }

    /// Feed one output chunk. Arms (or re-arms) the debounce timer when the
    /// verdict differs from the published flag; returns the pending deadline.
    pub fn observe(&self, chunk: &str, now: Instant) -> Option<Instant> {
        let mut state = self.lock();
        state.buffer.push_str(chunk);
        truncate_front(&mut state.buffer, self.config.buffer_chars);

        let computed = classify(&state.buffer, self.config.window_lines);
        if computed != self.is_waiting() {
            state.pending = Some(now + self.config.debounce);
        }
        state.pending
    }

    /// Debounce timer fired. Publishes the verdict if it still differs.
    ///
    /// Returns the new flag when a flip was published.
    pub fn settle(&self, now: Instant) -> Option<bool> {
        let mut state = self.lock();
        match state.pending {
            Some(deadline) if deadline <= now => state.pending = None,
            _ => return None,
        }

        let computed = classify(&state.buffer, self.config.window_lines);
        if computed == self.is_waiting() {
            return None;
        }
        self.waiting_tx.send_replace(computed);
        debug!(waiting = computed, "activity flag changed");
        Some(computed)
    }

    /// User typed something: clear the flag and buffer, cancel any pending flip.
    pub fn note_input(&self) {
        let mut state = self.lock();
        state.buffer.clear();
        state.pending = None;
        if self.is_waiting() {
            self.waiting_tx.send_replace(false);
            debug!("activity flag cleared by input");
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClassifierState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Most queued chunks folded into one classification pass.
const MAX_BATCH: usize = 64;

/// Drive a classifier from a session's output until the stream ends.
///
/// `output` should come from [`OutputHub::subscribe_unbounded`] so a burst
/// cannot evict the classifier.
///
/// [`OutputHub::subscribe_unbounded`]: super::fanout::OutputHub::subscribe_unbounded
pub async fn run(classifier: Arc<ActivityClassifier>, mut output: Subscription, session_id: String) {
    loop {
        let deadline = classifier.deadline();
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    let mut text = chunk.to_string();
                    for _ in 1..MAX_BATCH {
                        match output.try_recv() {
                            Some(more) => text.push_str(&more),
                            None => break,
                        }
                    }
                    classifier.observe(&text, Instant::now());
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                classifier.settle(Instant::now());
            }
        }
    }
    debug!(session_id = %session_id, "activity classifier stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OutputHub;

    fn classifier() -> ActivityClassifier {
        ActivityClassifier::new(ActivityConfig::default())
    }

    #[test]
    fn strips_escape_sequences() {
        assert_eq!(strip_ansi("\x1b[1;32mready\x1b[0m"), "ready");
        assert_eq!(strip_ansi("\x1b]0;title\x07prompt"), "prompt");
        assert_eq!(strip_ansi("50%\r100%\r\n"), "50%\n100%\n");
    }

    #[test]
    fn recognises_waiting_prompts() {
        assert!(classify("Do you want to continue?", 5));
        assert!(classify("Overwrite file? [y/N] ", 5));
        assert!(classify("Proceed (yes/no)", 5));
        assert!(classify("Pick one:\n❯ 1. Yes\n  2. No", 5));
        assert!(classify("Select a project", 5));
        assert!(classify("\x1b[1m> \x1b[0m", 5));
    }

    #[test]
    fn working_output_is_not_waiting() {
        assert!(!classify("Compiling termhub v0.1.0", 5));
        assert!(!classify("⠙ building", 5));
        assert!(!classify("✻ Pondering… (esc to interrupt)", 5));
    }

    #[test]
    fn working_pattern_takes_precedence() {
        assert!(classify("> ", 5));
        assert!(!classify("Thinking...\n> ", 5));
    }

    #[test]
    fn only_recent_lines_matter() {
        let text = "Thinking...\nline a\nline b\nline c\nline d\nline e\n> ";
        assert!(classify(text, 5));
        assert!(!classify(text, 7));
    }

    #[test]
    fn empty_or_garbage_input_is_not_waiting() {
        assert!(!classify("", 5));
        assert!(!classify("\n\n   \n", 5));
        assert!(!classify("\x1b[", 5));
        assert!(!classify("\u{fffd}\u{0}\u{7}", 5));
    }

    #[test]
    fn buffer_keeps_most_recent_characters() {
        let mut buf = "é".repeat(10);
        buf.push_str("tail");
        truncate_front(&mut buf, 6);
        assert_eq!(buf, "éétail");
    }

    #[test]
    fn flip_publishes_only_after_debounce() {
        let c = classifier();
        let t0 = Instant::now();

        let deadline = c.observe("Continue? ", t0).unwrap();
        assert_eq!(deadline, t0 + Duration::from_millis(150));
        assert!(!c.is_waiting());

        assert_eq!(c.settle(t0 + Duration::from_millis(100)), None);
        assert!(!c.is_waiting());

        assert_eq!(c.settle(deadline), Some(true));
        assert!(c.is_waiting());
        assert_eq!(c.deadline(), None);
    }

    #[test]
    fn reverting_within_window_publishes_nothing() {
        let c = classifier();
        let t0 = Instant::now();
        c.observe("Continue? ", t0);
        c.observe("\nWorking...\n", t0 + Duration::from_millis(50));
        assert_eq!(c.settle(t0 + Duration::from_millis(200)), None);
        assert!(!c.is_waiting());
    }

    #[test]
    fn flips_within_window_collapse_into_one_transition() {
        let c = classifier();
        let mut rx = c.watch();
        let t0 = Instant::now();

        c.observe("Continue? ", t0 + Duration::from_millis(10));
        let deadline = c
            .observe("\nSelect an option:\n> ", t0 + Duration::from_millis(60))
            .unwrap();
        // The timer restarted at +60ms.
        assert_eq!(deadline, t0 + Duration::from_millis(210));
        assert_eq!(c.settle(t0 + Duration::from_millis(160)), None);
        assert!(!rx.has_changed().unwrap());

        assert_eq!(c.settle(deadline), Some(true));
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn input_clears_immediately_and_cancels_pending() {
        let c = classifier();
        let t0 = Instant::now();
        let deadline = c.observe("Continue? ", t0).unwrap();
        c.settle(deadline);
        assert!(c.is_waiting());

        // A new pending flip is discarded by input.
        c.observe("\n⠋ working", deadline);
        assert!(c.deadline().is_some());
        c.note_input();
        assert!(!c.is_waiting());
        assert_eq!(c.deadline(), None);

        // The buffer was reset: stale prompt text no longer counts.
        c.observe("plain output\n", deadline + Duration::from_millis(1));
        assert_eq!(c.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_debounces_live_output() {
        let hub = OutputHub::new(16);
        let c = Arc::new(ActivityClassifier::new(ActivityConfig::default()));
        let task = tokio::spawn(run(c.clone(), hub.subscribe_unbounded(), "test".into()));

        hub.publish(Arc::from("Really quit? "));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!c.is_waiting());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(c.is_waiting());

        hub.close();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn burst_larger_than_viewer_queue_keeps_classifier_alive() {
        let hub = OutputHub::new(2);
        let c = Arc::new(ActivityClassifier::new(ActivityConfig::default()));
        let task = tokio::spawn(run(c.clone(), hub.subscribe_unbounded(), "test".into()));

        for i in 0..500 {
            hub.publish(Arc::from(format!("log line {i}\n")));
        }
        hub.publish(Arc::from("Continue? [y/N] "));
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!task.is_finished());
        assert!(c.is_waiting());

        hub.close();
        task.await.unwrap();
    }
}
