//! Bounded reconnection policy.
//!
//! Backoff is linear (`base_delay * attempt`) and capped. The attempt counter
//! resets every time a connection opens, so only consecutive failures count.

use serde::Deserialize;
use std::time::Duration;
use termhub_core::close_code;

/// Reconnect tuning, as read from `[reconnect]` in the client config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive attempts before giving up.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given (1-based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(u64::from(attempt.max(1)))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Why a connection (or connection attempt) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server closed the stream with this code.
    Server { code: u16, reason: String },
    /// Connecting failed, or the transport broke.
    Network(String),
    /// The session's process exited.
    Exited(i32),
    /// The local user asked to close.
    UserRequested,
}

impl CloseReason {
    /// Whether reconnecting could help.
    pub fn is_retryable(&self) -> bool {
        match self {
            CloseReason::Server { code, .. } => !matches!(
                *code,
                close_code::NORMAL | close_code::INVALID_PATH | close_code::SESSION_NOT_FOUND
            ),
            CloseReason::Network(_) => true,
            CloseReason::Exited(_) | CloseReason::UserRequested => false,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Server { code, reason } if reason.is_empty() => {
                write!(f, "closed by server ({code})")
            }
            CloseReason::Server { code, reason } => write!(f, "closed by server ({code}: {reason})"),
            CloseReason::Network(e) => write!(f, "network error: {e}"),
            CloseReason::Exited(code) => write!(f, "process exited with code {code}"),
            CloseReason::UserRequested => write!(f, "closed by user"),
        }
    }
}

/// What to do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then make attempt number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// The close was final; do not reconnect.
    Finished,
    /// Retryable, but the attempt budget is spent.
    GaveUp { attempts: u32 },
}

/// Tracks consecutive reconnect attempts for one stream.
#[derive(Debug, Clone)]
pub struct ReconnectionManager {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Attempts made since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A connection opened: the budget starts over.
    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// A connection or attempt ended.
    pub fn on_close(&mut self, reason: &CloseReason) -> ReconnectDecision {
        if !reason.is_retryable() {
            return ReconnectDecision::Finished;
        }
        if self.attempts >= self.policy.max_attempts {
            return ReconnectDecision::GaveUp {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }
}
