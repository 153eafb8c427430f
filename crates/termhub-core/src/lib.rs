//! termhub-core: Shared protocol library for termhub.
//!
//! Provides the JSON wire frames exchanged over a terminal stream, the
//! close codes a server uses to end one, and the error taxonomy shared by
//! the server engine and the client.

pub mod error;
pub mod frame;

// Re-export commonly used items at crate root.
pub use error::{TermError, TermResult};
pub use frame::{close_code, parse_terminal_path, terminal_path, Frame, Inbound};

/// Default terminal width for newly spawned sessions.
pub const DEFAULT_COLS: u16 = 120;

/// Default terminal height for newly spawned sessions.
pub const DEFAULT_ROWS: u16 = 30;

/// Path prefix of the streaming endpoint (`/terminal/{id}`).
pub const TERMINAL_PATH_PREFIX: &str = "/terminal/";
