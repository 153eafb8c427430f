//! termhub-client: connect to a termhub terminal stream.
//!
//! [`TerminalConnection`] is one WebSocket connection speaking JSON frames.
//! [`ReconnectingSession`] wraps it with a [`ReconnectionManager`] so a
//! dropped stream is re-established a bounded number of times.

pub mod connection;
pub mod reconnect;
pub mod session;

pub use connection::{ConnectionEvent, TerminalConnection};
pub use reconnect::{CloseReason, ReconnectDecision, ReconnectPolicy, ReconnectionManager};
pub use session::{ReconnectingSession, SessionCommand, SessionEvent};
