//! termhub-server: terminal session engine.
//!
//! Supervises a small number of PTY-backed sessions and exposes each one as
//! a live WebSocket stream at `/terminal/{id}`.

pub mod bridge;
pub mod config;
pub mod server;
pub mod session;
pub mod transport;

pub use config::ServerConfig;
pub use server::TerminalServer;
pub use session::{
    RegistryConfig, Session, SessionRegistry, SessionStatus, SessionSummary, SpawnConfig,
    Termination,
};
