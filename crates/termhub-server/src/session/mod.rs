//! Session engine: PTY lifecycle, output fan-out, activity detection and
//! the session table.

pub mod activity;
pub mod fanout;
pub mod pty;
pub mod registry;

pub use activity::{ActivityClassifier, ActivityConfig};
pub use fanout::{Chunk, OutputHub, Subscription};
pub use pty::{PtyProcess, SpawnConfig, Termination};
pub use registry::{RegistryConfig, Session, SessionRegistry, SessionStatus, SessionSummary};
