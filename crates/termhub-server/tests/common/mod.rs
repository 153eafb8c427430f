#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use termhub_client::{ConnectionEvent, TerminalConnection};
use termhub_core::Frame;
use termhub_server::{RegistryConfig, SessionRegistry, SpawnConfig, TerminalServer};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Sessions run `/bin/sh -c <script>`.
pub fn sh_config(script: &str) -> RegistryConfig {
    RegistryConfig {
        graceful_timeout: Duration::from_secs(2),
        spawn: SpawnConfig {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            ..SpawnConfig::default()
        },
        ..RegistryConfig::default()
    }
}

pub async fn start_server(config: RegistryConfig) -> (Arc<TerminalServer>, SocketAddr) {
    let registry = Arc::new(SessionRegistry::new(config));
    let server = Arc::new(TerminalServer::new(registry, Duration::from_secs(60)));
    let (addr, _handle) = server
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    (server, addr)
}

pub fn stream_url(addr: SocketAddr, id: &str) -> String {
    format!("ws://{addr}{}", termhub_core::terminal_path(id))
}

/// Poll `check` until it holds or the step timeout passes.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn next_event(conn: &mut TerminalConnection) -> ConnectionEvent {
    tokio::time::timeout(STEP_TIMEOUT, conn.next_event())
        .await
        .expect("timed out waiting for stream event")
        .expect("stream failed")
}

/// Collect output text until the exit frame. Returns (output, code).
pub async fn read_until_exit(conn: &mut TerminalConnection) -> (String, i32) {
    let mut output = String::new();
    loop {
        match next_event(conn).await {
            ConnectionEvent::Frame(Frame::Output { data }) => output.push_str(&data),
            ConnectionEvent::Frame(Frame::Exit { code }) => return (output, code),
            other => panic!("unexpected event before exit: {other:?}"),
        }
    }
}

/// Read output until it contains `needle`. Returns everything read.
pub async fn read_until_contains(conn: &mut TerminalConnection, needle: &str) -> String {
    let mut output = String::new();
    while !output.contains(needle) {
        match next_event(conn).await {
            ConnectionEvent::Frame(Frame::Output { data }) => output.push_str(&data),
            other => panic!("unexpected event while waiting for {needle:?}: {other:?}"),
        }
    }
    output
}
