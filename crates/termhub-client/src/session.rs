//! Reconnecting stream driver.
//!
//! A background task owns the live [`TerminalConnection`] and a
//! [`ReconnectionManager`]. Callers send [`SessionCommand`]s and read
//! [`SessionEvent`]s; reconnects happen behind that interface.

use crate::connection::{ConnectionEvent, TerminalConnection};
use crate::reconnect::{CloseReason, ReconnectDecision, ReconnectPolicy, ReconnectionManager};
use std::time::Duration;
use termhub_core::{Frame, TermError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests from the local side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Input(String),
    Resize { cols: u16, rows: u16 },
    Close,
}

/// What happened on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Output(String),
    Exit(i32),
    /// An `error` frame from the server, or an unreadable server message.
    Error(String),
    Reconnecting { attempt: u32, delay: Duration },
    /// Retryable drops exhausted the attempt budget.
    GaveUp { attempts: u32, last: CloseReason },
    /// The stream ended for good.
    Closed { reason: CloseReason },
}

/// Handle to a reconnecting stream.
pub struct ReconnectingSession {
    commands: mpsc::Sender<SessionCommand>,
    events: mpsc::Receiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl ReconnectingSession {
    /// Start connecting to `url` in the background.
    pub fn spawn(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let task = tokio::spawn(drive(url.into(), policy, cmd_rx, event_tx));
        Self {
            commands: cmd_tx,
            events: event_rx,
            task,
        }
    }

    /// Sender for commands, usable from other tasks.
    pub fn commands(&self) -> mpsc::Sender<SessionCommand> {
        self.commands.clone()
    }

    pub async fn send_input(&self, data: impl Into<String>) {
        let _ = self.commands.send(SessionCommand::Input(data.into())).await;
    }

    pub async fn resize(&self, cols: u16, rows: u16) {
        let _ = self.commands.send(SessionCommand::Resize { cols, rows }).await;
    }

    pub async fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close).await;
    }

    /// Next event. `None` after the terminal `Closed`/`GaveUp` event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }
}

impl Drop for ReconnectingSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn drive(
    url: String,
    policy: ReconnectPolicy,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let mut manager = ReconnectionManager::new(policy);
    let mut geometry: Option<(u16, u16)> = None;

    loop {
        let reason = match TerminalConnection::connect(&url).await {
            Ok(mut conn) => {
                manager.on_open();
                let _ = event_tx.send(SessionEvent::Connected).await;
                if let Some((cols, rows)) = geometry {
                    if let Err(e) = conn.send_resize(cols, rows).await {
                        warn!(error = %e, "failed to restore terminal size");
                    }
                }
                run_connection(&mut conn, &mut cmd_rx, &event_tx, &mut geometry).await
            }
            Err(e) => CloseReason::Network(e.to_string()),
        };

        match manager.on_close(&reason) {
            ReconnectDecision::Retry { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "reconnecting");
                let _ = event_tx
                    .send(SessionEvent::Reconnecting { attempt, delay })
                    .await;
                if !wait_before_retry(delay, &mut cmd_rx, &mut geometry).await {
                    let _ = event_tx
                        .send(SessionEvent::Closed {
                            reason: CloseReason::UserRequested,
                        })
                        .await;
                    return;
                }
            }
            ReconnectDecision::Finished => {
                info!(reason = %reason, "stream closed");
                let _ = event_tx.send(SessionEvent::Closed { reason }).await;
                return;
            }
            ReconnectDecision::GaveUp { attempts } => {
                warn!(attempts, reason = %reason, "giving up on reconnect");
                let _ = event_tx
                    .send(SessionEvent::GaveUp {
                        attempts,
                        last: reason,
                    })
                    .await;
                return;
            }
        }
    }
}

/// Sleep out the backoff. Returns `false` if the user closed meanwhile.
async fn wait_before_retry(
    delay: Duration,
    cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    geometry: &mut Option<(u16, u16)>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Resize { cols, rows }) => *geometry = Some((cols, rows)),
                Some(SessionCommand::Input(data)) => {
                    debug!(bytes = data.len(), "dropping input while disconnected");
                }
                Some(SessionCommand::Close) | None => return false,
            },
        }
    }
}

/// Pump one open connection until it ends.
async fn run_connection(
    conn: &mut TerminalConnection,
    cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    event_tx: &mpsc::Sender<SessionEvent>,
    geometry: &mut Option<(u16, u16)>,
) -> CloseReason {
    loop {
        tokio::select! {
            event = conn.next_event() => match event {
                Ok(ConnectionEvent::Frame(Frame::Output { data })) => {
                    let _ = event_tx.send(SessionEvent::Output(data)).await;
                }
                Ok(ConnectionEvent::Frame(Frame::Exit { code })) => {
                    let _ = event_tx.send(SessionEvent::Exit(code)).await;
                    let _ = conn.close().await;
                    return CloseReason::Exited(code);
                }
                Ok(ConnectionEvent::Frame(Frame::Error { message })) => {
                    let _ = event_tx.send(SessionEvent::Error(message)).await;
                }
                Ok(ConnectionEvent::Frame(other)) => {
                    debug!(frame = ?other, "ignoring frame");
                }
                Ok(ConnectionEvent::Closed { code, reason }) => {
                    return CloseReason::Server { code, reason };
                }
                Err(TermError::Protocol(message)) => {
                    warn!(error = %message, "unreadable server message");
                    let _ = event_tx.send(SessionEvent::Error(message)).await;
                }
                Err(e) => return CloseReason::Network(e.to_string()),
            },

            cmd = cmd_rx.recv() => {
                let sent = match cmd {
                    Some(SessionCommand::Input(data)) => conn.send_input(&data).await,
                    Some(SessionCommand::Resize { cols, rows }) => {
                        *geometry = Some((cols, rows));
                        conn.send_resize(cols, rows).await
                    }
                    Some(SessionCommand::Close) | None => {
                        let _ = conn.close().await;
                        return CloseReason::UserRequested;
                    }
                };
                if let Err(e) = sent {
                    return CloseReason::Network(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use termhub_core::{close_code, Inbound};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 50,
        }
    }

    fn text(frame: &Frame) -> Message {
        Message::Text(frame.encode().unwrap().into())
    }

    fn close(code: u16) -> Option<CloseFrame<'static>> {
        Some(CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        })
    }

    async fn next_non_output(session: &mut ReconnectingSession) -> SessionEvent {
        loop {
            match session.next_event().await.unwrap() {
                SessionEvent::Output(_) => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn reconnects_after_lag_and_restores_geometry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: read the resize, then evict.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(text(&Frame::Output { data: "one".into() })).await.unwrap();
            let first = ws.next().await.unwrap().unwrap().into_text().unwrap();
            ws.close(close(close_code::SUBSCRIBER_LAGGED)).await.unwrap();
            drop(ws);

            // Second connection: the client restores its size first.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let restored = ws.next().await.unwrap().unwrap().into_text().unwrap();
            ws.send(text(&Frame::Exit { code: 7 })).await.unwrap();
            ws.close(close(close_code::NORMAL)).await.unwrap();
            (first, restored)
        });

        let mut session = ReconnectingSession::spawn(format!("ws://{addr}/terminal/x"), fast_policy(3));
        assert_eq!(session.next_event().await, Some(SessionEvent::Connected));
        assert_eq!(session.next_event().await, Some(SessionEvent::Output("one".into())));
        session.resize(100, 40).await;

        assert!(matches!(
            next_non_output(&mut session).await,
            SessionEvent::Reconnecting { attempt: 1, .. }
        ));
        assert_eq!(session.next_event().await, Some(SessionEvent::Connected));
        assert_eq!(session.next_event().await, Some(SessionEvent::Exit(7)));
        assert_eq!(
            session.next_event().await,
            Some(SessionEvent::Closed {
                reason: CloseReason::Exited(7)
            })
        );
        assert_eq!(session.next_event().await, None);

        let (first, restored) = server.await.unwrap();
        let expected = Inbound::Frame(Frame::Resize { cols: 100, rows: 40 });
        assert_eq!(Frame::decode_inbound(&first).unwrap(), expected);
        assert_eq!(Frame::decode_inbound(&restored).unwrap(), expected);
    }

    #[tokio::test]
    async fn unknown_session_is_final() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.close(close(close_code::SESSION_NOT_FOUND)).await.unwrap();
            // Keep the socket until the client has read the close.
            let _ = ws.next().await;
        });

        let mut session = ReconnectingSession::spawn(format!("ws://{addr}/terminal/ghost"), fast_policy(3));
        assert_eq!(session.next_event().await, Some(SessionEvent::Connected));
        match session.next_event().await {
            Some(SessionEvent::Closed {
                reason: CloseReason::Server { code, .. },
            }) => assert_eq!(code, close_code::SESSION_NOT_FOUND),
            other => panic!("expected final close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gives_up_when_server_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut session = ReconnectingSession::spawn(format!("ws://{addr}/terminal/x"), fast_policy(2));
        for attempt in 1..=2 {
            assert!(matches!(
                session.next_event().await,
                Some(SessionEvent::Reconnecting { attempt: a, .. }) if a == attempt
            ));
        }
        assert!(matches!(
            session.next_event().await,
            Some(SessionEvent::GaveUp { attempts: 2, last: CloseReason::Network(_) })
        ));
    }

    #[tokio::test]
    async fn close_during_backoff_ends_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut session = ReconnectingSession::spawn(
            format!("ws://{addr}/terminal/x"),
            ReconnectPolicy {
                max_attempts: 5,
                base_delay_ms: 5_000,
                max_delay_ms: 5_000,
            },
        );
        assert!(matches!(
            session.next_event().await,
            Some(SessionEvent::Reconnecting { attempt: 1, .. })
        ));
        session.close().await;
        assert_eq!(
            session.next_event().await,
            Some(SessionEvent::Closed {
                reason: CloseReason::UserRequested
            })
        );
    }
}
