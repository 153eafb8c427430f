//! Stream bridge: one WebSocket connection attached to one session.
//!
//! Relays live output as `output` frames, forwards `input`/`resize` frames to
//! the session, and ends with `exit` plus a normal close when the process
//! exits. The output subscription and exit listener live exactly as long as
//! the connection.

use crate::session::{Session, SessionRegistry, Subscription};
use crate::transport::websocket::{ws_close, ws_recv_text, ws_send_frame, WebSocketConnection};
use std::sync::Arc;
use termhub_core::{close_code, parse_terminal_path, Frame, Inbound, TermError};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Why a bridged connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// Process exited with this code.
    Exited(i32),
    /// Session was closed without an observable exit code.
    SessionClosed,
    /// This subscriber fell behind and was evicted from the fan-out.
    Lagged,
    /// Server is shutting down.
    Shutdown,
    /// Client went away, or a send to it failed.
    ClientGone,
}

/// Registrations held on a session for the lifetime of one connection.
struct Attachment {
    output: Subscription,
    exit: watch::Receiver<Option<i32>>,
}

impl Attachment {
    fn new(session: &Session) -> Self {
        Self {
            output: session.subscribe(),
            exit: session.exit_watch(),
        }
    }
}

/// Serve one accepted connection until it closes.
pub async fn serve_connection(
    registry: Arc<SessionRegistry>,
    mut conn: WebSocketConnection,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let remote = conn.remote_addr;
    let Some(session_id) = parse_terminal_path(&conn.path).map(str::to_string) else {
        warn!(remote = %remote, path = %conn.path, "rejecting stream: invalid path");
        ws_close(&mut conn.ws_stream, close_code::INVALID_PATH, "invalid path").await;
        return;
    };

    let session = match registry.get(&session_id).await {
        Ok(session) => session,
        Err(_) => {
            info!(remote = %remote, session_id = %session_id, "rejecting stream: session not found");
            ws_close(&mut conn.ws_stream, close_code::SESSION_NOT_FOUND, "session not found").await;
            return;
        }
    };

    let attachment = Attachment::new(&session);
    info!(session_id = %session_id, remote = %remote, "stream connected");

    let end = relay(&session, &mut conn.ws_stream, attachment, &mut shutdown_rx).await;

    match end {
        StreamEnd::Exited(code) => {
            let _ = ws_send_frame(&mut conn.ws_stream, &Frame::Exit { code }).await;
            ws_close(&mut conn.ws_stream, close_code::NORMAL, "session exited").await;
        }
        StreamEnd::SessionClosed => {
            ws_close(&mut conn.ws_stream, close_code::NORMAL, "session closed").await;
        }
        StreamEnd::Lagged => {
            ws_close(&mut conn.ws_stream, close_code::SUBSCRIBER_LAGGED, "subscriber lagged").await;
        }
        StreamEnd::Shutdown => {
            ws_close(&mut conn.ws_stream, close_code::GOING_AWAY, "server shutdown").await;
        }
        StreamEnd::ClientGone => {}
    }
    info!(session_id = %session_id, remote = %remote, end = ?end, "stream disconnected");
}

/// Pump frames in both directions. Consumes the attachment, so both
/// registrations are released when this returns.
async fn relay(
    session: &Session,
    ws: &mut WebSocketStream<TcpStream>,
    attachment: Attachment,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> StreamEnd {
    let Attachment {
        mut output,
        mut exit,
    } = attachment;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => return StreamEnd::Shutdown,

            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    let frame = Frame::Output { data: chunk.to_string() };
                    if ws_send_frame(ws, &frame).await.is_err() {
                        return StreamEnd::ClientGone;
                    }
                }
                None => return stream_ended(session),
            },

            code = exited(&mut exit) => {
                // The reader has drained by now; flush what is queued.
                while let Some(chunk) = output.try_recv() {
                    let frame = Frame::Output { data: chunk.to_string() };
                    if ws_send_frame(ws, &frame).await.is_err() {
                        return StreamEnd::ClientGone;
                    }
                }
                return match code {
                    Some(code) => StreamEnd::Exited(code),
                    None => StreamEnd::SessionClosed,
                };
            }

            msg = ws_recv_text(ws) => match msg {
                Ok(Some(text)) => {
                    if let Some(reply) = handle_client_text(session, &text) {
                        if ws_send_frame(ws, &reply).await.is_err() {
                            return StreamEnd::ClientGone;
                        }
                    }
                }
                Ok(None) => return StreamEnd::ClientGone,
                Err(TermError::Protocol(message)) => {
                    warn!(session_id = %session.id(), error = %message, "rejected client message");
                    if ws_send_frame(ws, &Frame::Error { message }).await.is_err() {
                        return StreamEnd::ClientGone;
                    }
                }
                Err(e) => {
                    debug!(session_id = %session.id(), error = %e, "client transport failed");
                    return StreamEnd::ClientGone;
                }
            },
        }
    }
}

/// Resolve once the process has exited. `None` if the session is gone
/// without ever reporting a code.
async fn exited(exit: &mut watch::Receiver<Option<i32>>) -> Option<i32> {
    exit.wait_for(Option::is_some).await.ok().and_then(|code| *code)
}

/// The output subscription ended; work out why.
fn stream_ended(session: &Session) -> StreamEnd {
    if let Some(code) = session.exit_code() {
        StreamEnd::Exited(code)
    } else if session.output_closed() {
        StreamEnd::SessionClosed
    } else {
        StreamEnd::Lagged
    }
}

/// Apply one client message. Returns an `error` frame to send back, if any.
fn handle_client_text(session: &Session, text: &str) -> Option<Frame> {
    let result = match Frame::decode_inbound(text) {
        Ok(Inbound::Frame(Frame::Input { data })) => session.write(data.as_bytes()),
        Ok(Inbound::Frame(Frame::Resize { cols, rows })) => session.resize(cols, rows),
        Ok(Inbound::Frame(other)) => {
            debug!(session_id = %session.id(), frame = ?other, "ignoring unexpected frame");
            Ok(())
        }
        Ok(Inbound::Unrecognized(kind)) => {
            debug!(session_id = %session.id(), kind = %kind, "ignoring unrecognized frame type");
            Ok(())
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => None,
        Err(e) => {
            warn!(session_id = %session.id(), error = %e, "client frame failed");
            Some(Frame::Error {
                message: e.to_string(),
            })
        }
    }
}
