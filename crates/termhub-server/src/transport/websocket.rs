//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts connections, completes the upgrade handshake and records the
//! request path so the stream bridge can route the connection to a session.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use termhub_core::{Frame, TermError, TermResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Maximum accepted client message (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Request path from the upgrade request, e.g. `/terminal/ab12`.
    pub path: String,
}

/// Bind a TCP listener for the WebSocket endpoint.
pub async fn bind(addr: SocketAddr) -> TermResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| TermError::Transport(format!("WS bind failed on {addr}: {e}")))
}

/// Start accepting WebSocket connections on `listener`.
///
/// Returns a receiver that yields upgraded connections.
pub fn start_listener(listener: TcpListener) -> mpsc::Receiver<WebSocketConnection> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "WebSocket listener started");
    }

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    continue;
                }
            };
            if tx.is_closed() {
                debug!("connection receiver dropped, stopping listener");
                break;
            }
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut path = String::new();
                let handshake = tokio_tungstenite::accept_hdr_async(
                    stream,
                    |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        path = req.uri().path().to_string();
                        Ok(resp)
                    },
                )
                .await;
                match handshake {
                    Ok(ws_stream) => {
                        debug!(remote = %addr, path = %path, "WebSocket connection accepted");
                        let conn = WebSocketConnection {
                            ws_stream,
                            remote_addr: addr,
                            path,
                        };
                        if tx.send(conn).await.is_err() {
                            warn!("WebSocket connection channel closed");
                        }
                    }
                    Err(e) => {
                        warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                    }
                }
            });
        }
    });

    rx
}

/// Send one JSON frame as a text message.
pub async fn ws_send_frame(ws: &mut WebSocketStream<TcpStream>, frame: &Frame) -> TermResult<()> {
    let text = frame.encode()?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| TermError::Transport(format!("WS send failed: {e}")))
}

/// Close the connection with `code`. Best effort: the peer may already be gone.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(code, error = %e, "WS close failed");
    }
}

/// Receive the next text message.
///
/// Returns `None` once the connection is closed. Pings are answered by
/// tungstenite itself and skipped here. Binary messages are accepted
/// when they hold UTF-8. Oversized or non-UTF-8 messages are protocol errors;
/// the connection stays usable after one.
pub async fn ws_recv_text(ws: &mut WebSocketStream<TcpStream>) -> TermResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_FRAME_SIZE {
                    return Err(TermError::Protocol(format!(
                        "WS message too large: {} bytes (max {MAX_WS_FRAME_SIZE})",
                        text.len()
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_WS_FRAME_SIZE {
                    return Err(TermError::Protocol(format!(
                        "WS message too large: {} bytes (max {MAX_WS_FRAME_SIZE})",
                        data.len()
                    )));
                }
                return String::from_utf8(data.to_vec())
                    .map(Some)
                    .map_err(|_| TermError::Protocol("binary message is not UTF-8".into()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(TermError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
