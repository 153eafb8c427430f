//! One WebSocket connection to a session stream.

use futures_util::{SinkExt, StreamExt};
use termhub_core::{close_code, Frame, TermError, TermResult};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Close code reported when the server closed without a status.
const NO_STATUS: u16 = 1005;

/// Something read from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Frame(Frame),
    /// The connection ended. `code` is 1006 when it dropped without a close.
    Closed { code: u16, reason: String },
}

/// A live stream connection.
pub struct TerminalConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl TerminalConnection {
    /// Connect to a stream URL such as `ws://127.0.0.1:7681/terminal/<id>`.
    pub async fn connect(url: &str) -> TermResult<Self> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TermError::Transport(format!("WebSocket connect error: {e}")))?;
        info!(url, "stream connected");
        Ok(Self { ws, closed: false })
    }

    pub async fn send(&mut self, frame: &Frame) -> TermResult<()> {
        let text = frame.encode()?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TermError::Transport(format!("WS send failed: {e}")))
    }

    pub async fn send_input(&mut self, data: &str) -> TermResult<()> {
        self.send(&Frame::Input {
            data: data.to_string(),
        })
        .await
    }

    pub async fn send_resize(&mut self, cols: u16, rows: u16) -> TermResult<()> {
        self.send(&Frame::Resize { cols, rows }).await
    }

    /// Next frame or close.
    ///
    /// A malformed server message is a `Protocol` error and the connection
    /// stays usable; a broken transport is a `Transport` error.
    pub async fn next_event(&mut self) -> TermResult<ConnectionEvent> {
        if self.closed {
            return Ok(ConnectionEvent::Closed {
                code: close_code::ABNORMAL,
                reason: "already closed".into(),
            });
        }
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Frame::decode_outbound(&text).map(ConnectionEvent::Frame);
                }
                Some(Ok(Message::Close(frame))) => {
                    self.closed = true;
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.to_string()),
                        None => (NO_STATUS, String::new()),
                    };
                    debug!(code, reason = %reason, "server closed stream");
                    return Ok(ConnectionEvent::Closed { code, reason });
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(TermError::Transport(format!("WS recv failed: {e}")));
                }
                None => {
                    self.closed = true;
                    return Ok(ConnectionEvent::Closed {
                        code: close_code::ABNORMAL,
                        reason: "connection dropped".into(),
                    });
                }
            }
        }
    }

    /// Close from our side with a normal close code.
    pub async fn close(&mut self) -> TermResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client closed".into(),
        };
        self.ws
            .close(Some(frame))
            .await
            .map_err(|e| TermError::Transport(format!("WS close failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reads_frames_then_close_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let input = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text(r#"{"type":"output","data":"hi"}"#.to_string().into()))
                .await
                .unwrap();
            ws.send(Message::Text("garbage".to_string().into())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::from(4404),
                reason: "session not found".into(),
            }))
            .await
            .unwrap();
            input
        });

        let mut conn = TerminalConnection::connect(&format!("ws://{addr}/terminal/x"))
            .await
            .unwrap();
        conn.send_input("ls\n").await.unwrap();

        assert_eq!(
            conn.next_event().await.unwrap(),
            ConnectionEvent::Frame(Frame::Output { data: "hi".into() })
        );
        assert!(matches!(conn.next_event().await, Err(TermError::Protocol(_))));
        assert_eq!(
            conn.next_event().await.unwrap(),
            ConnectionEvent::Closed {
                code: 4404,
                reason: "session not found".into()
            }
        );

        let received = server.await.unwrap();
        let text = received.into_text().unwrap();
        assert_eq!(
            Frame::decode_inbound(&text).unwrap(),
            termhub_core::Inbound::Frame(Frame::Input { data: "ls\n".into() })
        );
    }

    #[tokio::test]
    async fn connect_failure_is_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TerminalConnection::connect(&format!("ws://{addr}/terminal/x"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "transport");
    }
}
