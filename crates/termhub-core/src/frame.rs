//! JSON wire frames for the terminal stream.
//!
//! Every WebSocket text message is one JSON object with a `type`
//! discriminator. Frames carry no session id; the connection path decides
//! which session a frame belongs to.

use crate::error::{TermError, TermResult};
use crate::TERMINAL_PATH_PREFIX;
use serde::{Deserialize, Serialize};

/// One wire message. `Input` and `Resize` flow client to server, the
/// remaining variants flow server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Output { data: String },
    Exit { code: i32 },
    Error { message: String },
}

/// Result of decoding a client-sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed client frame (`input` or `resize`).
    Frame(Frame),
    /// Valid JSON with a `type` this side does not accept.
    Unrecognized(String),
}

impl Frame {
    /// Serialize to the JSON text sent on the wire.
    pub fn encode(&self) -> TermResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a frame sent by a client.
    ///
    /// Server-to-client types arriving from a client count as unrecognized.
    /// Malformed JSON, a missing `type`, or bad fields on a known type are
    /// protocol errors.
    pub fn decode_inbound(text: &str) -> TermResult<Inbound> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| TermError::Protocol("frame has no string `type` field".into()))?
            .to_string();

        match kind.as_str() {
            "input" | "resize" => Ok(Inbound::Frame(serde_json::from_value(value)?)),
            _ => Ok(Inbound::Unrecognized(kind)),
        }
    }

    /// Decode a frame sent by a server. Unknown types are protocol errors.
    pub fn decode_outbound(text: &str) -> TermResult<Frame> {
        let frame: Frame = serde_json::from_str(text)?;
        match frame {
            Frame::Output { .. } | Frame::Exit { .. } | Frame::Error { .. } => Ok(frame),
            other => Err(TermError::Protocol(format!(
                "unexpected client frame from server: {other:?}"
            ))),
        }
    }
}

/// WebSocket close codes used by the terminal stream.
pub mod close_code {
    /// Session ended; sent after the `exit` frame.
    pub const NORMAL: u16 = 1000;
    /// Server is shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Request path is not `/terminal/{id}`.
    pub const INVALID_PATH: u16 = 4400;
    /// No session with the requested id.
    pub const SESSION_NOT_FOUND: u16 = 4404;
    /// Subscriber fell behind the output stream and was evicted.
    pub const SUBSCRIBER_LAGGED: u16 = 4408;
}

/// Build the streaming endpoint path for a session id.
pub fn terminal_path(session_id: &str) -> String {
    format!("{TERMINAL_PATH_PREFIX}{session_id}")
}

/// Extract the session id from a `/terminal/{id}` request path.
///
/// Returns `None` for any other shape, including an empty id or extra
/// path segments.
pub fn parse_terminal_path(path: &str) -> Option<&str> {
    let id = path.strip_prefix(TERMINAL_PATH_PREFIX)?;
    let id = id.strip_suffix('/').unwrap_or(id);
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_type_discriminator() {
        let json = Frame::Output { data: "hi".into() }.encode().unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hi"}"#);

        let json = Frame::Exit { code: 0 }.encode().unwrap();
        assert_eq!(json, r#"{"type":"exit","code":0}"#);
    }

    #[test]
    fn decodes_client_frames() {
        assert_eq!(
            Frame::decode_inbound(r#"{"type":"input","data":"ls\n"}"#).unwrap(),
            Inbound::Frame(Frame::Input { data: "ls\n".into() })
        );
        assert_eq!(
            Frame::decode_inbound(r#"{"type":"resize","cols":80,"rows":24}"#).unwrap(),
            Inbound::Frame(Frame::Resize { cols: 80, rows: 24 })
        );
    }

    #[test]
    fn unknown_type_is_unrecognized_not_error() {
        assert_eq!(
            Frame::decode_inbound(r#"{"type":"ping"}"#).unwrap(),
            Inbound::Unrecognized("ping".into())
        );
        // Server-only frames are not accepted from a client.
        assert_eq!(
            Frame::decode_inbound(r#"{"type":"output","data":"x"}"#).unwrap(),
            Inbound::Unrecognized("output".into())
        );
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert!(matches!(
            Frame::decode_inbound("not json"),
            Err(TermError::Protocol(_))
        ));
        assert!(matches!(
            Frame::decode_inbound(r#"{"data":"x"}"#),
            Err(TermError::Protocol(_))
        ));
        assert!(matches!(
            Frame::decode_inbound(r#"{"type":"resize","cols":"wide"}"#),
            Err(TermError::Protocol(_))
        ));
    }

    #[test]
    fn outbound_rejects_client_types() {
        assert!(Frame::decode_outbound(r#"{"type":"error","message":"bad"}"#).is_ok());
        assert!(Frame::decode_outbound(r#"{"type":"input","data":"x"}"#).is_err());
    }

    #[test]
    fn terminal_paths() {
        assert_eq!(terminal_path("abc123"), "/terminal/abc123");
        assert_eq!(parse_terminal_path("/terminal/abc123"), Some("abc123"));
        assert_eq!(parse_terminal_path("/terminal/abc123/"), Some("abc123"));
        assert_eq!(parse_terminal_path("/terminal/"), None);
        assert_eq!(parse_terminal_path("/terminal/a/b"), None);
        assert_eq!(parse_terminal_path("/other/abc"), None);
        assert_eq!(parse_terminal_path("/"), None);
    }
}
