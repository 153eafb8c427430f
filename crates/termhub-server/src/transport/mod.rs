//! Network transports for terminal streams.

pub mod websocket;
