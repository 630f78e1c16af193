use sharp_core::gateway_ipc::FrameError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("not connected")]
    NotConnected,
    #[error("socket is not open")]
    NotOpen,
    #[error("request {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("{method} failed: {message}")]
    Rpc {
        method: String,
        code: Option<String>,
        message: String,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("max reconnect attempts reached ({attempts})")]
    MaxAttemptsReached { attempts: u32 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
    #[error("unexpected {method} payload: {message}")]
    Payload { method: String, message: String },
    #[error("gateway client disposed")]
    Disposed,
}
