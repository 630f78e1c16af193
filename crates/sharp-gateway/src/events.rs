use serde_json::Value;
use sharp_core::gateway_ipc::{AgentEvent, ChatEvent, HelloOk};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error {
        message: String,
    },
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error { .. } => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ConnectionStatus::Error { message } => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Error { message } => write!(f, "error: {message}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Connected(HelloOk),
    Disconnected { code: Option<u16>, reason: String },
    AuthFailed(String),
    HandshakeTimeout,
    MaxAttemptsReached { attempts: u32 },
    ParseError(String),
    Chat(ChatEvent),
    Agent(AgentEvent),
    Other { event: String, payload: Option<Value> },
}
