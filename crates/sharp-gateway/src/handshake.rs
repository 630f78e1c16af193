//! Connect handshake: wait for `connect.challenge`, send `connect` exactly once, accept `hello-ok`.

use serde_json::Value;
use sharp_core::gateway_ipc::{ConnectParams, Frame, HelloOk, ResponseFrame, METHOD_CONNECT};
use std::time::Duration;
use tokio::time::Instant;

pub const HANDSHAKE_TIMEOUT_CLOSE_CODE: u16 = 4008;
pub const HANDSHAKE_TIMEOUT_REASON: &str = "connect timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingChallenge,
    ConnectSent,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    NotHandshake,
    Authenticated(HelloOk),
    Rejected(String),
}

#[derive(Debug)]
pub struct Handshake {
    params: ConnectParams,
    timeout: Duration,
    state: HandshakeState,
    connect_sent: bool,
    nonce: Option<String>,
    request_id: Option<String>,
    deadline: Option<Instant>,
}

impl Handshake {
    pub fn new(params: ConnectParams, timeout: Duration) -> Self {
        Self {
            params,
            timeout,
            state: HandshakeState::Idle,
            connect_sent: false,
            nonce: None,
            request_id: None,
            deadline: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == HandshakeState::Authenticated
    }

    /// Challenge nonce of the current socket.
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn reset(&mut self) {
        self.state = HandshakeState::Idle;
        self.connect_sent = false;
        self.nonce = None;
        self.request_id = None;
        self.deadline = None;
    }

    /// A fresh socket waits for the server's challenge; the deadline covers challenge and reply.
    pub fn on_open(&mut self, now: Instant) {
        self.reset();
        self.state = HandshakeState::AwaitingChallenge;
        self.deadline = Some(now + self.timeout);
    }

    /// Builds the `connect` request for the first challenge on this socket. Later challenges are ignored.
    pub fn on_challenge(
        &mut self,
        nonce: String,
        next_id: impl FnOnce() -> String,
        now: Instant,
    ) -> Option<Frame> {
        if self.connect_sent || self.state != HandshakeState::AwaitingChallenge {
            return None;
        }
        let params = serde_json::to_value(&self.params).unwrap_or(Value::Null);
        let id = next_id();
        self.nonce = Some(nonce);
        self.connect_sent = true;
        self.state = HandshakeState::ConnectSent;
        self.deadline = Some(now + self.timeout);
        self.request_id = Some(id.clone());
        Some(Frame::request(id, METHOD_CONNECT, params))
    }

    pub fn is_connect_response(&self, response: &ResponseFrame) -> bool {
        self.request_id.as_deref() == Some(response.id.as_str())
    }

    pub fn on_response(&mut self, response: &ResponseFrame) -> HandshakeOutcome {
        if !self.is_connect_response(response) {
            return HandshakeOutcome::NotHandshake;
        }
        self.request_id = None;
        self.deadline = None;
        if !response.ok {
            self.state = HandshakeState::Failed;
            return HandshakeOutcome::Rejected(response.error_message());
        }
        match response.payload.as_ref().and_then(HelloOk::from_payload) {
            Some(hello) => {
                self.state = HandshakeState::Authenticated;
                HandshakeOutcome::Authenticated(hello)
            }
            None => {
                self.state = HandshakeState::Failed;
                HandshakeOutcome::Rejected("unexpected connect response".to_string())
            }
        }
    }

    /// Returns `true` exactly once when the challenge or the connect reply is overdue.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let pending = matches!(
            self.state,
            HandshakeState::AwaitingChallenge | HandshakeState::ConnectSent
        );
        match self.deadline {
            Some(deadline) if pending && deadline <= now => {
                self.state = HandshakeState::Failed;
                self.deadline = None;
                self.request_id = None;
                true
            }
            _ => false,
        }
    }
}
