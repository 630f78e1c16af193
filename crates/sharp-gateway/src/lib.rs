//! WebSocket client for the agent gateway.
//!
//! One background task per [`GatewayClient`] owns the socket and runs the challenge/connect
//! handshake, request correlation, keepalive and reconnect backoff. The pure state machines live in
//! their own modules so they can be driven without a socket.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod rpc;
pub mod supervisor;
pub mod transport;

pub use client::GatewayClient;
pub use config::{ClientIdentity, GatewayConfig};
pub use error::GatewayError;
pub use events::{ConnectionStatus, GatewayEvent};
pub use handshake::{Handshake, HandshakeOutcome, HandshakeState};
pub use rpc::Correlator;
pub use supervisor::{Liveness, ReconnectDecision, ReconnectPolicy, Supervisor};
pub use transport::gateway_ws_url;
