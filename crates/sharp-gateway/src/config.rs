use crate::supervisor::ReconnectPolicy;
use sharp_core::gateway_ipc::{
    ClientInfo, ConnectAuth, ConnectParams, DEFAULT_MAX_FRAME_BYTES, PROTOCOL_VERSION,
};
use std::time::Duration;

pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(65);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: String,
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub instance_id: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            id: "sharp-dashboard".to_string(),
            display_name: Some("Sharp".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "ui".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    /// Upgrade plain `ws://` to `wss://`, as a page served over https must.
    pub secure_context: bool,
    pub token: Option<String>,
    pub password: Option<String>,
    pub client: ClientIdentity,
    pub role: String,
    pub scopes: Vec<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub stale_after: Duration,
    pub reconnect: ReconnectPolicy,
    pub max_frame_bytes: usize,
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            secure_context: false,
            token: None,
            password: None,
            client: ClientIdentity::default(),
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            reconnect: ReconnectPolicy::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl GatewayConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn connect_params(&self) -> ConnectParams {
        let auth = if self.token.is_some() || self.password.is_some() {
            Some(ConnectAuth {
                token: self.token.clone(),
                password: self.password.clone(),
            })
        } else {
            None
        };
        ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: self.client.id.clone(),
                display_name: self.client.display_name.clone(),
                version: self.client.version.clone(),
                platform: self.client.platform.clone(),
                mode: self.client.mode.clone(),
                instance_id: Some(self.client.instance_id.clone()),
            },
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            auth,
        }
    }
}
