use crate::error::GatewayError;
use serde_json::Value;
use sharp_core::gateway_ipc::ResponseFrame;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type Reply = Result<Value, GatewayError>;

/// Requests the client issues on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalCall {
    Keepalive,
    ActiveRunsResync,
}

#[derive(Debug)]
pub enum Responder {
    Caller(oneshot::Sender<Reply>),
    Internal(InternalCall),
}

#[derive(Debug)]
struct PendingRequest {
    method: String,
    responder: Responder,
    deadline: Instant,
    timeout: Duration,
}

/// A request that reached its single outcome.
#[derive(Debug)]
pub struct Settled {
    pub id: String,
    pub method: String,
    pub responder: Responder,
    pub result: Reply,
}

impl Settled {
    /// Hands the result to an awaiting caller, or returns it when the client itself asked.
    pub fn deliver(self) -> Option<(InternalCall, Reply)> {
        match self.responder {
            Responder::Caller(tx) => {
                let _ = tx.send(self.result);
                None
            }
            Responder::Internal(call) => Some((call, self.result)),
        }
    }
}

#[derive(Debug, Default)]
pub struct Correlator {
    last_id: u64,
    pending: HashMap<String, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids increase for the life of the client and are never reused across reconnects.
    pub fn next_id(&mut self) -> String {
        self.last_id += 1;
        self.last_id.to_string()
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        method: impl Into<String>,
        responder: Responder,
        now: Instant,
        timeout: Duration,
    ) {
        self.pending.insert(
            id.into(),
            PendingRequest {
                method: method.into(),
                responder,
                deadline: now + timeout,
                timeout,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Matches a response to its pending request. Unknown or late ids yield `None`.
    pub fn resolve(&mut self, response: &ResponseFrame) -> Option<Settled> {
        let pending = self.pending.remove(&response.id)?;
        let result = if response.ok {
            Ok(response.payload.clone().unwrap_or(Value::Null))
        } else {
            Err(GatewayError::Rpc {
                method: pending.method.clone(),
                code: response.error.as_ref().and_then(|err| err.code.clone()),
                message: response.error_message(),
            })
        };
        Some(Settled {
            id: response.id.clone(),
            method: pending.method,
            responder: pending.responder,
            result,
        })
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    pub fn expire_due(&mut self, now: Instant) -> Vec<Settled> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due.into_iter()
            .filter_map(|id| {
                let pending = self.pending.remove(&id)?;
                let error = GatewayError::Timeout {
                    method: pending.method.clone(),
                    timeout_ms: pending.timeout.as_millis() as u64,
                };
                Some(Settled {
                    id,
                    method: pending.method,
                    responder: pending.responder,
                    result: Err(error),
                })
            })
            .collect()
    }

    pub fn fail_all(&mut self, error: GatewayError) -> Vec<Settled> {
        self.pending
            .drain()
            .map(|(id, pending)| Settled {
                id,
                method: pending.method,
                responder: pending.responder,
                result: Err(error.clone()),
            })
            .collect()
    }
}
