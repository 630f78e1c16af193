use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::events::{ConnectionStatus, GatewayEvent};
use crate::handshake::{
    Handshake, HandshakeOutcome, HANDSHAKE_TIMEOUT_CLOSE_CODE, HANDSHAKE_TIMEOUT_REASON,
};
use crate::rpc::{Correlator, InternalCall, Reply, Responder};
use crate::supervisor::{KeepaliveTimer, Liveness, ReconnectDecision, Supervisor};
use crate::transport::{
    self, gateway_ws_url, SocketEvent, TransportEvent, TransportHandle, CONNECT_TIMEOUT_REASON,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sharp_core::gateway_ipc::{
    ActiveRunsResult, AgentEvent, ChatEvent, ChatHistoryResult, ConnectChallenge, EventFrame,
    Frame, HelloOk, LifecyclePhase, ResponseFrame, SessionsListResult, EVENT_AGENT, EVENT_CHAT,
    EVENT_CONNECT_CHALLENGE, METHOD_CHAT_ACTIVE_RUNS, METHOD_CHAT_ABORT, METHOD_CHAT_HISTORY,
    METHOD_CHAT_SEND, METHOD_SESSIONS_LIST, METHOD_STATUS,
};
use sharp_core::{ActiveRun, ActiveRunSet, ChatMessage, Session};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use url::Url;

const COMMAND_CAPACITY: usize = 64;
const SOCKET_EVENT_CAPACITY: usize = 256;
const NORMAL_CLOSE: u16 = 1000;
const STALE_CLOSE: u16 = 4000;
const IDLE_WAKE: Duration = Duration::from_secs(3600);

enum Command {
    Connect,
    Disconnect,
    Request {
        method: String,
        params: Value,
        timeout: Duration,
        reply: oneshot::Sender<Reply>,
    },
    Dispose {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a gateway connection.
///
/// A single background task owns the socket, the handshake, pending requests, reconnect timers and
/// the active-run set. Handles talk to it over a channel, so nothing here blocks on the network
/// except awaiting a reply.
#[derive(Clone)]
pub struct GatewayClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    active_runs: watch::Receiver<ActiveRunSet>,
    events: broadcast::Sender<GatewayEvent>,
    request_timeout: Duration,
}

impl GatewayClient {
    /// Spawns the connection task without dialing. Must be called inside a tokio runtime.
    pub fn create(config: GatewayConfig) -> Result<Self, GatewayError> {
        let url = gateway_ws_url(&config.url, config.secure_context)?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (socket_tx, socket_rx) = mpsc::channel(SOCKET_EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (runs_tx, runs_rx) = watch::channel(ActiveRunSet::default());
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let request_timeout = config.request_timeout;

        let driver = Driver {
            handshake: Handshake::new(config.connect_params(), config.connect_timeout),
            supervisor: Supervisor::new(config.reconnect.clone()),
            keepalive: KeepaliveTimer::new(config.keepalive_interval),
            correlator: Correlator::new(),
            liveness: None,
            socket: None,
            generation: 0,
            active_runs: ActiveRunSet::default(),
            url,
            config,
            socket_tx,
            status_tx,
            runs_tx,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(driver.run(command_rx, socket_rx));

        Ok(Self {
            commands: command_tx,
            status: status_rx,
            active_runs: runs_rx,
            events: events_tx,
            request_timeout,
        })
    }

    /// Opens a fresh socket, discarding any current one and clearing a prior disconnect.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.send_command(Command::Connect).await
    }

    /// Closes the socket and suppresses automatic reconnects until the next `connect`.
    pub async fn disconnect(&self) -> Result<(), GatewayError> {
        self.send_command(Command::Disconnect).await
    }

    /// Stops the connection task. Pending requests fail with `ConnectionClosed`.
    pub async fn dispose(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Dispose { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn active_run_set(&self) -> ActiveRunSet {
        self.active_runs.borrow().clone()
    }

    pub fn watch_active_runs(&self) -> watch::Receiver<ActiveRunSet> {
        self.active_runs.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Request {
            method: method.to_string(),
            params,
            timeout,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| GatewayError::Disposed)?
    }

    pub async fn gateway_status(&self) -> Result<Value, GatewayError> {
        self.request(METHOD_STATUS, json!({})).await
    }

    pub async fn list_sessions(
        &self,
        limit: usize,
        message_limit: usize,
    ) -> Result<Vec<Session>, GatewayError> {
        let payload = self
            .request(
                METHOD_SESSIONS_LIST,
                json!({ "limit": limit, "messageLimit": message_limit }),
            )
            .await?;
        let result: SessionsListResult = parse_payload(METHOD_SESSIONS_LIST, payload)?;
        Ok(result.sessions)
    }

    pub async fn active_runs(&self) -> Result<Vec<ActiveRun>, GatewayError> {
        let payload = self.request(METHOD_CHAT_ACTIVE_RUNS, json!({})).await?;
        let result: ActiveRunsResult = parse_payload(METHOD_CHAT_ACTIVE_RUNS, payload)?;
        Ok(result.runs)
    }

    pub async fn chat_history(
        &self,
        session_key: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        let payload = self
            .request(
                METHOD_CHAT_HISTORY,
                json!({ "sessionKey": session_key, "limit": limit }),
            )
            .await?;
        let result: ChatHistoryResult = parse_payload(METHOD_CHAT_HISTORY, payload)?;
        Ok(result.messages)
    }

    /// Sends a user message with a fresh idempotency key.
    pub async fn chat_send(&self, session_key: &str, message: &str) -> Result<Value, GatewayError> {
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        self.request(
            METHOD_CHAT_SEND,
            json!({
                "sessionKey": session_key,
                "message": message,
                "idempotencyKey": idempotency_key,
            }),
        )
        .await
    }

    pub async fn chat_abort(&self, session_key: &str) -> Result<Value, GatewayError> {
        self.request(METHOD_CHAT_ABORT, json!({ "sessionKey": session_key }))
            .await
    }

    async fn send_command(&self, command: Command) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::Disposed)
    }
}

fn parse_payload<T: DeserializeOwned>(method: &str, payload: Value) -> Result<T, GatewayError> {
    serde_json::from_value(payload).map_err(|err| GatewayError::Payload {
        method: method.to_string(),
        message: err.to_string(),
    })
}

struct Driver {
    config: GatewayConfig,
    url: Url,
    generation: u64,
    socket: Option<TransportHandle>,
    handshake: Handshake,
    correlator: Correlator,
    supervisor: Supervisor,
    keepalive: KeepaliveTimer,
    liveness: Option<Liveness>,
    active_runs: ActiveRunSet,
    socket_tx: mpsc::Sender<SocketEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    runs_tx: watch::Sender<ActiveRunSet>,
    events_tx: broadcast::Sender<GatewayEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut socket_events: mpsc::Receiver<SocketEvent>,
    ) {
        loop {
            let wake = self.next_wake();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Dispose { done }) => {
                        commands.close();
                        self.shutdown("client disposed");
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown("client dropped");
                        break;
                    }
                },
                Some(event) = socket_events.recv() => self.on_socket_event(event),
                _ = sleep_until(wake.unwrap_or_else(|| Instant::now() + IDLE_WAKE)), if wake.is_some() => {
                    self.on_timers(Instant::now());
                }
            }
        }
        debug!(event = "gateway_driver_stopped", url = %self.url);
    }

    fn next_wake(&self) -> Option<Instant> {
        [
            self.correlator.next_deadline(),
            self.handshake.deadline(),
            self.supervisor.reconnect_at(),
            self.keepalive.next(),
            self.liveness.as_ref().map(Liveness::deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.supervisor.on_explicit_connect();
                if self.socket.is_some() {
                    self.teardown(Some(NORMAL_CLOSE), "reconnecting");
                }
                self.open_socket();
            }
            Command::Disconnect => {
                self.supervisor.on_intentional_disconnect();
                self.teardown(Some(NORMAL_CLOSE), "client disconnect");
                self.set_status(ConnectionStatus::Disconnected);
            }
            Command::Request {
                method,
                params,
                timeout,
                reply,
            } => self.start_request(method, params, timeout, reply),
            Command::Dispose { .. } => {}
        }
    }

    fn start_request(
        &mut self,
        method: String,
        params: Value,
        timeout: Duration,
        reply: oneshot::Sender<Reply>,
    ) {
        if !self.handshake.is_authenticated() || self.socket.is_none() {
            let _ = reply.send(Err(GatewayError::NotConnected));
            return;
        }
        let id = self.correlator.next_id();
        let frame = Frame::request(id.clone(), method.clone(), params);
        if let Err(err) = self.send_frame(&frame) {
            warn!(event = "gateway_request_send_failed", method = %method, error = %err);
            let _ = reply.send(Err(err));
            return;
        }
        debug!(event = "gateway_request", id = %id, method = %method);
        self.correlator.register(
            id,
            method,
            Responder::Caller(reply),
            Instant::now(),
            timeout,
        );
    }

    fn start_internal(&mut self, call: InternalCall, method: &str) {
        let id = self.correlator.next_id();
        let frame = Frame::request(id.clone(), method, json!({}));
        match self.send_frame(&frame) {
            Ok(()) => self.correlator.register(
                id,
                method,
                Responder::Internal(call),
                Instant::now(),
                self.config.request_timeout,
            ),
            Err(err) => warn!(event = "gateway_internal_send_failed", method, error = %err),
        }
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<(), GatewayError> {
        match self.socket.as_mut() {
            Some(socket) => socket.send(frame),
            None => Err(GatewayError::NotOpen),
        }
    }

    fn open_socket(&mut self) {
        self.generation += 1;
        self.handshake.reset();
        info!(
            event = "gateway_connecting",
            url = %self.url,
            generation = self.generation,
            attempt = self.supervisor.attempts()
        );
        self.set_status(ConnectionStatus::Connecting);
        transport::open(
            self.generation,
            self.url.clone(),
            self.socket_tx.clone(),
            self.config.max_frame_bytes,
            self.config.connect_timeout,
        );
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        if event.generation != self.generation {
            debug!(
                event = "gateway_stale_socket_event",
                generation = event.generation,
                current = self.generation
            );
            return;
        }
        let now = Instant::now();
        match event.event {
            TransportEvent::Open(handle) => {
                info!(event = "gateway_socket_open", generation = self.generation);
                self.socket = Some(handle);
                self.handshake.on_open(now);
                self.liveness = Some(Liveness::new(now, self.config.stale_after));
            }
            TransportEvent::Frame(frame) => {
                self.touch(now);
                self.on_frame(frame, now);
            }
            TransportEvent::Heartbeat => self.touch(now),
            TransportEvent::ParseError(message) => {
                self.touch(now);
                warn!(event = "gateway_parse_error", error = %message);
                self.emit(GatewayEvent::ParseError(message));
            }
            TransportEvent::Closed { code, reason } => {
                info!(event = "gateway_socket_closed", code = ?code, reason = %reason);
                let dial_timed_out = self.socket.is_none() && reason == CONNECT_TIMEOUT_REASON;
                if let Some(socket) = self.socket.as_mut() {
                    socket.mark_closed();
                }
                self.teardown(code, &reason);
                if dial_timed_out {
                    self.emit(GatewayEvent::HandshakeTimeout);
                    self.set_status(ConnectionStatus::Error { message: reason });
                }
                self.schedule_reconnect(now);
            }
        }
    }

    fn touch(&mut self, now: Instant) {
        if let Some(liveness) = self.liveness.as_mut() {
            liveness.touch(now);
        }
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) {
        match frame {
            Frame::Event(event) => self.on_event(event, now),
            Frame::Res(response) => self.on_response(response),
            Frame::Req(request) => {
                debug!(event = "gateway_unhandled_request", method = %request.method);
            }
        }
    }

    fn on_event(&mut self, event: EventFrame, now: Instant) {
        match event.event.as_str() {
            EVENT_CONNECT_CHALLENGE => {
                let Some(challenge) = event.payload_as::<ConnectChallenge>() else {
                    warn!(event = "gateway_challenge_without_nonce");
                    return;
                };
                let correlator = &mut self.correlator;
                let connect = self
                    .handshake
                    .on_challenge(challenge.nonce, || correlator.next_id(), now);
                match connect {
                    Some(frame) => {
                        if let Err(err) = self.send_frame(&frame) {
                            warn!(event = "gateway_connect_send_failed", error = %err);
                        }
                    }
                    None => debug!(event = "gateway_duplicate_challenge"),
                }
            }
            EVENT_CHAT => match event.payload_as::<ChatEvent>() {
                Some(chat) => {
                    self.track_chat(&chat);
                    self.emit(GatewayEvent::Chat(chat));
                }
                None => warn!(event = "gateway_bad_chat_event"),
            },
            EVENT_AGENT => match event.payload_as::<AgentEvent>() {
                Some(agent) => {
                    self.track_agent(&agent);
                    self.emit(GatewayEvent::Agent(agent));
                }
                None => warn!(event = "gateway_bad_agent_event"),
            },
            _ => self.emit(GatewayEvent::Other {
                event: event.event,
                payload: event.payload,
            }),
        }
    }

    fn track_chat(&mut self, chat: &ChatEvent) {
        let changed = if chat.state.is_terminal() {
            self.active_runs
                .finish(&chat.session_key, chat.run_id.as_deref())
        } else {
            match chat.run_id.as_deref() {
                Some(run_id) if self.active_runs.run_id(&chat.session_key) != Some(run_id) => {
                    self.active_runs.insert(ActiveRun {
                        session_key: chat.session_key.clone(),
                        run_id: run_id.to_string(),
                    });
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.publish_runs();
        }
    }

    fn track_agent(&mut self, agent: &AgentEvent) {
        let (Some(phase), Some(session_key)) = (agent.lifecycle_phase(), agent.session_key.as_deref())
        else {
            return;
        };
        let changed = match phase {
            LifecyclePhase::Start => match agent.run_id.as_deref() {
                Some(run_id) => {
                    self.active_runs.insert(ActiveRun {
                        session_key: session_key.to_string(),
                        run_id: run_id.to_string(),
                    });
                    true
                }
                // Run id unknown until a later event names it.
                None => self.active_runs.insert(ActiveRun {
                    session_key: session_key.to_string(),
                    run_id: String::new(),
                }),
            },
            LifecyclePhase::End | LifecyclePhase::Error => self
                .active_runs
                .finish(session_key, agent.run_id.as_deref()),
        };
        if changed {
            self.publish_runs();
        }
    }

    fn on_response(&mut self, response: ResponseFrame) {
        match self.handshake.on_response(&response) {
            HandshakeOutcome::Authenticated(hello) => {
                self.on_authenticated(hello);
                return;
            }
            HandshakeOutcome::Rejected(message) => {
                warn!(event = "gateway_auth_failed", error = %message);
                self.set_status(ConnectionStatus::Error {
                    message: message.clone(),
                });
                self.emit(GatewayEvent::AuthFailed(message));
                return;
            }
            HandshakeOutcome::NotHandshake => {}
        }
        match self.correlator.resolve(&response) {
            Some(settled) => {
                debug!(event = "gateway_response", id = %settled.id, method = %settled.method, ok = response.ok);
                if let Some((call, reply)) = settled.deliver() {
                    self.on_internal_reply(call, reply);
                }
            }
            None => debug!(event = "gateway_unmatched_response", id = %response.id),
        }
    }

    fn on_authenticated(&mut self, hello: HelloOk) {
        let now = Instant::now();
        info!(
            event = "gateway_connected",
            protocol = hello.protocol,
            server_version = hello
                .server
                .as_ref()
                .and_then(|server| server.version.as_deref())
                .unwrap_or("unknown")
        );
        self.supervisor.on_authenticated();
        self.keepalive.start(now);
        self.set_status(ConnectionStatus::Connected);
        self.emit(GatewayEvent::Connected(hello));
        self.start_internal(InternalCall::ActiveRunsResync, METHOD_CHAT_ACTIVE_RUNS);
    }

    fn on_internal_reply(&mut self, call: InternalCall, reply: Reply) {
        match (call, reply) {
            (InternalCall::ActiveRunsResync, Ok(payload)) => {
                match serde_json::from_value::<ActiveRunsResult>(payload) {
                    Ok(result) => {
                        self.active_runs = ActiveRunSet::from_runs(result.runs);
                        debug!(event = "gateway_active_runs_synced", runs = self.active_runs.len());
                        self.publish_runs();
                    }
                    Err(err) => warn!(event = "gateway_active_runs_invalid", error = %err),
                }
            }
            (InternalCall::Keepalive, Ok(_)) => debug!(event = "gateway_keepalive_ok"),
            (call, Err(err)) => {
                warn!(event = "gateway_internal_request_failed", call = ?call, error = %err);
            }
        }
    }

    fn on_timers(&mut self, now: Instant) {
        for settled in self.correlator.expire_due(now) {
            warn!(event = "gateway_request_timeout", id = %settled.id, method = %settled.method);
            if let Some((call, reply)) = settled.deliver() {
                self.on_internal_reply(call, reply);
            }
        }

        if self.handshake.check_timeout(now) {
            warn!(event = "gateway_handshake_timeout", url = %self.url);
            self.emit(GatewayEvent::HandshakeTimeout);
            self.set_status(ConnectionStatus::Error {
                message: HANDSHAKE_TIMEOUT_REASON.to_string(),
            });
            self.teardown(Some(HANDSHAKE_TIMEOUT_CLOSE_CODE), HANDSHAKE_TIMEOUT_REASON);
            self.schedule_reconnect(now);
        }

        if self
            .liveness
            .as_ref()
            .is_some_and(|liveness| liveness.is_stale(now))
        {
            warn!(event = "gateway_stale_connection", stale_after_ms = self.config.stale_after.as_millis() as u64);
            self.teardown(Some(STALE_CLOSE), "stale connection");
            self.schedule_reconnect(now);
        }

        if self.keepalive.poll_due(now) && self.handshake.is_authenticated() {
            self.start_internal(InternalCall::Keepalive, METHOD_STATUS);
        }

        if self.supervisor.take_due(now) {
            self.open_socket();
        }
    }

    /// Closes and forgets the current socket, rejecting everything pending on it.
    fn teardown(&mut self, code: Option<u16>, reason: &str) {
        let had_socket = self.socket.is_some();
        if let Some(mut socket) = self.socket.take() {
            socket.close(code.unwrap_or(NORMAL_CLOSE), reason);
        }
        self.generation += 1;
        self.handshake.reset();
        self.keepalive.stop();
        self.liveness = None;
        for settled in self.correlator.fail_all(GatewayError::ConnectionClosed) {
            settled.deliver();
        }
        if !self.active_runs.is_empty() {
            self.active_runs.clear();
            self.publish_runs();
        }
        if had_socket {
            self.emit(GatewayEvent::Disconnected {
                code,
                reason: reason.to_string(),
            });
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        match self.supervisor.on_close(now) {
            ReconnectDecision::Scheduled { attempt, delay } => {
                info!(
                    event = "gateway_reconnect_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
                if !matches!(*self.status_tx.borrow(), ConnectionStatus::Error { .. }) {
                    self.set_status(ConnectionStatus::Disconnected);
                }
            }
            ReconnectDecision::AlreadyScheduled => {}
            ReconnectDecision::Suppressed => self.set_status(ConnectionStatus::Disconnected),
            ReconnectDecision::Exhausted { attempts } => {
                warn!(event = "gateway_reconnect_exhausted", attempts);
                self.set_status(ConnectionStatus::Error {
                    message: GatewayError::MaxAttemptsReached { attempts }.to_string(),
                });
                self.emit(GatewayEvent::MaxAttemptsReached { attempts });
            }
        }
    }

    fn shutdown(&mut self, reason: &str) {
        self.supervisor.on_intentional_disconnect();
        self.teardown(Some(NORMAL_CLOSE), reason);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn publish_runs(&self) {
        self.runs_tx.send_replace(self.active_runs.clone());
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events_tx.send(event);
    }
}
