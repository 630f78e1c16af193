mod logging;
mod render;

use anyhow::{Context, Result};
use clap::Parser;
use sharp_core::{now_ms, ActiveRunSet};
use sharp_gateway::{GatewayClient, GatewayConfig, GatewayError, GatewayEvent};
use sharp_sessions::{
    ParentAssignments, ReadMarkers, RegexWaitingPredicate, SessionReconciler, StatusContext,
};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const DEFAULT_STATE_DIR: &str = ".sharp/state";
const DEFAULT_LOG_DIR: &str = ".sharp/logs";
const DEFAULT_POLL_SECS: u64 = 10;
const SESSION_LIMIT: usize = 50;
const SESSION_MESSAGE_LIMIT: usize = 1;
const ASSIGNMENTS_FILE: &str = "parent-assignments.json";
const READ_MARKERS_FILE: &str = "read-markers.json";

#[derive(Parser, Debug)]
#[command(name = "sharp-monitor", about = "Watch gateway sessions as a parent/subagent tree")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long, default_value = "")]
    state_dir: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Session treated as open: used as the fallback parent and marked viewed on every poll.
    #[arg(long, default_value = "")]
    selected: String,
    #[arg(long)]
    poll_secs: Option<u64>,
    /// Upgrade ws:// to wss://.
    #[arg(long)]
    secure: bool,
}

#[derive(Debug)]
struct MonitorConfig {
    gateway: GatewayConfig,
    state_dir: PathBuf,
    log_dir: String,
    log_level: String,
    log_stdout: bool,
    poll_interval: Duration,
    selected: Option<String>,
}

struct MonitorState {
    assignments: ParentAssignments,
    read_markers: ReadMarkers,
    assignments_path: PathBuf,
    read_markers_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args);
    let _log_guard =
        logging::init_logging(&config.log_dir, &config.log_level, config.log_stdout);
    run(config).await
}

fn load_config(args: Args) -> MonitorConfig {
    let mut gateway = GatewayConfig::default();
    if let Some(url) = resolve_setting(&args.url, "SHARP_GATEWAY_URL") {
        gateway.url = url;
    }
    gateway.token = resolve_setting(&args.token, "SHARP_GATEWAY_TOKEN");
    gateway.password = resolve_setting(&args.password, "SHARP_GATEWAY_PASSWORD");
    gateway.secure_context = args.secure;

    MonitorConfig {
        gateway,
        state_dir: PathBuf::from(
            resolve_setting(&args.state_dir, "SHARP_STATE_DIR")
                .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string()),
        ),
        log_dir: resolve_setting(&args.log_dir, "SHARP_LOG_DIR")
            .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
        log_level: resolve_setting("", "SHARP_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        log_stdout: logging::resolve_log_stdout(),
        poll_interval: Duration::from_secs(resolve_poll_secs(args.poll_secs).max(1)),
        selected: resolve_setting(&args.selected, "SHARP_SELECTED_SESSION"),
    }
}

/// Flag first, then the environment. Blank values count as unset.
fn resolve_setting(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env::var(env_key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_poll_secs(flag: Option<u64>) -> u64 {
    if let Some(value) = flag {
        return value;
    }
    env::var("SHARP_POLL_SECS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_POLL_SECS)
}

impl MonitorState {
    fn load(state_dir: &Path) -> Result<Self> {
        let assignments_path = state_dir.join(ASSIGNMENTS_FILE);
        let read_markers_path = state_dir.join(READ_MARKERS_FILE);
        let assignments = ParentAssignments::load(&assignments_path)
            .with_context(|| format!("failed to load {}", assignments_path.display()))?;
        let read_markers = ReadMarkers::load(&read_markers_path)
            .with_context(|| format!("failed to load {}", read_markers_path.display()))?;
        Ok(Self {
            assignments,
            read_markers,
            assignments_path,
            read_markers_path,
        })
    }

    fn save(&self) -> Result<()> {
        self.assignments
            .save(&self.assignments_path)
            .with_context(|| format!("failed to save {}", self.assignments_path.display()))?;
        self.read_markers
            .save(&self.read_markers_path)
            .with_context(|| format!("failed to save {}", self.read_markers_path.display()))?;
        Ok(())
    }
}

async fn run(config: MonitorConfig) -> Result<()> {
    let mut state = MonitorState::load(&config.state_dir)?;
    info!(
        event = "monitor_start",
        url = %config.gateway.url,
        state_dir = %config.state_dir.display(),
        cached_parents = state.assignments.len()
    );

    let client =
        GatewayClient::create(config.gateway.clone()).context("invalid gateway configuration")?;
    let mut events = client.subscribe();
    client.connect().await.context("gateway client stopped")?;

    let reconciler = SessionReconciler::default();
    let waiting = RegexWaitingPredicate::default();
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "monitor_shutdown");
                break;
            }
            _ = ticker.tick() => {
                if client.status().is_connected() {
                    poll_once(&client, &reconciler, &waiting, &mut state, &config).await;
                }
            }
            event = events.recv() => match event {
                Ok(GatewayEvent::Connected(hello)) => {
                    info!(event = "monitor_connected", protocol = hello.protocol);
                    poll_once(&client, &reconciler, &waiting, &mut state, &config).await;
                }
                Ok(GatewayEvent::Disconnected { code, reason }) => {
                    info!(event = "monitor_disconnected", code = ?code, reason = %reason);
                }
                Ok(GatewayEvent::AuthFailed(message)) => {
                    warn!(event = "monitor_auth_failed", error = %message);
                }
                Ok(GatewayEvent::HandshakeTimeout) => warn!(event = "monitor_handshake_timeout"),
                Ok(GatewayEvent::MaxAttemptsReached { attempts }) => {
                    error!(event = "monitor_gave_up", attempts);
                }
                Ok(GatewayEvent::ParseError(message)) => {
                    warn!(event = "monitor_parse_error", error = %message);
                }
                Ok(GatewayEvent::Chat(chat)) => {
                    debug!(event = "chat", session = %chat.session_key, state = ?chat.state);
                }
                Ok(GatewayEvent::Agent(agent)) => {
                    debug!(event = "agent", session = ?agent.session_key, stream = %agent.stream);
                }
                Ok(GatewayEvent::Other { event, .. }) => debug!(event = "gateway_event", name = %event),
                Err(RecvError::Lagged(skipped)) => warn!(event = "monitor_events_lagged", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    client.dispose().await;
    state.save()?;
    Ok(())
}

async fn poll_once(
    client: &GatewayClient,
    reconciler: &SessionReconciler,
    waiting: &RegexWaitingPredicate,
    state: &mut MonitorState,
    config: &MonitorConfig,
) {
    if let Err(err) = render_sessions(client, reconciler, waiting, state, config).await {
        warn!(event = "monitor_poll_failed", error = %err);
    }
}

async fn render_sessions(
    client: &GatewayClient,
    reconciler: &SessionReconciler,
    waiting: &RegexWaitingPredicate,
    state: &mut MonitorState,
    config: &MonitorConfig,
) -> Result<(), GatewayError> {
    let sessions = client
        .list_sessions(SESSION_LIMIT, SESSION_MESSAGE_LIMIT)
        .await?;
    let runs = ActiveRunSet::from_runs(client.active_runs().await?);
    let now = now_ms();
    let selected = config.selected.as_deref();
    if let Some(key) = selected {
        state.read_markers.mark_viewed(key, now);
    }

    let tree = reconciler.reconcile(&sessions, &runs, &mut state.assignments, selected);
    let ctx = StatusContext {
        active_runs: &runs,
        read_markers: &state.read_markers,
        now_ms: now,
        waiting,
    };
    info!(
        event = "session_tree",
        roots = tree.len(),
        subagents = tree.child_count(),
        running = runs.len()
    );
    for line in render::render_tree(&tree, &ctx) {
        info!(event = "session_line", "{line}");
    }

    if let Err(err) = state.save() {
        warn!(event = "monitor_state_save_failed", error = %err);
    }
    Ok(())
}
