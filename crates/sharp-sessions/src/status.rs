use crate::store::ReadMarkers;
use crate::waiting::{latest_assistant_waiting, WaitingPredicate};
use sharp_core::{ActiveRunSet, Session};
use std::fmt;

pub const UNREAD_GRACE_MS: i64 = 1_000;
pub const RECENT_WINDOW_MS: i64 = 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SessionStatus {
    Running,
    Error,
    NeedsYou,
    Recent,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDisplay {
    pub label: &'static str,
    pub emoji: &'static str,
    pub color: &'static str,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Error => "error",
            SessionStatus::NeedsYou => "needs-you",
            SessionStatus::Recent => "recent",
            SessionStatus::Idle => "idle",
        }
    }

    pub fn display(&self) -> StatusDisplay {
        match self {
            SessionStatus::Running => StatusDisplay {
                label: "Running",
                emoji: "🟢",
                color: "#22c55e",
            },
            SessionStatus::Error => StatusDisplay {
                label: "Error",
                emoji: "🔴",
                color: "#ef4444",
            },
            SessionStatus::NeedsYou => StatusDisplay {
                label: "Needs you",
                emoji: "🟡",
                color: "#f59e0b",
            },
            SessionStatus::Recent => StatusDisplay {
                label: "Recent",
                emoji: "🔵",
                color: "#3b82f6",
            },
            SessionStatus::Idle => StatusDisplay {
                label: "Idle",
                emoji: "⚪",
                color: "#6b7280",
            },
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct StatusContext<'a> {
    pub active_runs: &'a ActiveRunSet,
    pub read_markers: &'a ReadMarkers,
    pub now_ms: i64,
    pub waiting: &'a dyn WaitingPredicate,
}

/// First match wins: running, error, needs-you, recent, idle.
pub fn session_status(session: &Session, ctx: &StatusContext<'_>) -> SessionStatus {
    if ctx.active_runs.contains(&session.key) {
        return SessionStatus::Running;
    }
    if session.aborted() {
        return SessionStatus::Error;
    }
    if has_unread(session, ctx.read_markers) || latest_assistant_waiting(session, ctx.waiting) {
        return SessionStatus::NeedsYou;
    }
    if ctx.now_ms.saturating_sub(session.updated_at) < RECENT_WINDOW_MS {
        return SessionStatus::Recent;
    }
    SessionStatus::Idle
}

/// A session never opened has no marker and is not counted as unread.
pub fn has_unread(session: &Session, read_markers: &ReadMarkers) -> bool {
    match read_markers.last_viewed(&session.key) {
        Some(viewed) => session.updated_at > viewed.saturating_add(UNREAD_GRACE_MS),
        None => false,
    }
}
