//! Turns the flat `sessions.list` result into a two-level tree: main sessions at the
//! top, subagent sessions nested under an inferred parent.

pub mod status;
pub mod store;
pub mod waiting;

pub use status::{session_status, SessionStatus, StatusContext, StatusDisplay};
pub use store::{ParentAssignments, ReadMarkers, StoreError};
pub use waiting::{RegexWaitingPredicate, WaitingPredicate};

use sharp_core::{ActiveRunSet, Session};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

pub const PARENT_TOLERANCE_MS: i64 = 60_000;
pub const VIRTUAL_PARENT_KEY: &str = "virtual:unassigned";
pub const VIRTUAL_PARENT_LABEL: &str = "Unassigned";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub tolerance_ms: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: PARENT_TOLERANCE_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentSource {
    Cached,
    Timing,
    Selected,
    FirstCandidate,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inference {
    pub parent_key: String,
    pub source: ParentSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub session: Session,
    pub children: Vec<Session>,
    pub virtual_parent: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionTree {
    pub roots: Vec<TreeNode>,
}

impl SessionTree {
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn child_count(&self) -> usize {
        self.roots.iter().map(|node| node.children.len()).sum()
    }

    pub fn root(&self, key: &str) -> Option<&TreeNode> {
        self.roots.iter().find(|node| node.session.key == key)
    }

    pub fn parent_of(&self, child_key: &str) -> Option<&str> {
        self.roots
            .iter()
            .find(|node| node.children.iter().any(|child| child.key == child_key))
            .map(|node| node.session.key.as_str())
    }
}

pub struct SessionReconciler {
    config: ReconcilerConfig,
}

impl Default for SessionReconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

impl SessionReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    /// Builds the tree. Newly inferred parents are written to `assignments`;
    /// existing entries are never replaced.
    pub fn reconcile(
        &self,
        sessions: &[Session],
        active_runs: &ActiveRunSet,
        assignments: &mut ParentAssignments,
        selected: Option<&str>,
    ) -> SessionTree {
        let sorted = sort_sessions(sessions, active_runs);
        let (subagents, parents): (Vec<&Session>, Vec<&Session>) =
            sorted.iter().partition(|session| session.is_subagent());

        let mut children: HashMap<String, Vec<Session>> = HashMap::new();
        for sub in &subagents {
            let inference = self.infer_parent(sub, &parents, assignments, selected);
            if matches!(
                inference.source,
                ParentSource::Timing | ParentSource::Selected | ParentSource::FirstCandidate
            ) && assignments.insert_if_absent(sub.key.clone(), inference.parent_key.clone())
            {
                debug!(
                    event = "parent_assigned",
                    subagent = %sub.key,
                    parent = %inference.parent_key,
                    source = ?inference.source
                );
            }
            children
                .entry(inference.parent_key)
                .or_default()
                .push((*sub).clone());
        }

        let mut roots = parents
            .iter()
            .map(|parent| TreeNode {
                session: (*parent).clone(),
                children: children.remove(&parent.key).unwrap_or_default(),
                virtual_parent: false,
            })
            .collect::<Vec<_>>();

        if let Some(orphans) = children.remove(VIRTUAL_PARENT_KEY) {
            roots.push(TreeNode {
                session: virtual_parent_session(&orphans),
                children: orphans,
                virtual_parent: true,
            });
        }

        SessionTree { roots }
    }

    /// `parents` must already be in display order; the first-candidate rule depends on it.
    pub fn infer_parent(
        &self,
        subagent: &Session,
        parents: &[&Session],
        assignments: &ParentAssignments,
        selected: Option<&str>,
    ) -> Inference {
        if let Some(cached) = assignments.get(&subagent.key) {
            if parents.iter().any(|parent| parent.key == cached) {
                return Inference {
                    parent_key: cached.to_string(),
                    source: ParentSource::Cached,
                };
            }
            debug!(
                event = "cached_parent_missing",
                subagent = %subagent.key,
                parent = %cached
            );
        }

        if let Some(parent) = self.closest_preceding(subagent, parents) {
            return Inference {
                parent_key: parent.key.clone(),
                source: ParentSource::Timing,
            };
        }

        if let Some(selected) = selected {
            if let Some(parent) = parents.iter().find(|parent| parent.key == selected) {
                return Inference {
                    parent_key: parent.key.clone(),
                    source: ParentSource::Selected,
                };
            }
        }

        if let Some(first) = parents.first() {
            return Inference {
                parent_key: first.key.clone(),
                source: ParentSource::FirstCandidate,
            };
        }

        Inference {
            parent_key: VIRTUAL_PARENT_KEY.to_string(),
            source: ParentSource::Virtual,
        }
    }

    /// Parent activity may trail the subagent's creation by up to the tolerance;
    /// among accepted candidates the smallest gap wins.
    fn closest_preceding<'a>(&self, subagent: &Session, parents: &[&'a Session]) -> Option<&'a Session> {
        let created = subagent.created_ms();
        parents
            .iter()
            .filter_map(|parent| {
                let diff = created.saturating_sub(parent.last_activity_ms());
                (diff >= self.config.tolerance_ms.saturating_neg()).then_some((diff, *parent))
            })
            .min_by_key(|(diff, _)| *diff)
            .map(|(_, parent)| parent)
    }
}

/// Running main sessions first, then most recent message first.
pub fn compare_sessions(a: &Session, b: &Session, active_runs: &ActiveRunSet) -> Ordering {
    let promoted = |session: &Session| !session.is_subagent() && active_runs.contains(&session.key);
    promoted(b)
        .cmp(&promoted(a))
        .then_with(|| message_time(b).cmp(&message_time(a)))
        .then_with(|| a.key.cmp(&b.key))
}

pub fn sort_sessions(sessions: &[Session], active_runs: &ActiveRunSet) -> Vec<Session> {
    let mut sorted = sessions.to_vec();
    sorted.sort_by(|a, b| compare_sessions(a, b, active_runs));
    sorted
}

fn message_time(session: &Session) -> i64 {
    session.last_message_at.unwrap_or(session.updated_at)
}

fn virtual_parent_session(orphans: &[Session]) -> Session {
    let updated_at = orphans
        .iter()
        .map(|session| session.updated_at)
        .max()
        .unwrap_or_default();
    let mut session = Session::new(VIRTUAL_PARENT_KEY, updated_at);
    session.label = Some(VIRTUAL_PARENT_LABEL.to_string());
    session
}
