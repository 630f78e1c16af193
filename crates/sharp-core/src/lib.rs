pub mod gateway_ipc;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const UNKNOWN_SEGMENT: &str = "unknown";
pub const SUBAGENT_CHANNEL: &str = "subagent";

const KEY_PREFIX: &str = "agent";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub updated_at: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_last_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
}

impl Session {
    pub fn new(key: impl Into<String>, updated_at: i64) -> Self {
        Self {
            key: key.into(),
            label: None,
            display_name: None,
            created_at: None,
            last_message_at: None,
            updated_at,
            message_count: 0,
            aborted_last_run: None,
            messages: None,
        }
    }

    pub fn parsed_key(&self) -> SessionKey {
        SessionKey::parse(&self.key)
    }

    pub fn is_subagent(&self) -> bool {
        self.parsed_key().is_subagent()
    }

    /// Last-message time, then creation time, then the server's update stamp.
    pub fn last_activity_ms(&self) -> i64 {
        self.last_message_at
            .or(self.created_at)
            .unwrap_or(self.updated_at)
    }

    /// Creation time, falling back to the server's update stamp.
    pub fn created_ms(&self) -> i64 {
        self.created_at.unwrap_or(self.updated_at)
    }

    pub fn aborted(&self) -> bool {
        self.aborted_last_run.unwrap_or(false)
    }

    pub fn latest_message(&self) -> Option<&ChatMessage> {
        self.messages.as_ref().and_then(|messages| messages.last())
    }

    pub fn title(&self) -> String {
        if let Some(label) = self.label.as_deref().filter(|l| !l.trim().is_empty()) {
            return label.to_string();
        }
        if let Some(name) = self.display_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        let key = self.parsed_key();
        format!("{}/{}", key.agent_id, key.channel)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChatMessage {
    pub fn is_assistant(&self) -> bool {
        self.role.eq_ignore_ascii_case("assistant")
    }

    /// Flattens string content or `[{type: "text", text}]` blocks into one string.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    Value::String(text) => Some(text.as_str()),
                    Value::Object(map) => {
                        let kind = map.get("type").and_then(Value::as_str).unwrap_or("text");
                        if kind == "text" {
                            map.get("text").and_then(Value::as_str)
                        } else {
                            None
                        }
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Object(map) => map
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRun {
    pub session_key: String,
    pub run_id: String,
}

/// Sessions with a run in flight, keyed by session key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveRunSet {
    runs: BTreeMap<String, String>,
}

impl ActiveRunSet {
    pub fn from_runs(runs: impl IntoIterator<Item = ActiveRun>) -> Self {
        let mut set = Self::default();
        for run in runs {
            set.insert(run);
        }
        set
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.runs.contains_key(session_key)
    }

    pub fn run_id(&self, session_key: &str) -> Option<&str> {
        self.runs.get(session_key).map(String::as_str)
    }

    pub fn insert(&mut self, run: ActiveRun) -> bool {
        self.runs.insert(run.session_key, run.run_id).is_none()
    }

    /// Removes the session's run. When `run_id` is given it must match the tracked run,
    /// so a late terminal event from an older run cannot clear a newer one. A run tracked
    /// with an empty id matches any.
    pub fn finish(&mut self, session_key: &str, run_id: Option<&str>) -> bool {
        match (self.runs.get(session_key), run_id) {
            (Some(current), Some(run_id)) if !current.is_empty() && current != run_id => false,
            (Some(_), _) => self.runs.remove(session_key).is_some(),
            (None, _) => false,
        }
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ActiveRun> + '_ {
        self.runs.iter().map(|(session_key, run_id)| ActiveRun {
            session_key: session_key.clone(),
            run_id: run_id.clone(),
        })
    }
}

/// Structured view of `agent:<agentId>:<channel>:<details...>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub agent_id: String,
    pub channel: String,
    pub details: String,
}

impl SessionKey {
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split(':');
        if parts.next().map(str::trim) != Some(KEY_PREFIX) {
            return Self {
                agent_id: UNKNOWN_SEGMENT.to_string(),
                channel: UNKNOWN_SEGMENT.to_string(),
                details: segment_or_unknown(Some(raw)),
            };
        }
        let agent_id = segment_or_unknown(parts.next());
        let channel = segment_or_unknown(parts.next());
        let rest = parts.collect::<Vec<_>>().join(":");
        let details = segment_or_unknown(Some(rest.as_str()));
        Self {
            agent_id,
            channel,
            details,
        }
    }

    pub fn is_subagent(&self) -> bool {
        self.channel == SUBAGENT_CHANNEL
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{KEY_PREFIX}:{}:{}:{}",
            self.agent_id, self.channel, self.details
        )
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decodes each session on its own; records that do not parse are dropped.
pub fn deserialize_sessions<'de, D>(deserializer: D) -> Result<Vec<Session>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(values
        .unwrap_or_default()
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect())
}

fn segment_or_unknown(segment: Option<&str>) -> String {
    match segment.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => UNKNOWN_SEGMENT.to_string(),
    }
}
