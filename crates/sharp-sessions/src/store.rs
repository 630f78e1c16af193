use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("store json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sticky `subagent key -> parent key` map. Entries are written once and never replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParentAssignments {
    entries: BTreeMap<String, String>,
}

impl ParentAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subagent_key: &str) -> Option<&str> {
        self.entries.get(subagent_key).map(String::as_str)
    }

    /// Returns `true` when the entry was added; an existing entry is left untouched.
    pub fn insert_if_absent(
        &mut self,
        subagent_key: impl Into<String>,
        parent_key: impl Into<String>,
    ) -> bool {
        let subagent_key = subagent_key.into();
        if self.entries.contains_key(&subagent_key) {
            return false;
        }
        self.entries.insert(subagent_key, parent_key.into());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(sub, parent)| (sub.as_str(), parent.as_str()))
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        save_json(path, self)
    }
}

/// Per-session last-viewed timestamps (epoch ms).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadMarkers {
    viewed: BTreeMap<String, i64>,
}

impl ReadMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_viewed(&self, session_key: &str) -> Option<i64> {
        self.viewed.get(session_key).copied()
    }

    /// Markers only move forward.
    pub fn mark_viewed(&mut self, session_key: impl Into<String>, at_ms: i64) {
        let entry = self.viewed.entry(session_key.into()).or_insert(at_ms);
        if at_ms > *entry {
            *entry = at_ms;
        }
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        save_json(path, self)
    }
}

fn load_json<T>(path: &Path) -> Result<T, StoreError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(T::default()),
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let encoded = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, encoded)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn assignments_never_overwrite() {
        let mut assignments = ParentAssignments::new();
        assert!(assignments.insert_if_absent("agent:main:subagent:1", "agent:main:telegram:1"));
        assert!(!assignments.insert_if_absent("agent:main:subagent:1", "agent:main:slack:9"));
        assert_eq!(
            assignments.get("agent:main:subagent:1"),
            Some("agent:main:telegram:1")
        );
        assert_eq!(assignments.len(), 1);
    }

    #[test]
    fn stores_persist_and_reload() {
        let dir = tempdir().expect("tempdir");
        let assignments_path = dir.path().join("state/parents.json");
        let markers_path = dir.path().join("state/read.json");

        assert!(ParentAssignments::load(&assignments_path)
            .expect("missing file loads empty")
            .is_empty());

        let mut assignments = ParentAssignments::new();
        assignments.insert_if_absent("agent:main:subagent:1", "agent:main:telegram:1");
        assignments.save(&assignments_path).expect("save assignments");
        let reloaded = ParentAssignments::load(&assignments_path).expect("load assignments");
        assert_eq!(reloaded, assignments);

        let mut markers = ReadMarkers::new();
        markers.mark_viewed("agent:main:telegram:1", 2_000);
        markers.mark_viewed("agent:main:telegram:1", 1_000);
        markers.save(&markers_path).expect("save markers");
        let reloaded = ReadMarkers::load(&markers_path).expect("load markers");
        assert_eq!(reloaded.last_viewed("agent:main:telegram:1"), Some(2_000));
        assert_eq!(reloaded.last_viewed("agent:main:telegram:2"), None);
    }

    #[test]
    fn corrupt_store_reports_json_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("parents.json");
        fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            ParentAssignments::load(&path),
            Err(StoreError::Json(_))
        ));
    }
}
