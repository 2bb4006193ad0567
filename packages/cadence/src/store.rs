//! Durable storage for the wake list.
//!
//! The scheduler writes its whole sorted list after every change as four
//! parallel fields under a namespace:
//!
//! | key              | contents                                   |
//! |------------------|--------------------------------------------|
//! | `{ns}.tag`       | tags, newline-separated                    |
//! | `{ns}.action`    | action ids, comma-separated                |
//! | `{ns}.time`      | absolute fire times (ms), comma-separated  |
//! | `{ns}.repeat`    | repeat intervals (ms), comma-separated     |
//!
//! A missing or empty `time` field means nothing is pending.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::core::ActionId;
use crate::error::PersistError;
use crate::wake::ScheduledEntry;

/// Application-scoped string key/value storage.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write every pair in one go.
    fn put_all(&self, entries: &[(String, String)]) -> Result<()>;
}

// =============================================================================
// Field codec
// =============================================================================

/// The four raw persisted fields, as read from or written to a store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimerFields {
    pub tag: Option<String>,
    pub action: Option<String>,
    pub time: Option<String>,
    pub repeat: Option<String>,
}

impl TimerFields {
    pub fn encode(entries: &[ScheduledEntry]) -> Self {
        fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
            values.map(|v| v.to_string()).collect::<Vec<_>>().join(",")
        }

        Self {
            tag: Some(
                entries
                    .iter()
                    .map(|e| e.tag.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            action: Some(join(entries.iter().map(|e| e.action.value()))),
            time: Some(join(entries.iter().map(|e| e.fire_at_ms))),
            repeat: Some(join(entries.iter().map(|e| e.repeat_ms))),
        }
    }

    /// Rebuild the entries in stored order.
    pub fn decode(&self) -> Result<Vec<ScheduledEntry>, PersistError> {
        let times = match self.time.as_deref() {
            None | Some("") => return Ok(Vec::new()),
            Some(raw) => parse_numbers::<i64>("time", raw)?,
        };
        let expected = times.len();

        let actions = parse_numbers::<i32>("action", self.action.as_deref().unwrap_or(""))?;
        check_count("action", expected, actions.len())?;

        let repeats = parse_numbers::<i64>("repeat", self.repeat.as_deref().unwrap_or(""))?;
        check_count("repeat", expected, repeats.len())?;

        let tags: Vec<&str> = match self.tag.as_deref() {
            Some(raw) => raw.split('\n').collect(),
            None => Vec::new(),
        };
        check_count("tag", expected, tags.len())?;

        Ok(times
            .into_iter()
            .zip(actions)
            .zip(repeats)
            .zip(tags)
            .map(|(((fire_at_ms, action), repeat_ms), tag)| ScheduledEntry {
                action: ActionId(action),
                tag: tag.to_string(),
                fire_at_ms,
                repeat_ms,
            })
            .collect())
    }

    pub fn load(store: &dyn KeyValueStore, namespace: &str) -> Result<Self> {
        Ok(Self {
            tag: store.get(&key(namespace, "tag"))?,
            action: store.get(&key(namespace, "action"))?,
            time: store.get(&key(namespace, "time"))?,
            repeat: store.get(&key(namespace, "repeat"))?,
        })
    }

    pub fn save(self, store: &dyn KeyValueStore, namespace: &str) -> Result<()> {
        let pairs: Vec<(String, String)> = [
            ("tag", self.tag),
            ("action", self.action),
            ("time", self.time),
            ("repeat", self.repeat),
        ]
        .into_iter()
        .map(|(field, value)| (key(namespace, field), value.unwrap_or_default()))
        .collect();
        store.put_all(&pairs)
    }
}

fn key(namespace: &str, field: &str) -> String {
    format!("{}.{}", namespace, field)
}

fn parse_numbers<T: std::str::FromStr>(
    field: &'static str,
    raw: &str,
) -> Result<Vec<T>, PersistError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| PersistError::InvalidNumber {
                    field,
                    value: value.to_string(),
                })
        })
        .collect()
}

fn check_count(field: &'static str, expected: usize, found: usize) -> Result<(), PersistError> {
    if expected == found {
        Ok(())
    } else {
        Err(PersistError::FieldCount {
            field,
            expected,
            found,
        })
    }
}

// =============================================================================
// File Store
// =============================================================================

/// [`KeyValueStore`] backed by a JSON object in a single file.
///
/// Writes go to a sibling temp file first and are renamed into place.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.read_map()?.remove(key))
    }

    fn put_all(&self, entries: &[(String, String)]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut map = self.read_map()?;
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_string_pretty(&map)?;
        std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
