//! Last-activity timestamps per space.
//!
//! Shared by the lifecycle manager, exec gateway, terminal bridge and idle
//! monitor. Updates are single-key and merge with `max`, so a late writer can
//! never move a timestamp backwards.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct ActivityStore {
    last_seen: DashMap<String, DateTime<Utc>>,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for `space` at the current time.
    pub fn touch(&self, space: &str) {
        self.touch_at(space, Utc::now());
    }

    /// Record activity at `at`, keeping the later of the stored and given instants.
    pub fn touch_at(&self, space: &str, at: DateTime<Utc>) {
        self.last_seen
            .entry(space.to_string())
            .and_modify(|current| {
                if at > *current {
                    *current = at;
                }
            })
            .or_insert(at);
    }

    pub fn get(&self, space: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(space).map(|entry| *entry)
    }

    /// Forget a space. Called on destroy.
    pub fn remove(&self, space: &str) {
        self.last_seen.remove(space);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
