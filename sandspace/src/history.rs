//! Shell-history ingestion.
//!
//! Periodically reads the tail of each space's shell history straight from
//! its volume (through a read-only helper, so paused spaces stay paused) and
//! emits every command not seen before as a `space.shell` audit event.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::AuditKind;
use crate::config::HistoryConfig;
use crate::error::SpaceResult;
use crate::space::helper::{helper_spec, run_helper};
use crate::space::policy::{KIND_HISTORY_READ, KIND_SPACE, LABEL_KIND, LABEL_SPACE};
use crate::space::SpaceManager;

const READ_SCRIPT: &str = r#"f="$1/$2"
[ -f "$f" ] || exit 0
tail -c "$3" "$f" | tail -n "$4"
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub ts: Option<DateTime<Utc>>,
    pub command: String,
}

fn epoch(raw: &str) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(raw.parse().ok()?, 0).single()
}

/// Parse shell history. Accepts plain lines, lines prefixed with a unix
/// timestamp (`1700000000 make test`), and bash's `#1700000000` marker lines
/// that timestamp the following command.
pub fn parse_history(raw: &str) -> Vec<HistoryEntry> {
    static PREFIXED: OnceLock<Regex> = OnceLock::new();
    static MARKER: OnceLock<Regex> = OnceLock::new();
    let prefixed = PREFIXED
        .get_or_init(|| Regex::new(r"^(\d{9,12})\s+(.*)$").expect("invalid history prefix regex"));
    let marker =
        MARKER.get_or_init(|| Regex::new(r"^#(\d{9,12})$").expect("invalid history marker regex"));

    let mut entries = Vec::new();
    let mut pending_ts = None;
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if let Some(caps) = marker.captures(line.trim()) {
            pending_ts = epoch(&caps[1]);
            continue;
        }
        let entry = match prefixed.captures(line) {
            Some(caps) => HistoryEntry {
                ts: epoch(&caps[1]),
                command: caps[2].to_string(),
            },
            None => HistoryEntry {
                ts: pending_ts,
                command: line.to_string(),
            },
        };
        pending_ts = None;
        if !entry.command.trim().is_empty() {
            entries.push(entry);
        }
    }
    entries
}

/// Index of the first entry in `current` that `previous` has not covered,
/// found by the longest suffix of `previous` that prefixes `current`.
pub fn first_unseen(previous: &[HistoryEntry], current: &[HistoryEntry]) -> usize {
    let max = previous.len().min(current.len());
    for k in (1..=max).rev() {
        if previous[previous.len() - k..] == current[..k] {
            return k;
        }
    }
    0
}

pub struct HistoryIngestor {
    manager: Arc<SpaceManager>,
    config: HistoryConfig,
    cursors: DashMap<String, Vec<HistoryEntry>>,
}

impl HistoryIngestor {
    /// `None` when ingestion is disabled.
    pub fn new(manager: Arc<SpaceManager>, config: &HistoryConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            manager,
            config: config.clone(),
            cursors: DashMap::new(),
        })
    }

    /// One pass over every space. Returns the number of commands emitted.
    pub async fn ingest_once(&self) -> SpaceResult<usize> {
        let containers = self
            .manager
            .runtime()
            .list(&[(LABEL_KIND, KIND_SPACE)])
            .await?;
        let names: Vec<String> = containers
            .iter()
            .filter_map(|c| c.labels.get(LABEL_SPACE).cloned())
            .collect();
        self.cursors.retain(|name, _| names.contains(name));

        let mut emitted = 0;
        for name in &names {
            match self.ingest_space(name).await {
                Ok(n) => emitted += n,
                Err(e) => debug!(space = %name, error = %e, "history read failed"),
            }
        }
        Ok(emitted)
    }

    async fn ingest_space(&self, name: &str) -> SpaceResult<usize> {
        let rt = &self.manager.config().runtime;
        let spec = helper_spec(
            rt,
            KIND_HISTORY_READ,
            name,
            &format!("{}:{}", rt.uid, rt.gid),
            true,
            READ_SCRIPT,
            &[
                rt.workspace_mount.clone(),
                self.config.file.clone(),
                self.config.max_bytes.to_string(),
                self.config.max_lines.to_string(),
            ],
        );
        let outcome = run_helper(self.manager.runtime(), &spec).await?;
        if outcome.exit_code != 0 {
            debug!(space = %name, exit_code = outcome.exit_code, "history helper failed");
            return Ok(0);
        }

        let current = parse_history(&outcome.logs);
        let start = self
            .cursors
            .get(name)
            .map(|prev| first_unseen(&prev, &current))
            .unwrap_or(0);

        let fresh = &current[start..];
        for entry in fresh {
            self.manager.audit().record(
                AuditKind::SpaceShell,
                name,
                json!({
                    "command": entry.command,
                    "ts": entry.ts.map(|t| t.to_rfc3339()),
                }),
            );
        }
        let emitted = fresh.len();
        self.cursors.insert(name.to_string(), current);
        Ok(emitted)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), file = %self.config.file, "history ingestion started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.ingest_once().await {
                    Ok(0) => {}
                    Ok(n) => debug!(commands = n, "history ingested"),
                    Err(e) => warn!(error = %e, "history ingestion pass failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::space::tests::{harness, request};
    use std::sync::Mutex;

    fn entry(cmd: &str) -> HistoryEntry {
        HistoryEntry {
            ts: None,
            command: cmd.into(),
        }
    }

    #[test]
    fn parse_plain_and_timestamped() {
        let raw = "ls -la\n1700000000 make test\n\n#1700000100\ncargo build\r\n   \n";
        let entries = parse_history(raw);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], entry("ls -la"));
        assert_eq!(entries[1].command, "make test");
        assert_eq!(entries[1].ts.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(entries[2].command, "cargo build");
        assert_eq!(entries[2].ts.unwrap().timestamp(), 1_700_000_100);
    }

    #[test]
    fn short_numbers_are_commands() {
        let entries = parse_history("42 is the answer\n");
        assert_eq!(entries, vec![entry("42 is the answer")]);
    }

    #[test]
    fn first_unseen_overlap() {
        let prev = vec![entry("a"), entry("b"), entry("c")];
        let cur = vec![entry("b"), entry("c"), entry("d")];
        assert_eq!(first_unseen(&prev, &cur), 2);
        assert_eq!(first_unseen(&prev, &prev), 3);
        assert_eq!(first_unseen(&[], &cur), 0);
        assert_eq!(first_unseen(&prev, &[entry("x")]), 0);
    }

    fn shell_events(events: Vec<AuditEvent>) -> Vec<String> {
        events
            .into_iter()
            .filter(|e| e.event == AuditKind::SpaceShell)
            .map(|e| e.detail["command"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn ingestion_emits_only_new_commands() {
        let mut h = harness();
        h.manager.create(request("demo")).await.unwrap();
        h.drain_events();

        let history = Arc::new(Mutex::new(String::from("ls\npwd\n")));
        let source = history.clone();
        h.runtime.on_helper(move |spec| {
            assert!(spec.mounts[0].read_only);
            assert_eq!(spec.labels.get(LABEL_KIND).map(String::as_str), Some(KIND_HISTORY_READ));
            (0, source.lock().unwrap().clone())
        });

        let ingestor = HistoryIngestor::new(h.manager.clone(), &HistoryConfig::default()).unwrap();
        assert_eq!(ingestor.ingest_once().await.unwrap(), 2);
        assert_eq!(shell_events(h.drain_events()), vec!["ls", "pwd"]);

        assert_eq!(ingestor.ingest_once().await.unwrap(), 0);

        history.lock().unwrap().push_str("make test\n");
        assert_eq!(ingestor.ingest_once().await.unwrap(), 1);
        assert_eq!(shell_events(h.drain_events()), vec!["make test"]);

        // Helpers never linger.
        assert_eq!(h.runtime.containers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ingestion_does_not_resume_paused_spaces() {
        let h = harness();
        h.manager.create(request("demo")).await.unwrap();
        h.manager.pause("demo").await.unwrap();
        h.runtime.on_helper(|_| (0, "ls\n".into()));

        let ingestor = HistoryIngestor::new(h.manager.clone(), &HistoryConfig::default()).unwrap();
        assert_eq!(ingestor.ingest_once().await.unwrap(), 1);
        assert_eq!(
            h.runtime.state_of("sandspace-demo"),
            Some(crate::runtime::ContainerState::Paused)
        );
    }

    #[tokio::test]
    async fn cursor_dropped_for_destroyed_space() {
        let h = harness();
        h.manager.create(request("demo")).await.unwrap();
        h.runtime.on_helper(|_| (0, "ls\n".into()));
        let ingestor = HistoryIngestor::new(h.manager.clone(), &HistoryConfig::default()).unwrap();
        ingestor.ingest_once().await.unwrap();
        assert!(ingestor.cursors.contains_key("demo"));

        h.manager.destroy("demo", false).await.unwrap();
        ingestor.ingest_once().await.unwrap();
        assert!(ingestor.cursors.is_empty());
    }

    #[test]
    fn disabled_config_builds_nothing() {
        let h = harness();
        let config = HistoryConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(HistoryIngestor::new(h.manager.clone(), &config).is_none());
    }
}
