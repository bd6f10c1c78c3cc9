use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IdleConfig;
use crate::error::SpaceResult;
use crate::runtime::ContainerState;
use crate::space::policy::{KIND_SPACE, LABEL_KIND, LABEL_SPACE};
use crate::space::SpaceManager;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub paused: Vec<String>,
    pub failed: Vec<String>,
}

/// Pauses running spaces that have seen no activity for longer than the
/// configured timeout.
pub struct IdleMonitor {
    manager: Arc<SpaceManager>,
    timeout: chrono::Duration,
    interval: Duration,
}

impl IdleMonitor {
    /// `None` when the monitor is disabled (`timeout_secs = 0`).
    pub fn new(manager: Arc<SpaceManager>, config: &IdleConfig) -> Option<Self> {
        if config.timeout_secs == 0 {
            return None;
        }
        Some(Self {
            manager,
            timeout: i64::try_from(config.timeout_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
        })
    }

    /// One pass over the running spaces. Failures are per space and do not
    /// stop the pass.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SpaceResult<SweepReport> {
        let containers = self
            .manager
            .runtime()
            .list(&[(LABEL_KIND, KIND_SPACE)])
            .await?;
        let rt = &self.manager.config().runtime;
        let mut report = SweepReport::default();

        for c in containers {
            if c.state != ContainerState::Running {
                continue;
            }
            let Some(name) = c
                .labels
                .get(LABEL_SPACE)
                .cloned()
                .or_else(|| rt.space_name(&c.name).map(str::to_string))
            else {
                continue;
            };

            let last = self
                .manager
                .activity()
                .get(&name)
                .or(c.started_at)
                .unwrap_or(now);
            let elapsed = now - last;
            if elapsed <= self.timeout {
                continue;
            }

            match self.manager.pause(&name).await {
                Ok(true) => {
                    info!(
                        space = %name,
                        idle_secs = elapsed.num_seconds(),
                        "paused idle space"
                    );
                    self.manager.metrics().record_idle_pause();
                    report.paused.push(name);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(space = %name, error = %e, "idle pause failed");
                    self.manager.metrics().record_error("idle_pause");
                    report.failed.push(name);
                }
            }
        }
        Ok(report)
    }

    /// Run sweeps forever on the configured interval.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                timeout_secs = self.timeout.num_seconds(),
                interval_secs = self.interval.as_secs(),
                "idle monitor started"
            );
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.sweep_once(Utc::now()).await {
                    Ok(report) if !report.paused.is_empty() || !report.failed.is_empty() => {
                        debug!(paused = report.paused.len(), failed = report.failed.len(), "idle sweep done");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "idle sweep failed"),
                }
            }
        })
    }
}
