//! Per-space resource usage.
//!
//! Engine counters are available in any state. Disk usage, the process
//! snapshot and the history tail need a process inside the space, so they
//! are only gathered from running spaces; reading them never resumes a
//! paused space and does not count as activity.

use std::sync::Arc;

use sandspace_protocol::{ProcessSample, SpaceObservability, SpaceStats, WorkspaceDisk};
use tracing::{debug, instrument};

use crate::error::{SpaceError, SpaceResult};
use crate::exec::collect;
use crate::runtime::{ContainerState, ContainerStats, ExecSpec};
use crate::space::SpaceManager;

/// Processes in the top snapshot.
const TOP_LIMIT: usize = 8;
/// Lines in the history tail.
const HISTORY_TAIL_LINES: usize = 50;

/// Prints `total used avail` in KiB, then the tree size in KiB.
const DISK_SCRIPT: &str = r#"df -Pk "$1" | awk 'NR==2 {print $2, $3, $4}'
du -sk "$1" 2>/dev/null | awk '{print $1}'
"#;

const TOP_SCRIPT: &str = r#"ps -eo pid=,pcpu=,pmem=,etime=,comm= --sort=-pcpu | head -n "$1"
"#;

const HISTORY_SCRIPT: &str = r#"f="$1/$2"
[ -f "$f" ] || exit 0
tail -n "$3" "$f"
"#;

/// CPU use over the engine's last sampling window, as a percentage of one
/// CPU (a busy two-CPU space reads 200).
pub fn cpu_percent(stats: &ContainerStats) -> f64 {
    let cpu_delta = stats.cpu.total_usage.saturating_sub(stats.precpu.total_usage);
    let system_delta = stats.cpu.system_usage.saturating_sub(stats.precpu.system_usage);
    if system_delta == 0 {
        return 0.0;
    }
    cpu_delta as f64 / system_delta as f64 * f64::from(stats.cpu.online_cpus.max(1)) * 100.0
}

pub fn space_stats(stats: &ContainerStats) -> SpaceStats {
    SpaceStats {
        cpu_percent: cpu_percent(stats),
        memory_usage_bytes: stats.memory_usage,
        memory_limit_bytes: stats.memory_limit,
        pids: stats.pids,
        network_rx_bytes: stats.network_rx,
        network_tx_bytes: stats.network_tx,
        block_read_bytes: stats.block_read,
        block_write_bytes: stats.block_write,
    }
}

/// Parse the output of [`DISK_SCRIPT`]. Either line may be missing.
pub fn parse_disk(path: &str, raw: &str) -> (Option<WorkspaceDisk>, Option<u64>) {
    let mut lines = raw.lines();
    let disk = lines.next().and_then(|line| {
        let nums: Vec<u64> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        let [total, used, avail] = nums[..] else {
            return None;
        };
        let used_percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };
        Some(WorkspaceDisk {
            path: path.to_string(),
            total_bytes: total * 1024,
            used_bytes: used * 1024,
            avail_bytes: avail * 1024,
            used_percent,
        })
    });
    let size = lines
        .next()
        .and_then(|line| line.trim().parse::<u64>().ok())
        .map(|kib| kib * 1024);
    (disk, size)
}

/// Parse `ps -eo pid=,pcpu=,pmem=,etime=,comm=` rows, skipping any that do
/// not fit.
pub fn parse_top(raw: &str) -> Vec<ProcessSample> {
    raw.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let pid = cols.next()?.parse().ok()?;
            let cpu = cols.next()?.parse().ok()?;
            let mem = cols.next()?.parse().ok()?;
            let etime = cols.next()?.to_string();
            let command = cols.collect::<Vec<_>>().join(" ");
            if command.is_empty() {
                return None;
            }
            Some(ProcessSample {
                pid,
                cpu,
                mem,
                etime,
                command,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct SpaceStatsReader {
    manager: Arc<SpaceManager>,
}

impl SpaceStatsReader {
    pub fn new(manager: Arc<SpaceManager>) -> Self {
        Self { manager }
    }

    #[instrument(skip(self))]
    pub async fn stats(&self, name: &str) -> SpaceResult<SpaceStats> {
        let info = self.manager.resolve(name).await?;
        let raw = self
            .manager
            .runtime()
            .stats(&info.name)
            .await
            .map_err(|e| SpaceError::runtime(name, e))?;
        Ok(space_stats(&raw))
    }

    #[instrument(skip(self))]
    pub async fn observability(&self, name: &str) -> SpaceResult<SpaceObservability> {
        let info = self.manager.resolve(name).await?;
        let raw = self
            .manager
            .runtime()
            .stats(&info.name)
            .await
            .map_err(|e| SpaceError::runtime(name, e))?;
        let mut out = SpaceObservability {
            stats: space_stats(&raw),
            workspace_disk: None,
            workspace_size_bytes: None,
            top: Vec::new(),
            history_tail: None,
        };
        if info.state != ContainerState::Running {
            debug!(space = %name, state = ?info.state, "skipping in-space readings");
            return Ok(out);
        }

        let rt = &self.manager.config().runtime;
        let mount = rt.workspace_mount.clone();
        let (disk, top, history) = tokio::join!(
            self.read(&info.name, DISK_SCRIPT, vec![mount.clone()]),
            self.read(&info.name, TOP_SCRIPT, vec![TOP_LIMIT.to_string()]),
            self.read(
                &info.name,
                HISTORY_SCRIPT,
                vec![
                    mount.clone(),
                    self.manager.config().history.file.clone(),
                    HISTORY_TAIL_LINES.to_string(),
                ],
            ),
        );

        if let Some(raw) = disk {
            (out.workspace_disk, out.workspace_size_bytes) = parse_disk(&mount, &raw);
        }
        out.top = top.map(|raw| parse_top(&raw)).unwrap_or_default();
        out.history_tail = history
            .map(|raw| raw.trim().to_string())
            .filter(|tail| !tail.is_empty());
        Ok(out)
    }

    /// Stdout of `script` when it exits zero. Failures only lose the reading.
    async fn read(&self, container: &str, script: &str, args: Vec<String>) -> Option<String> {
        let rt = &self.manager.config().runtime;
        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
        ];
        argv.extend(args);
        let spec = ExecSpec {
            argv,
            user: Some(rt.user.clone()),
            working_dir: Some(rt.workspace_mount.clone()),
            ..Default::default()
        };
        match collect(self.manager.runtime(), container, &spec).await {
            Ok((out, 0)) => Some(out.stdout_lossy()),
            Ok((out, code)) => {
                debug!(container, exit_code = code, stderr = %out.stderr_lossy().trim(), "in-space reading failed");
                None
            }
            Err(e) => {
                debug!(container, error = %e, "in-space reading failed");
                None
            }
        }
    }
}
