use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal width used when an attach request carries no size.
pub const DEFAULT_TERMINAL_COLS: u16 = 80;

/// Terminal height used when an attach request carries no size.
pub const DEFAULT_TERMINAL_ROWS: u16 = 24;

/// Default byte budget for a single workspace file read (256 KiB).
pub const DEFAULT_READ_BUDGET: u64 = 256 * 1024;

// ---------------------------------------------------------------------------
// Space lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status of a space as observed from the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceStatus {
    Creating,
    Running,
    Paused,
    Stopped,
    Destroyed,
}

impl std::fmt::Display for SpaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Outbound network posture of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// No network interface besides loopback.
    Isolated,
    /// Dedicated bridge whose egress passes through the host block-list.
    GatewayFiltered,
    /// The engine's default bridge, unfiltered.
    Open,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Isolated => write!(f, "isolated"),
            Self::GatewayFiltered => write!(f, "gateway-filtered"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Policy overrides a client may supply at create time. Unset fields take
/// the daemon's configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable_rootfs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_ranges: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSpaceRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Memory limit such as `"2g"`, `"512m"` or `"1024k"`. A bare number is MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyRequest>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Security policy attached to a space, as reported back to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub writable_rootfs: bool,
    pub network: NetworkMode,
    pub blocked_ranges: Vec<String>,
    pub max_memory_bytes: u64,
    pub max_cpus: f64,
    pub pids_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub name: String,
    pub id: String,
    pub status: SpaceStatus,
    pub image: String,
    pub memory_bytes: u64,
    pub cpus: f64,
    pub volume: String,
    pub mountpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

/// A command to run inside a space: either a shell string or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    /// Canonical argv. Shell strings run through `sh -c`.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Self::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
            Self::Argv(argv) => argv.clone(),
        }
    }

    /// True when there is nothing to run.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Shell(line) => line.trim().is_empty(),
            Self::Argv(argv) => argv.first().is_none_or(|arg| arg.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: CommandSpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

// ---------------------------------------------------------------------------
// Workspace files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Path relative to the workspace root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
    pub mtime_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content_base64: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content_base64: String,
}

// ---------------------------------------------------------------------------
// Resource usage
// ---------------------------------------------------------------------------

/// One engine sample of a space's resource usage. Counters are cumulative
/// since the container started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pids: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDisk {
    pub path: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub avail_bytes: u64,
    pub used_percent: f64,
}

/// A process from the space's top-by-CPU snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub cpu: f64,
    pub mem: f64,
    pub etime: String,
    pub command: String,
}

/// Stats plus what can only be read from inside a running space. The
/// in-space fields are empty when the space is not running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceObservability {
    pub stats: SpaceStats,
    pub workspace_disk: Option<WorkspaceDisk>,
    pub workspace_size_bytes: Option<u64>,
    pub top: Vec<ProcessSample>,
    pub history_tail: Option<String>,
}

// ---------------------------------------------------------------------------
// Terminal channel
// ---------------------------------------------------------------------------

/// Structured control message sent by a terminal client as JSON text.
///
/// Text frames that do not parse as one of these are treated as raw input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMessage {
    Input(String),
    Resize { cols: u16, rows: u16 },
    Ping(serde_json::Value),
}

/// Structured message sent by the daemon as JSON text. Terminal output
/// itself travels as binary frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMessage {
    Pong {},
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}
