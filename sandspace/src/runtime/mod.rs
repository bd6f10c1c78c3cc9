//! The seam between sandspace and the container engine.
//!
//! Everything above this module talks to [`ContainerRuntime`]; the Docker
//! Engine implementation lives in [`docker`], and tests use the in-memory
//! engine in `fake`.

pub mod docker;
#[cfg(test)]
pub mod fake;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::exec::frame::Frame;

pub use docker::DockerRuntime;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} not found")]
    NotFound(String),

    /// Engine rejected or failed an operation. `message` is the engine's text, verbatim.
    #[error("{op} failed: {message}")]
    Engine {
        op: &'static str,
        status: Option<u16>,
        message: String,
    },

    #[error("egress filter: {0}")]
    Firewall(String),

    #[error("exec stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Container state as reported by the engine. A paused container is also
/// "running" in engine terms; [`ContainerState::from_flags`] gives paused precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Exited,
}

impl ContainerState {
    pub fn from_flags(running: bool, paused: bool, created: bool) -> Self {
        if paused {
            Self::Paused
        } else if running {
            Self::Running
        } else if created {
            Self::Created
        } else {
            Self::Exited
        }
    }
}

/// Live view of one container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub memory_bytes: u64,
    pub nano_cpus: i64,
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create a container. Built by the policy composer
/// for spaces and by the volume helpers for short-lived jobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub hostname: Option<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<VolumeMount>,
    /// `none`, `bridge`, or a named network.
    pub network_mode: Option<String>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub pids_limit: Option<i64>,
    pub readonly_rootfs: bool,
    /// Mount point to tmpfs options, e.g. `/tmp` to `rw,noexec,nosuid,nodev,size=512m`.
    pub tmpfs: HashMap<String, String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub restart_unless_stopped: bool,
}

/// A process to start inside a running container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
}

/// CPU counters from one side of a stats sample, in engine units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub total_usage: u64,
    pub system_usage: u64,
    pub online_cpus: u32,
}

/// A single stats sample. `precpu` is the engine's previous reading, so the
/// pair gives a CPU rate without a second request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub cpu: CpuCounters,
    pub precpu: CpuCounters,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub pids: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

pub type FrameStream = Pin<Box<dyn Stream<Item = RuntimeResult<Frame>> + Send>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = RuntimeResult<Bytes>> + Send>>;
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Output of a non-interactive exec. The stream ends when the process exits.
pub struct ExecOutput {
    pub exec_id: String,
    pub frames: FrameStream,
}

/// A started interactive process: raw TTY output plus a stdin writer.
pub struct InteractiveExec {
    pub exec_id: String,
    pub output: ByteStream,
    pub input: InputSink,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers whose labels contain every `key=value` pair in `labels`.
    async fn list(&self, labels: &[(&str, &str)]) -> RuntimeResult<Vec<ContainerInfo>>;
    async fn inspect(&self, name: &str) -> RuntimeResult<ContainerInfo>;

    async fn volume_exists(&self, name: &str) -> RuntimeResult<bool>;
    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> RuntimeResult<()>;
    async fn remove_volume(&self, name: &str) -> RuntimeResult<()>;

    /// Create the bridge network `name` with host interface `bridge_interface` if absent.
    async fn ensure_network(&self, name: &str, bridge_interface: &str) -> RuntimeResult<()>;

    /// Create a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start(&self, name: &str) -> RuntimeResult<()>;
    async fn pause(&self, name: &str) -> RuntimeResult<()>;
    async fn unpause(&self, name: &str) -> RuntimeResult<()>;
    async fn remove(&self, name: &str, force: bool) -> RuntimeResult<()>;
    /// Wait for the container to stop and return its exit code.
    async fn wait(&self, name: &str) -> RuntimeResult<i64>;
    /// Combined stdout/stderr of a container, lossily decoded.
    async fn logs(&self, name: &str) -> RuntimeResult<String>;
    /// One resource-usage sample.
    async fn stats(&self, name: &str) -> RuntimeResult<ContainerStats>;

    async fn exec(&self, container: &str, spec: &ExecSpec) -> RuntimeResult<ExecOutput>;
    /// Exit code of a finished exec. `None` while still running.
    async fn exec_exit_code(&self, exec_id: &str) -> RuntimeResult<Option<i64>>;
    async fn exec_interactive(&self, container: &str, spec: &ExecSpec) -> RuntimeResult<InteractiveExec>;
    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> RuntimeResult<()>;
}
