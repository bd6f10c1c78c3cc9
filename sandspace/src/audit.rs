//! Append-only JSONL audit trail.
//!
//! Producers call [`AuditSink::record`], which never blocks: events go onto a
//! bounded queue and are dropped (and counted) when it is full. A single
//! background writer drains the queue into the audit file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AuditConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    #[serde(rename = "space.create")]
    SpaceCreate,
    #[serde(rename = "space.start")]
    SpaceStart,
    #[serde(rename = "space.pause")]
    SpacePause,
    #[serde(rename = "space.destroy")]
    SpaceDestroy,
    #[serde(rename = "space.exec")]
    SpaceExec,
    #[serde(rename = "space.shell")]
    SpaceShell,
    #[serde(rename = "file.write")]
    FileWrite,
    #[serde(rename = "terminal.open")]
    TerminalOpen,
    #[serde(rename = "terminal.close")]
    TerminalClose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub event: AuditKind,
    pub space: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

/// Cheap, cloneable producer handle.
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEvent>>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sink plus the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn record(&self, event: AuditKind, space: &str, detail: serde_json::Value) {
        let Some(tx) = &self.tx else {
            return;
        };
        let ev = AuditEvent {
            ts: Utc::now(),
            event,
            space: space.to_string(),
            detail,
        };
        if let Err(e) = tx.try_send(ev) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "audit event dropped");
        }
    }

    /// Events dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Background writer owning the receiving end of the audit queue.
pub struct AuditWriter {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl AuditWriter {
    /// Start the writer for `config`. Returns a disabled sink when auditing is off.
    pub fn spawn(config: &AuditConfig) -> (AuditSink, Option<AuditWriter>) {
        if !config.enabled {
            return (AuditSink::disabled(), None);
        }
        let (sink, rx) = AuditSink::channel(config.queue_capacity);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let path = config.path.clone();
        let handle = tokio::spawn(drain(path, rx, shutdown_rx));
        (sink, Some(AuditWriter { handle, shutdown }))
    }

    /// Stop accepting events, flush what is queued, and wait for the writer.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "audit writer task failed");
        }
    }
}

async fn open_log(path: &PathBuf) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating audit directory {}", parent.display()))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening audit log {}", path.display()))
}

async fn write_event(file: &mut tokio::fs::File, ev: &AuditEvent) -> Result<()> {
    let mut line = serde_json::to_vec(ev)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    Ok(())
}

async fn drain(
    path: PathBuf,
    mut rx: mpsc::Receiver<AuditEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut file = match open_log(&path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(error = %e, "audit log unavailable, events will be discarded");
            None
        }
    };
    info!(path = %path.display(), "audit writer started");

    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => {
                    if let Some(f) = file.as_mut() {
                        if let Err(e) = write_event(f, &ev).await {
                            warn!(error = %e, "failed to write audit event");
                        }
                    }
                }
                None => break,
            },
            _ = &mut shutdown => {
                rx.close();
                while let Some(ev) = rx.recv().await {
                    if let Some(f) = file.as_mut() {
                        if let Err(e) = write_event(f, &ev).await {
                            warn!(error = %e, "failed to write audit event");
                        }
                    }
                }
                break;
            }
        }
    }

    if let Some(f) = file.as_mut() {
        if let Err(e) = f.flush().await {
            warn!(error = %e, "failed to flush audit log");
        }
    }
    debug!("audit writer stopped");
}
