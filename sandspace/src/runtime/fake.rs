//! In-memory [`ContainerRuntime`] for tests.
//!
//! Models the engine behaviors the manager depends on: pause/unpause reject
//! the wrong state with a 409, exec into a paused container fails, helper
//! containers exit with a scripted code, and interactive execs echo stdin.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::AsyncReadExt;

use super::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats, ExecOutput,
    ExecSpec, InteractiveExec, RuntimeError, RuntimeResult,
};
use crate::exec::frame::Frame;

type HelperFn = Box<dyn FnMut(&ContainerSpec) -> (i64, String) + Send>;
type ExecFn = Box<dyn FnMut(&str, &ExecSpec) -> FakeExec + Send>;
type OutputRx = futures::channel::mpsc::UnboundedReceiver<RuntimeResult<Bytes>>;
pub type OutputTx = futures::channel::mpsc::UnboundedSender<RuntimeResult<Bytes>>;

/// Scripted result of a non-interactive exec.
#[derive(Debug, Clone, Default)]
pub struct FakeExec {
    pub frames: Vec<Frame>,
    pub exit_code: i64,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub logs: String,
}

pub struct FakeRuntime {
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pub volumes: Mutex<HashSet<String>>,
    pub networks: Mutex<HashSet<String>>,
    /// Every mutating call, as `op:target`.
    pub calls: Mutex<Vec<String>>,
    pub execs: Mutex<Vec<(String, ExecSpec)>>,
    pub resizes: Mutex<Vec<(String, u16, u16)>>,
    pub fail_start: Mutex<HashSet<String>>,
    /// Containers that disappear just before their next start, pause,
    /// unpause, remove or exec.
    pub vanish: Mutex<HashSet<String>>,
    /// Returned by `stats` for every known container.
    pub stats: Mutex<ContainerStats>,
    helper: Mutex<HelperFn>,
    exec_handler: Mutex<ExecFn>,
    exec_results: Mutex<HashMap<String, i64>>,
    stalled_terminal: Mutex<Option<OutputRx>>,
    held_stdin: Mutex<Vec<tokio::io::DuplexStream>>,
    next_id: Mutex<u64>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            volumes: Mutex::new(HashSet::new()),
            networks: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            fail_start: Mutex::new(HashSet::new()),
            vanish: Mutex::new(HashSet::new()),
            stats: Mutex::new(ContainerStats::default()),
            helper: Mutex::new(Box::new(|_| (0, String::new()))),
            exec_handler: Mutex::new(Box::new(|_, _| FakeExec::default())),
            exec_results: Mutex::new(HashMap::new()),
            stalled_terminal: Mutex::new(None),
            held_stdin: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }
}

fn conflict(op: &'static str, message: String) -> RuntimeError {
    RuntimeError::Engine {
        op,
        status: Some(409),
        message,
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the exit code and log output of helper containers. Called once per helper start.
    pub fn on_helper(&self, f: impl FnMut(&ContainerSpec) -> (i64, String) + Send + 'static) {
        *self.helper.lock().unwrap() = Box::new(f);
    }

    /// Script the output of non-interactive execs.
    pub fn on_exec(&self, f: impl FnMut(&str, &ExecSpec) -> FakeExec + Send + 'static) {
        *self.exec_handler.lock().unwrap() = Box::new(f);
    }

    /// The next interactive exec never reads its stdin; its output is driven
    /// through the returned sender.
    pub fn stall_next_terminal(&self) -> OutputTx {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        *self.stalled_terminal.lock().unwrap() = Some(rx);
        tx
    }

    pub fn state_of(&self, name: &str) -> Option<ContainerState> {
        self.containers.lock().unwrap().get(name).map(|c| c.state)
    }

    pub fn set_started_at(&self, name: &str, at: DateTime<Utc>) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(name) {
            c.started_at = Some(at);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, target: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", op, target));
        if self.vanish.lock().unwrap().remove(target) {
            self.containers.lock().unwrap().remove(target);
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut n = self.next_id.lock().unwrap();
        *n += 1;
        format!("{}{:012x}", prefix, *n)
    }

    fn lookup<'a>(
        containers: &'a mut HashMap<String, FakeContainer>,
        name: &str,
    ) -> RuntimeResult<&'a mut FakeContainer> {
        if containers.contains_key(name) {
            return containers
                .get_mut(name)
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()));
        }
        containers
            .values_mut()
            .find(|c| c.id == name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    fn info(c: &FakeContainer) -> ContainerInfo {
        ContainerInfo {
            id: c.id.clone(),
            name: c.spec.name.clone(),
            image: c.spec.image.clone(),
            state: c.state,
            labels: c.spec.labels.clone(),
            created_at: Some(c.created_at),
            started_at: c.started_at,
            memory_bytes: c.spec.memory_bytes.unwrap_or(0) as u64,
            nano_cpus: c.spec.nano_cpus.unwrap_or(0),
            user: c.spec.user.clone(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list(&self, labels: &[(&str, &str)]) -> RuntimeResult<Vec<ContainerInfo>> {
        let containers = self.containers.lock().unwrap();
        let mut out: Vec<ContainerInfo> = containers
            .values()
            .filter(|c| {
                labels
                    .iter()
                    .all(|(k, v)| c.spec.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(Self::info)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn inspect(&self, name: &str) -> RuntimeResult<ContainerInfo> {
        let mut containers = self.containers.lock().unwrap();
        let c = Self::lookup(&mut containers, name)?;
        Ok(Self::info(c))
    }

    async fn volume_exists(&self, name: &str) -> RuntimeResult<bool> {
        Ok(self.volumes.lock().unwrap().contains(name))
    }

    async fn create_volume(&self, name: &str, _labels: HashMap<String, String>) -> RuntimeResult<()> {
        self.record("create_volume", name);
        self.volumes.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        self.record("remove_volume", name);
        if self.volumes.lock().unwrap().remove(name) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_string()))
        }
    }

    async fn ensure_network(&self, name: &str, _bridge_interface: &str) -> RuntimeResult<()> {
        self.networks.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.record("create", &spec.name);
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(conflict(
                "create_container",
                format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            ));
        }
        let id = self.next_id("c");
        containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                state: ContainerState::Created,
                created_at: Utc::now(),
                started_at: None,
                exit_code: None,
                logs: String::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, name: &str) -> RuntimeResult<()> {
        self.record("start", name);
        if self.fail_start.lock().unwrap().contains(name) {
            return Err(RuntimeError::Engine {
                op: "start_container",
                status: Some(500),
                message: "simulated start failure".into(),
            });
        }
        let is_helper = {
            let mut containers = self.containers.lock().unwrap();
            let c = Self::lookup(&mut containers, name)?;
            c.state = ContainerState::Running;
            c.started_at = Some(Utc::now());
            c.spec.labels.get("sandspace.kind").map(String::as_str) != Some("space")
        };
        if is_helper {
            let spec = {
                let mut containers = self.containers.lock().unwrap();
                Self::lookup(&mut containers, name)?.spec.clone()
            };
            let (code, logs) = {
                let mut helper = self.helper.lock().unwrap();
                (&mut *helper)(&spec)
            };
            let mut containers = self.containers.lock().unwrap();
            let c = Self::lookup(&mut containers, name)?;
            c.state = ContainerState::Exited;
            c.exit_code = Some(code);
            c.logs = logs;
        }
        Ok(())
    }

    async fn pause(&self, name: &str) -> RuntimeResult<()> {
        self.record("pause", name);
        let mut containers = self.containers.lock().unwrap();
        let c = Self::lookup(&mut containers, name)?;
        match c.state {
            ContainerState::Running => {
                c.state = ContainerState::Paused;
                Ok(())
            }
            ContainerState::Paused => Err(conflict(
                "pause_container",
                format!("Container {} is already paused", c.id),
            )),
            _ => Err(conflict(
                "pause_container",
                format!("Container {} is not running", c.id),
            )),
        }
    }

    async fn unpause(&self, name: &str) -> RuntimeResult<()> {
        self.record("unpause", name);
        let mut containers = self.containers.lock().unwrap();
        let c = Self::lookup(&mut containers, name)?;
        if c.state != ContainerState::Paused {
            return Err(conflict(
                "unpause_container",
                format!("Container {} is not paused", c.id),
            ));
        }
        c.state = ContainerState::Running;
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> RuntimeResult<()> {
        self.record("remove", name);
        let mut containers = self.containers.lock().unwrap();
        let key = {
            let c = Self::lookup(&mut containers, name)?;
            if !force && matches!(c.state, ContainerState::Running | ContainerState::Paused) {
                return Err(conflict(
                    "remove_container",
                    "You cannot remove a running container".into(),
                ));
            }
            c.spec.name.clone()
        };
        containers.remove(&key);
        Ok(())
    }

    async fn wait(&self, name: &str) -> RuntimeResult<i64> {
        let mut containers = self.containers.lock().unwrap();
        let c = Self::lookup(&mut containers, name)?;
        Ok(c.exit_code.unwrap_or(0))
    }

    async fn logs(&self, name: &str) -> RuntimeResult<String> {
        let mut containers = self.containers.lock().unwrap();
        Ok(Self::lookup(&mut containers, name)?.logs.clone())
    }

    async fn stats(&self, name: &str) -> RuntimeResult<ContainerStats> {
        let mut containers = self.containers.lock().unwrap();
        Self::lookup(&mut containers, name)?;
        Ok(self.stats.lock().unwrap().clone())
    }

    async fn exec(&self, container: &str, spec: &ExecSpec) -> RuntimeResult<ExecOutput> {
        if self.vanish.lock().unwrap().remove(container) {
            self.containers.lock().unwrap().remove(container);
        }
        {
            let mut containers = self.containers.lock().unwrap();
            let c = Self::lookup(&mut containers, container)?;
            match c.state {
                ContainerState::Running => {}
                ContainerState::Paused => {
                    return Err(conflict(
                        "create_exec",
                        format!("Container {} is paused, unpause the container before exec", c.id),
                    ))
                }
                _ => {
                    return Err(conflict(
                        "create_exec",
                        format!("Container {} is not running", c.id),
                    ))
                }
            }
        }
        self.execs
            .lock()
            .unwrap()
            .push((container.to_string(), spec.clone()));
        let result = {
            let mut handler = self.exec_handler.lock().unwrap();
            (&mut *handler)(container, spec)
        };
        let exec_id = self.next_id("e");
        self.exec_results
            .lock()
            .unwrap()
            .insert(exec_id.clone(), result.exit_code);
        let frames = futures::stream::iter(result.frames.into_iter().map(Ok)).boxed();
        Ok(ExecOutput { exec_id, frames })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> RuntimeResult<Option<i64>> {
        self.exec_results
            .lock()
            .unwrap()
            .get(exec_id)
            .copied()
            .map(Some)
            .ok_or_else(|| RuntimeError::NotFound(exec_id.to_string()))
    }

    async fn exec_interactive(
        &self,
        container: &str,
        spec: &ExecSpec,
    ) -> RuntimeResult<InteractiveExec> {
        {
            let mut containers = self.containers.lock().unwrap();
            let c = Self::lookup(&mut containers, container)?;
            if c.state != ContainerState::Running {
                return Err(conflict(
                    "create_exec",
                    format!("Container {} is not running", c.id),
                ));
            }
        }
        self.execs
            .lock()
            .unwrap()
            .push((container.to_string(), spec.clone()));
        let exec_id = self.next_id("t");

        if let Some(output) = self.stalled_terminal.lock().unwrap().take() {
            let (client, server) = tokio::io::duplex(64);
            self.held_stdin.lock().unwrap().push(server);
            return Ok(InteractiveExec {
                exec_id,
                output: output.boxed(),
                input: Box::pin(client),
            });
        }

        // Echo whatever arrives on stdin back as TTY output.
        let (client, mut server) = tokio::io::duplex(4096);
        let (tx, rx) = futures::channel::mpsc::unbounded::<RuntimeResult<Bytes>>();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.unbounded_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(InteractiveExec {
            exec_id,
            output: rx.boxed(),
            input: Box::pin(client),
        })
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> RuntimeResult<()> {
        self.resizes
            .lock()
            .unwrap()
            .push((exec_id.to_string(), cols, rows));
        Ok(())
    }
}
