use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCpuStats, ContainerCreateBody, ContainerInspectResponse, ContainerStatsResponse,
    HostConfig, Mount, MountTypeEnum, NetworkCreateRequest, RestartPolicy, RestartPolicyNameEnum,
    VolumeCreateOptions,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, InspectNetworkOptions,
    ListContainersOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    RemoveVolumeOptionsBuilder, StartContainerOptions, StatsOptionsBuilder,
    WaitContainerOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, instrument};

use super::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats, CpuCounters,
    ExecOutput, ExecSpec, InteractiveExec, RuntimeError, RuntimeResult,
};
use crate::exec::frame::{Frame, StreamKind};

const DOCKER_TIMEOUT_SECS: u64 = 120;

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `socket`, or to the local defaults (`DOCKER_HOST`, then the
    /// unix socket) when `socket` is empty.
    pub fn connect(socket: &str) -> RuntimeResult<Self> {
        let docker = if socket.is_empty() {
            Docker::connect_with_local_defaults()
        } else {
            Docker::connect_with_socket(socket, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        .map_err(|e| engine_error("connect", socket, e))?;
        Ok(Self { docker })
    }

    /// Round-trip to the engine; used by `sandspace check` and at startup.
    pub async fn ping(&self) -> RuntimeResult<String> {
        self.docker
            .ping()
            .await
            .map_err(|e| engine_error("ping", "engine", e))?;
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| engine_error("version", "engine", e))?;
        Ok(version.version.unwrap_or_else(|| "unknown".into()))
    }
}

fn engine_error(op: &'static str, target: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(target.to_string()),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Engine {
            op,
            status: Some(status_code),
            message,
        },
        other => RuntimeError::Engine {
            op,
            status: None,
            message: other.to_string(),
        },
    }
}

/// Parse an engine timestamp. The engine reports the zero time for
/// containers that never started.
pub(crate) fn parse_engine_time(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() || raw.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn cpu_counters(stats: Option<ContainerCpuStats>) -> CpuCounters {
    let stats = stats.unwrap_or_default();
    let usage = stats.cpu_usage.unwrap_or_default();
    // Older engines only report per-CPU usage.
    let online_cpus = stats
        .online_cpus
        .filter(|n| *n > 0)
        .or_else(|| {
            usage
                .percpu_usage
                .as_ref()
                .map(|per| per.len() as u32)
                .filter(|n| *n > 0)
        })
        .unwrap_or(1);
    CpuCounters {
        total_usage: usage.total_usage.unwrap_or(0),
        system_usage: stats.system_cpu_usage.unwrap_or(0),
        online_cpus,
    }
}

fn container_stats(resp: ContainerStatsResponse) -> ContainerStats {
    let memory = resp.memory_stats.unwrap_or_default();
    let (network_rx, network_tx) = resp
        .networks
        .unwrap_or_default()
        .values()
        .fold((0, 0), |(rx, tx), n| {
            (rx + n.rx_bytes.unwrap_or(0), tx + n.tx_bytes.unwrap_or(0))
        });
    let (mut block_read, mut block_write) = (0, 0);
    let blkio = resp
        .blkio_stats
        .and_then(|b| b.io_service_bytes_recursive)
        .unwrap_or_default();
    for entry in blkio {
        let value = entry.value.unwrap_or(0);
        match entry.op.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("read") => block_read += value,
            Some("write") => block_write += value,
            _ => {}
        }
    }

    ContainerStats {
        cpu: cpu_counters(resp.cpu_stats),
        precpu: cpu_counters(resp.precpu_stats),
        memory_usage: memory.usage.unwrap_or(0),
        memory_limit: memory.limit.unwrap_or(0),
        pids: resp.pids_stats.and_then(|p| p.current).unwrap_or(0),
        network_rx,
        network_tx,
        block_read,
        block_write,
    }
}

fn container_info(resp: ContainerInspectResponse) -> ContainerInfo {
    let state = resp.state.unwrap_or_default();
    let config = resp.config.unwrap_or_default();
    let host = resp.host_config.unwrap_or_default();
    let created_flag = matches!(
        state.status,
        Some(bollard::models::ContainerStateStatusEnum::CREATED)
    );

    ContainerInfo {
        id: resp.id.unwrap_or_default(),
        name: resp
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image: config.image.unwrap_or_default(),
        state: ContainerState::from_flags(
            state.running.unwrap_or(false),
            state.paused.unwrap_or(false),
            created_flag,
        ),
        labels: config.labels.unwrap_or_default(),
        created_at: resp.created.as_deref().and_then(parse_engine_time),
        started_at: state.started_at.as_deref().and_then(parse_engine_time),
        memory_bytes: host.memory.unwrap_or(0).max(0) as u64,
        nano_cpus: host.nano_cpus.unwrap_or(0),
        user: config.user.filter(|u| !u.is_empty()),
    }
}

fn log_frame(output: LogOutput) -> Frame {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => Frame {
            stream: StreamKind::Stdout,
            payload: message,
        },
        LogOutput::StdErr { message } => Frame {
            stream: StreamKind::Stderr,
            payload: message,
        },
        LogOutput::StdIn { message } => Frame {
            stream: StreamKind::Stdin,
            payload: message,
        },
    }
}

fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let mounts = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: Some(m.volume.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let host_config = HostConfig {
        mounts: (!mounts.is_empty()).then_some(mounts),
        network_mode: spec.network_mode.clone(),
        memory: spec.memory_bytes,
        nano_cpus: spec.nano_cpus,
        pids_limit: spec.pids_limit,
        readonly_rootfs: Some(spec.readonly_rootfs),
        tmpfs: (!spec.tmpfs.is_empty()).then(|| spec.tmpfs.clone()),
        cap_drop: (!spec.cap_drop.is_empty()).then(|| spec.cap_drop.clone()),
        security_opt: (!spec.security_opt.is_empty()).then(|| spec.security_opt.clone()),
        restart_policy: spec.restart_unless_stopped.then_some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        ..HostConfig::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        user: spec.user.clone(),
        working_dir: spec.working_dir.clone(),
        hostname: spec.hostname.clone(),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
        host_config: Some(host_config),
        ..ContainerCreateBody::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self, labels: &[(&str, &str)]) -> RuntimeResult<Vec<ContainerInfo>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert(
            "label".into(),
            labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
        );
        let summaries = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(|e| engine_error("list_containers", "containers", e))?;

        let mut out = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.inspect(&id).await {
                Ok(info) => out.push(info),
                // Removed between list and inspect.
                Err(RuntimeError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn inspect(&self, name: &str) -> RuntimeResult<ContainerInfo> {
        let resp = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| engine_error("inspect_container", name, e))?;
        Ok(container_info(resp))
    }

    async fn volume_exists(&self, name: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) => match engine_error("inspect_volume", name, e) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self, labels))]
    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> RuntimeResult<()> {
        self.docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            })
            .await
            .map_err(|e| engine_error("create_volume", name, e))?;
        debug!(volume = %name, "volume created");
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptionsBuilder::new().force(true).build()))
            .await
            .map_err(|e| engine_error("remove_volume", name, e))
    }

    #[instrument(skip(self))]
    async fn ensure_network(&self, name: &str, bridge_interface: &str) -> RuntimeResult<()> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => match engine_error("inspect_network", name, e) {
                RuntimeError::NotFound(_) => {}
                other => return Err(other),
            },
        }

        let mut options = HashMap::new();
        options.insert(
            "com.docker.network.bridge.name".to_string(),
            bridge_interface.to_string(),
        );
        let mut labels = HashMap::new();
        labels.insert("sandspace.kind".to_string(), "egress-network".to_string());

        self.docker
            .create_network(NetworkCreateRequest {
                name: name.to_string(),
                driver: Some("bridge".into()),
                options: Some(options),
                labels: Some(labels),
                ..Default::default()
            })
            .await
            .map_err(|e| engine_error("create_network", name, e))?;
        info!(network = %name, interface = %bridge_interface, "filtered network created");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let resp = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                create_body(spec),
            )
            .await
            .map_err(|e| match engine_error("create_container", &spec.name, e) {
                // A missing image is a 404 on create; keep the engine's message.
                RuntimeError::NotFound(target) => RuntimeError::Engine {
                    op: "create_container",
                    status: Some(404),
                    message: format!("image {} not found for {}", spec.image, target),
                },
                other => other,
            })?;
        Ok(resp.id)
    }

    async fn start(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(|e| engine_error("start_container", name, e))
    }

    async fn pause(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .pause_container(name)
            .await
            .map_err(|e| engine_error("pause_container", name, e))
    }

    async fn unpause(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .unpause_container(name)
            .await
            .map_err(|e| engine_error("unpause_container", name, e))
    }

    async fn remove(&self, name: &str, force: bool) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(force).build()),
            )
            .await
            .map_err(|e| engine_error("remove_container", name, e))
    }

    async fn wait(&self, name: &str) -> RuntimeResult<i64> {
        let mut stream = self.docker.wait_container(
            name,
            Some(WaitContainerOptionsBuilder::new().condition("not-running").build()),
        );
        match stream.next().await {
            Some(Ok(resp)) => Ok(resp.status_code),
            // Non-zero exits arrive as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(engine_error("wait_container", name, e)),
            None => Err(RuntimeError::Engine {
                op: "wait_container",
                status: None,
                message: "wait stream ended without a status".into(),
            }),
        }
    }

    async fn logs(&self, name: &str) -> RuntimeResult<String> {
        let chunks: Vec<LogOutput> = self
            .docker
            .logs(
                name,
                Some(LogsOptionsBuilder::new().stdout(true).stderr(true).build()),
            )
            .try_collect()
            .await
            .map_err(|e| engine_error("logs", name, e))?;
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&chunk.into_bytes());
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    #[instrument(skip(self))]
    async fn stats(&self, name: &str) -> RuntimeResult<ContainerStats> {
        let mut stream = self.docker.stats(
            name,
            Some(StatsOptionsBuilder::new().stream(false).build()),
        );
        match stream.next().await {
            Some(Ok(resp)) => Ok(container_stats(resp)),
            Some(Err(e)) => Err(engine_error("stats", name, e)),
            None => Err(RuntimeError::Engine {
                op: "stats",
                status: None,
                message: "stats stream ended without a sample".into(),
            }),
        }
    }

    async fn exec(&self, container: &str, spec: &ExecSpec) -> RuntimeResult<ExecOutput> {
        let exec_id = self.create_exec(container, spec).await?;
        let started = self
            .docker
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty: spec.tty,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| engine_error("start_exec", container, e))?;

        match started {
            StartExecResults::Attached { output, .. } => {
                let frames = output
                    .map(|item| {
                        item.map(log_frame)
                            .map_err(|e| RuntimeError::Stream(e.to_string()))
                    })
                    .boxed();
                Ok(ExecOutput { exec_id, frames })
            }
            StartExecResults::Detached => Err(RuntimeError::Engine {
                op: "start_exec",
                status: None,
                message: "exec started detached".into(),
            }),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> RuntimeResult<Option<i64>> {
        let resp = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| engine_error("inspect_exec", exec_id, e))?;
        if resp.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(resp.exit_code)
    }

    async fn exec_interactive(
        &self,
        container: &str,
        spec: &ExecSpec,
    ) -> RuntimeResult<InteractiveExec> {
        let exec_id = self.create_exec(container, spec).await?;
        let started = self
            .docker
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| engine_error("start_exec", container, e))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map(|item| {
                        item.map(LogOutput::into_bytes)
                            .map_err(|e| RuntimeError::Stream(e.to_string()))
                    })
                    .boxed();
                Ok(InteractiveExec {
                    exec_id,
                    output,
                    input,
                })
            }
            StartExecResults::Detached => Err(RuntimeError::Engine {
                op: "start_exec",
                status: None,
                message: "interactive exec started detached".into(),
            }),
        }
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> RuntimeResult<()> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| engine_error("resize_exec", exec_id, e))
    }
}

impl DockerRuntime {
    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> RuntimeResult<String> {
        let created = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    attach_stdin: Some(spec.stdin),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(spec.tty),
                    cmd: Some(spec.argv.clone()),
                    env: (!spec.env.is_empty()).then(|| spec.env.clone()),
                    user: spec.user.clone(),
                    working_dir: spec.working_dir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| engine_error("create_exec", container, e))?;
        Ok(created.id)
    }
}
