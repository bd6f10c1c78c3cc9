pub mod frame;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use sandspace_protocol::{ExecRequest, ExecResult};
use serde_json::json;
use tracing::{debug, instrument};

use crate::audit::AuditKind;
use crate::error::{SpaceError, SpaceResult};
use crate::runtime::{ContainerRuntime, ExecSpec, RuntimeError, RuntimeResult};
use crate::space::policy::env_list;
use crate::space::SpaceManager;

use self::frame::Demuxed;

/// Attempts at reading the exit status once the output stream has ended.
const EXIT_POLL_ATTEMPTS: u32 = 20;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One-shot command execution inside a space.
#[derive(Clone)]
pub struct ExecGateway {
    manager: Arc<SpaceManager>,
}

impl ExecGateway {
    pub fn new(manager: Arc<SpaceManager>) -> Self {
        Self { manager }
    }

    /// Run a command to completion and return its demultiplexed output.
    /// A paused space is resumed first.
    #[instrument(skip(self, req), fields(space = %name))]
    pub async fn exec(&self, name: &str, req: &ExecRequest) -> SpaceResult<ExecResult> {
        if req.command.is_empty() {
            return Err(SpaceError::InvalidRequest("command must not be empty".into()));
        }
        let argv = req.command.to_argv();

        let info = self.manager.ensure_running(name).await?;
        let started = Instant::now();
        let result = self.run(name, &info.name, argv.clone(), req).await;

        let metrics = self.manager.metrics();
        match &result {
            Ok(out) => {
                metrics.record_exec(started.elapsed(), Some(out.exit_code));
                self.manager.activity().touch(name);
                self.manager.audit().record(
                    AuditKind::SpaceExec,
                    name,
                    json!({
                        "argv": argv,
                        "exit_code": out.exit_code,
                        "duration_ms": started.elapsed().as_millis() as u64,
                    }),
                );
                debug!(space = %name, exit_code = out.exit_code, "exec finished");
            }
            Err(e) => {
                metrics.record_exec(started.elapsed(), None);
                metrics.record_error("exec");
                debug!(space = %name, error = %e, "exec failed");
            }
        }
        result
    }

    async fn run(&self, space: &str, container: &str, argv: Vec<String>, req: &ExecRequest) -> SpaceResult<ExecResult> {
        let rt = &self.manager.config().runtime;
        let spec = ExecSpec {
            argv,
            user: Some(rt.user.clone()),
            working_dir: Some(rt.workspace_mount.clone()),
            env: env_list(&req.env),
            tty: false,
            stdin: false,
        };

        let (demuxed, exit_code) = collect(self.manager.runtime(), container, &spec)
            .await
            .map_err(|e| SpaceError::runtime(space, e))?;
        Ok(ExecResult {
            stdout: demuxed.stdout_lossy(),
            stderr: demuxed.stderr_lossy(),
            exit_code,
        })
    }
}

/// Run `spec` in `container`, collecting demultiplexed output and the exit status.
pub(crate) async fn collect(
    runtime: &dyn ContainerRuntime,
    container: &str,
    spec: &ExecSpec,
) -> RuntimeResult<(Demuxed, i64)> {
    let mut output = runtime.exec(container, spec).await?;
    let mut demuxed = Demuxed::default();
    while let Some(frame) = output.frames.next().await {
        demuxed.push(&frame?);
    }
    let exit_code = exit_code(runtime, &output.exec_id).await?;
    Ok((demuxed, exit_code))
}

/// The engine may report the exec as running for a moment after its output
/// stream closes.
async fn exit_code(runtime: &dyn ContainerRuntime, exec_id: &str) -> RuntimeResult<i64> {
    for _ in 0..EXIT_POLL_ATTEMPTS {
        if let Some(code) = runtime.exec_exit_code(exec_id).await? {
            return Ok(code);
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    Err(RuntimeError::Stream(format!(
        "exec {} finished without an exit status",
        exec_id
    )))
}
