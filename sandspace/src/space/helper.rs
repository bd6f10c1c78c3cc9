//! Short-lived helper containers that operate on a space's volume with the
//! network disabled.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::policy::{LABEL_KIND, LABEL_SPACE};
use crate::config::RuntimeConfig;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeResult, VolumeMount};

#[derive(Debug, Clone)]
pub struct HelperOutcome {
    pub exit_code: i64,
    pub logs: String,
}

/// Describe a helper that runs `script` under `sh -c` with `args` as `$1..`.
pub fn helper_spec(
    rt: &RuntimeConfig,
    kind: &str,
    space: &str,
    user: &str,
    read_only: bool,
    script: &str,
    args: &[String],
) -> ContainerSpec {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let mut cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        "sh".to_string(),
    ];
    cmd.extend(args.iter().cloned());

    let mut labels = HashMap::new();
    labels.insert(LABEL_KIND.to_string(), kind.to_string());
    labels.insert(LABEL_SPACE.to_string(), space.to_string());

    ContainerSpec {
        name: format!("{}{}-{}-{}", rt.container_prefix, kind, space, &suffix[..8]),
        image: rt.helper_image.clone(),
        cmd,
        user: Some(user.to_string()),
        labels,
        mounts: vec![VolumeMount {
            volume: rt.volume_name(space),
            target: rt.workspace_mount.clone(),
            read_only,
        }],
        network_mode: Some("none".into()),
        ..Default::default()
    }
}

/// Create, start and wait for a helper, then collect its logs. The helper is
/// force-removed on every path once it has been created.
pub async fn run_helper(
    runtime: &dyn ContainerRuntime,
    spec: &ContainerSpec,
) -> RuntimeResult<HelperOutcome> {
    runtime.create(spec).await?;

    let result = async {
        runtime.start(&spec.name).await?;
        let exit_code = runtime.wait(&spec.name).await?;
        let logs = runtime.logs(&spec.name).await.unwrap_or_default();
        Ok::<_, RuntimeError>(HelperOutcome { exit_code, logs })
    }
    .await;

    if let Err(e) = runtime.remove(&spec.name, true).await {
        warn!(helper = %spec.name, error = %e, "failed to remove helper container");
    }

    if let Ok(outcome) = &result {
        debug!(
            helper = %spec.name,
            exit_code = outcome.exit_code,
            logs = %outcome.logs.trim(),
            "helper finished"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;

    #[test]
    fn helper_spec_shape() {
        let rt = RuntimeConfig::default();
        let spec = helper_spec(
            &rt,
            "volume-init",
            "demo",
            "0:0",
            false,
            "echo \"$1\"",
            &["/workspace".to_string()],
        );
        assert!(spec.name.starts_with("sandspace-volume-init-demo-"));
        assert_eq!(spec.cmd, vec!["sh", "-c", "echo \"$1\"", "sh", "/workspace"]);
        assert_eq!(spec.network_mode.as_deref(), Some("none"));
        assert_eq!(spec.mounts[0].volume, "sandspace-vol-demo");
        assert_eq!(spec.labels.get(LABEL_KIND).map(String::as_str), Some("volume-init"));
    }

    #[tokio::test]
    async fn helper_removed_after_failure() {
        let runtime = FakeRuntime::new();
        runtime.on_helper(|_| (3, "boom".into()));
        let spec = helper_spec(&RuntimeConfig::default(), "volume-init", "demo", "0:0", false, "exit 3", &[]);

        let outcome = run_helper(&runtime, &spec).await.unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.logs, "boom");
        assert!(runtime.containers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn helper_removed_after_start_error() {
        let runtime = FakeRuntime::new();
        let spec = helper_spec(&RuntimeConfig::default(), "volume-init", "demo", "0:0", false, "true", &[]);
        runtime.fail_start.lock().unwrap().insert(spec.name.clone());

        assert!(run_helper(&runtime, &spec).await.is_err());
        assert!(runtime.containers.lock().unwrap().is_empty());
    }
}
