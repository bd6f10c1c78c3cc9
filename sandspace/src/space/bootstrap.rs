//! Workspace volume bootstrap.
//!
//! Fresh engine volumes are owned by root, so before a space's first start the
//! volume is chowned to the unprivileged sandbox identity (phase 1, as root)
//! and then proven writable by that identity (phase 2).

use tracing::{info, instrument, warn};

use super::helper::{helper_spec, run_helper};
use super::policy::KIND_VOLUME_INIT;
use crate::config::RuntimeConfig;
use crate::error::{SpaceError, SpaceResult};
use crate::runtime::ContainerRuntime;

pub const INIT_MARKER: &str = ".sandspace_init";
pub const VERIFY_MARKER: &str = ".sandspace_verify";

const PREPARE_SCRIPT: &str = r#"set -e
root="$1"; uid="$2"; gid="$3"
mkdir -p "$root"
chown -R "$uid:$gid" "$root"
chmod -R u+rwX,g+rwX "$root"
chmod 775 "$root"
touch "$root/.sandspace_init"
chown "$uid:$gid" "$root/.sandspace_init"
test "$(stat -c %u:%g "$root/.sandspace_init")" = "$uid:$gid"
"#;

const VERIFY_SCRIPT: &str = r#"set -e
root="$1"; uid="$2"
touch "$root/.sandspace_verify"
test -f "$root/.sandspace_verify"
test "$(stat -c %u "$root/.sandspace_verify")" = "$uid"
"#;

#[instrument(skip(runtime, rt))]
pub async fn bootstrap_volume(
    runtime: &dyn ContainerRuntime,
    rt: &RuntimeConfig,
    space: &str,
) -> SpaceResult<()> {
    let root = rt.workspace_mount.clone();
    let uid = rt.uid.to_string();
    let gid = rt.gid.to_string();
    let mut last_reason = String::new();

    for attempt in 1..=rt.bootstrap_attempts {
        let prepare = helper_spec(
            rt,
            KIND_VOLUME_INIT,
            space,
            "0:0",
            false,
            PREPARE_SCRIPT,
            &[root.clone(), uid.clone(), gid.clone()],
        );
        match run_helper(runtime, &prepare).await {
            Ok(out) if out.exit_code == 0 => {}
            Ok(out) => {
                last_reason = format!(
                    "ownership phase exited with {}: {}",
                    out.exit_code,
                    out.logs.trim()
                );
                warn!(space = %space, attempt, reason = %last_reason, "volume bootstrap attempt failed");
                continue;
            }
            Err(e) => {
                last_reason = format!("ownership phase: {}", e);
                warn!(space = %space, attempt, reason = %last_reason, "volume bootstrap attempt failed");
                continue;
            }
        }

        let verify = helper_spec(
            rt,
            KIND_VOLUME_INIT,
            space,
            &format!("{}:{}", uid, gid),
            false,
            VERIFY_SCRIPT,
            &[root.clone(), uid.clone()],
        );
        match run_helper(runtime, &verify).await {
            Ok(out) if out.exit_code == 0 => {
                info!(space = %space, attempt, "workspace volume ready");
                return Ok(());
            }
            Ok(out) => {
                last_reason = format!(
                    "write check exited with {}: {}",
                    out.exit_code,
                    out.logs.trim()
                );
            }
            Err(e) => {
                last_reason = format!("write check: {}", e);
            }
        }
        warn!(space = %space, attempt, reason = %last_reason, "volume bootstrap attempt failed");
    }

    Err(SpaceError::BootstrapFailed {
        name: space.to_string(),
        attempts: rt.bootstrap_attempts,
        reason: last_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn is_verify(spec: &crate::runtime::ContainerSpec) -> bool {
        spec.user.as_deref() != Some("0:0")
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let runtime = FakeRuntime::new();
        bootstrap_volume(&runtime, &RuntimeConfig::default(), "demo")
            .await
            .unwrap();
        let starts = runtime.calls().iter().filter(|c| c.starts_with("start:")).count();
        assert_eq!(starts, 2);
        assert!(runtime.containers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn verify_runs_as_sandbox_identity() {
        let runtime = FakeRuntime::new();
        let users = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = users.clone();
        runtime.on_helper(move |spec| {
            seen.lock().unwrap().push(spec.user.clone().unwrap_or_default());
            (0, String::new())
        });
        bootstrap_volume(&runtime, &RuntimeConfig::default(), "demo")
            .await
            .unwrap();
        assert_eq!(*users.lock().unwrap(), vec!["0:0", "1001:1001"]);
    }

    #[tokio::test]
    async fn unwritable_volume_fails_after_three_attempts() {
        let runtime = FakeRuntime::new();
        let verifies = Arc::new(AtomicU32::new(0));
        let counter = verifies.clone();
        runtime.on_helper(move |spec| {
            if is_verify(spec) {
                counter.fetch_add(1, Ordering::SeqCst);
                (1, "touch: Permission denied".into())
            } else {
                (0, String::new())
            }
        });

        let err = bootstrap_volume(&runtime, &RuntimeConfig::default(), "demo")
            .await
            .unwrap_err();
        match err {
            SpaceError::BootstrapFailed { name, attempts, reason } => {
                assert_eq!(name, "demo");
                assert_eq!(attempts, 3);
                assert!(reason.contains("Permission denied"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(verifies.load(Ordering::SeqCst), 3);
        // Every helper was cleaned up.
        assert!(runtime.containers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovers_on_second_attempt() {
        let runtime = FakeRuntime::new();
        let prepares = Arc::new(AtomicU32::new(0));
        let counter = prepares.clone();
        runtime.on_helper(move |spec| {
            if !is_verify(spec) && counter.fetch_add(1, Ordering::SeqCst) == 0 {
                (1, "chown: busy".into())
            } else {
                (0, String::new())
            }
        });
        bootstrap_volume(&runtime, &RuntimeConfig::default(), "demo")
            .await
            .unwrap();
        assert_eq!(prepares.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn scripts_use_positional_args() {
        assert!(PREPARE_SCRIPT.contains(INIT_MARKER));
        assert!(VERIFY_SCRIPT.contains(VERIFY_MARKER));
        assert!(!PREPARE_SCRIPT.contains("1001"));
    }
}
