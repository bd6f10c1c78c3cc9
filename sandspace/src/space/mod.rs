pub mod bootstrap;
pub mod helper;
pub mod policy;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use regex::Regex;
use sandspace_protocol::{CreateSpaceRequest, NetworkMode, SpaceInfo, SpaceStatus};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::activity::ActivityStore;
use crate::audit::{AuditKind, AuditSink};
use crate::config::Config;
use crate::error::{SpaceError, SpaceResult};
use crate::metrics::MetricsRegistry;
use crate::network::{EgressFilter, SyncOutcome};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerState, RuntimeError};

use self::policy::{SecurityPolicy, LABEL_KIND, LABEL_POLICY, LABEL_SPACE, LABEL_VOLUME, KIND_SPACE};

/// Check a space name against `^[A-Za-z0-9_-]{1,64}$`.
pub fn validate_name(name: &str) -> SpaceResult<()> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("invalid space name regex"));
    if re.is_match(name) {
        Ok(())
    } else {
        Err(SpaceError::InvalidName(name.to_string()))
    }
}

/// Holds a name in the in-flight create set until dropped.
struct Reservation<'a> {
    set: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
    }
}

/// Lifecycle manager for spaces.
///
/// Holds no per-space state of its own: a space is its labelled container in
/// the runtime, so status and policy are always read live and survive a
/// daemon restart. The only local state is the activity store, the set of
/// names with a create in flight and the block-lists of filtered creates
/// whose containers do not exist yet.
pub struct SpaceManager {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    activity: Arc<ActivityStore>,
    audit: AuditSink,
    egress: Arc<EgressFilter>,
    metrics: MetricsRegistry,
    creating: Mutex<HashSet<String>>,
    pending_egress: Mutex<HashMap<String, Vec<String>>>,
    egress_lock: tokio::sync::Mutex<()>,
}

impl SpaceManager {
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        activity: Arc<ActivityStore>,
        audit: AuditSink,
        egress: Arc<EgressFilter>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            config,
            runtime,
            activity,
            audit,
            egress,
            metrics,
            creating: Mutex::new(HashSet::new()),
            pending_egress: Mutex::new(HashMap::new()),
            egress_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    pub fn activity(&self) -> &ActivityStore {
        &self.activity
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    fn reserve(&self, name: &str) -> SpaceResult<Reservation<'_>> {
        let mut set = self
            .creating
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(name.to_string()) {
            return Err(SpaceError::Conflict(name.to_string()));
        }
        Ok(Reservation {
            set: &self.creating,
            name: name.to_string(),
        })
    }

    /// Create, bootstrap and start a new space.
    #[instrument(skip(self, req), fields(space = %req.name))]
    pub async fn create(&self, req: CreateSpaceRequest) -> SpaceResult<SpaceInfo> {
        let started = Instant::now();
        let name = req.name.clone();
        validate_name(&name)?;
        let _reservation = self.reserve(&name)?;

        let rt = &self.config.runtime;
        let container = rt.container_name(&name);
        match self.runtime.inspect(&container).await {
            Ok(_) => return Err(SpaceError::Conflict(name)),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(SpaceError::Runtime(e)),
        }

        let policy = policy::resolve_policy(&self.config, req.policy.as_ref())?;
        let resources =
            policy::resolve_resources(&self.config, req.memory.as_deref(), req.cpus, &policy)?;
        let image = req
            .image
            .clone()
            .filter(|i| !i.trim().is_empty())
            .unwrap_or_else(|| rt.default_image.clone());

        info!(
            space = %name,
            image = %image,
            memory_bytes = resources.memory_bytes,
            cpus = resources.cpus,
            network = %policy.network,
            "creating space"
        );

        // 1. Volume: reuse if it survived an earlier destroy.
        let volume = rt.volume_name(&name);
        let created_volume = if self.runtime.volume_exists(&volume).await? {
            debug!(space = %name, volume = %volume, "reusing existing workspace volume");
            false
        } else {
            let mut labels = HashMap::new();
            labels.insert(LABEL_SPACE.to_string(), name.clone());
            self.runtime.create_volume(&volume, labels).await?;
            true
        };

        // 2..4 run under a rollback guard for anything this call created.
        let provisioned = self.provision(&name, &image, &req, resources, &policy).await;
        // From here on the container, if any, carries the block-list itself.
        let was_pending = self.pending().remove(&name).is_some();
        if let Err(e) = provisioned {
            self.metrics.record_error(e.code());
            if let Err(e2) = self.runtime.remove(&container, true).await {
                if !matches!(e2, RuntimeError::NotFound(_)) {
                    error!(error = %e2, "failed to rollback container after create failure");
                }
            }
            if created_volume {
                if let Err(e2) = self.runtime.remove_volume(&volume).await {
                    error!(error = %e2, "failed to rollback volume after create failure");
                }
            }
            if was_pending {
                if let Err(e2) = self.sync_egress().await {
                    warn!(space = %name, error = %e2, "egress filter resync after failed create failed");
                }
            }
            return Err(e);
        }

        self.activity.touch(&name);
        self.metrics.record_create(started.elapsed());
        self.audit.record(
            AuditKind::SpaceCreate,
            &name,
            json!({
                "image": image,
                "memory_bytes": resources.memory_bytes,
                "cpus": resources.cpus,
                "network": policy.network,
                "writable_rootfs": policy.writable_rootfs,
            }),
        );
        info!(space = %name, "space created and running");
        self.get(&name).await
    }

    async fn provision(
        &self,
        name: &str,
        image: &str,
        req: &CreateSpaceRequest,
        resources: policy::ResourceSpec,
        policy: &SecurityPolicy,
    ) -> SpaceResult<()> {
        bootstrap::bootstrap_volume(self.runtime.as_ref(), &self.config.runtime, name).await?;

        if policy.network == NetworkMode::GatewayFiltered {
            self.runtime
                .ensure_network(&self.config.egress.network_name, &self.config.egress.bridge_interface)
                .await?;
            self.pending()
                .insert(name.to_string(), policy.blocked_ranges.clone());
            self.sync_egress().await?;
        }

        let spec = policy::compose(
            &self.config,
            name,
            image,
            policy::env_list(&req.env),
            resources,
            policy,
        );
        self.runtime.create(&spec).await?;
        self.runtime.start(&spec.name).await?;
        Ok(())
    }

    /// Inspect a space's container. `NotFound` unless it is a labelled space.
    pub async fn resolve(&self, name: &str) -> SpaceResult<ContainerInfo> {
        validate_name(name)?;
        let container = self.config.runtime.container_name(name);
        let info = match self.runtime.inspect(&container).await {
            Ok(info) => info,
            Err(RuntimeError::NotFound(_)) => return Err(SpaceError::NotFound(name.to_string())),
            Err(e) => return Err(SpaceError::Runtime(e)),
        };
        if info.labels.get(LABEL_KIND).map(String::as_str) != Some(KIND_SPACE) {
            return Err(SpaceError::NotFound(name.to_string()));
        }
        Ok(info)
    }

    pub async fn get(&self, name: &str) -> SpaceResult<SpaceInfo> {
        let info = self.resolve(name).await?;
        Ok(self.space_info(&info))
    }

    /// All spaces, status read live from the runtime.
    pub async fn list(&self) -> SpaceResult<Vec<SpaceInfo>> {
        let containers = self.runtime.list(&[(LABEL_KIND, KIND_SPACE)]).await?;
        let mut spaces: Vec<SpaceInfo> = containers.iter().map(|c| self.space_info(c)).collect();
        spaces.sort_by(|a, b| a.name.cmp(&b.name));
        self.metrics.set_space_counts(&spaces);
        Ok(spaces)
    }

    /// Resume a paused space or restart a stopped one.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> SpaceResult<SpaceInfo> {
        let info = self.resolve(name).await?;
        let from = status_of(info.state);
        match info.state {
            ContainerState::Paused => self.runtime.unpause(&info.name).await,
            ContainerState::Created | ContainerState::Exited => self.runtime.start(&info.name).await,
            ContainerState::Running => Ok(()),
        }
        .map_err(|e| SpaceError::runtime(name, e))?;
        self.activity.touch(name);
        self.audit
            .record(AuditKind::SpaceStart, name, json!({ "from": from }));
        info!(space = %name, from = %from, "space started");
        self.get(name).await
    }

    /// Pause a running space. Returns whether a transition happened; pausing
    /// a paused or stopped space is a no-op. Does not count as activity.
    #[instrument(skip(self))]
    pub async fn pause(&self, name: &str) -> SpaceResult<bool> {
        let info = self.resolve(name).await?;
        if info.state != ContainerState::Running {
            debug!(space = %name, state = ?info.state, "pause is a no-op");
            return Ok(false);
        }
        self.runtime
            .pause(&info.name)
            .await
            .map_err(|e| SpaceError::runtime(name, e))?;
        self.audit
            .record(AuditKind::SpacePause, name, serde_json::Value::Null);
        info!(space = %name, "space paused");
        Ok(true)
    }

    /// Force-remove a space. The volume is kept unless `remove_volume`.
    #[instrument(skip(self))]
    pub async fn destroy(&self, name: &str, remove_volume: bool) -> SpaceResult<()> {
        let info = self.resolve(name).await?;
        let filtered = policy_of(&info)
            .map(|p| p.network == NetworkMode::GatewayFiltered)
            .unwrap_or(false);

        self.runtime
            .remove(&info.name, true)
            .await
            .map_err(|e| SpaceError::runtime(name, e))?;
        self.activity.remove(name);

        if remove_volume {
            let volume = info
                .labels
                .get(LABEL_VOLUME)
                .cloned()
                .unwrap_or_else(|| self.config.runtime.volume_name(name));
            if let Err(e) = self.runtime.remove_volume(&volume).await {
                warn!(space = %name, volume = %volume, error = %e, "failed to remove workspace volume");
            }
        }

        if filtered {
            if let Err(e) = self.sync_egress().await {
                warn!(space = %name, error = %e, "egress filter resync after destroy failed");
            }
        }

        self.audit.record(
            AuditKind::SpaceDestroy,
            name,
            json!({ "remove_volume": remove_volume }),
        );
        info!(space = %name, remove_volume, "space destroyed");
        Ok(())
    }

    /// Resume-before-use for every interactive entry point. Returns the
    /// container as it is once running.
    pub async fn ensure_running(&self, name: &str) -> SpaceResult<ContainerInfo> {
        let mut info = self.resolve(name).await?;
        match info.state {
            ContainerState::Running => return Ok(info),
            ContainerState::Paused => {
                if let Err(e) = self.runtime.unpause(&info.name).await {
                    // Another caller may have resumed it first.
                    let now = self.resolve(name).await?;
                    if now.state != ContainerState::Running {
                        return Err(SpaceError::runtime(name, e));
                    }
                }
                info!(space = %name, "resumed paused space");
            }
            ContainerState::Created | ContainerState::Exited => {
                self.runtime
                    .start(&info.name)
                    .await
                    .map_err(|e| SpaceError::runtime(name, e))?;
                info!(space = %name, "restarted stopped space");
            }
        }
        info.state = ContainerState::Running;
        Ok(info)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.pending_egress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// De-duplicated union of the configured block-list and the block-lists
    /// of every gateway-filtered space, including creates still in flight.
    pub async fn egress_ranges(&self) -> SpaceResult<Vec<String>> {
        let containers = self.runtime.list(&[(LABEL_KIND, KIND_SPACE)]).await?;
        let mut ranges = self.config.policy.blocked_ranges.clone();
        for c in &containers {
            if let Some(p) = policy_of(c) {
                if p.network == NetworkMode::GatewayFiltered {
                    ranges.extend(p.blocked_ranges);
                }
            }
        }
        {
            let pending = self.pending();
            let mut names: Vec<&String> = pending.keys().collect();
            names.sort();
            for name in names {
                ranges.extend(pending[name].iter().cloned());
            }
        }
        Ok(policy::dedup_ranges(&ranges))
    }

    /// Converge the host egress filter onto the current set of spaces.
    ///
    /// Computing and applying happen under one lock, so a sync never installs
    /// a range set older than one already applied.
    pub async fn sync_egress(&self) -> SpaceResult<SyncOutcome> {
        let _guard = self.egress_lock.lock().await;
        let ranges = self.egress_ranges().await?;
        self.apply_egress(&ranges).await
    }

    async fn apply_egress(&self, ranges: &[String]) -> SpaceResult<SyncOutcome> {
        self.egress
            .sync(ranges)
            .await
            .map_err(|e| SpaceError::Runtime(RuntimeError::Firewall(format!("{:#}", e))))
    }

    fn space_info(&self, c: &ContainerInfo) -> SpaceInfo {
        let rt = &self.config.runtime;
        let name = c
            .labels
            .get(LABEL_SPACE)
            .cloned()
            .or_else(|| rt.space_name(&c.name).map(str::to_string))
            .unwrap_or_else(|| c.name.clone());
        let last_activity = self.activity.get(&name).or(c.started_at);

        SpaceInfo {
            id: c.id.clone(),
            status: status_of(c.state),
            image: c.image.clone(),
            memory_bytes: c.memory_bytes,
            cpus: c.nano_cpus as f64 / 1e9,
            volume: c
                .labels
                .get(LABEL_VOLUME)
                .cloned()
                .unwrap_or_else(|| rt.volume_name(&name)),
            mountpoint: rt.workspace_mount.clone(),
            policy: policy_of(c).map(|p| p.info()),
            created_at: c.created_at.map(|t| t.to_rfc3339()),
            started_at: c.started_at.map(|t| t.to_rfc3339()),
            last_activity_at: last_activity.map(|t| t.to_rfc3339()),
            name,
        }
    }
}

fn status_of(state: ContainerState) -> SpaceStatus {
    match state {
        ContainerState::Running => SpaceStatus::Running,
        ContainerState::Paused => SpaceStatus::Paused,
        ContainerState::Created | ContainerState::Exited => SpaceStatus::Stopped,
    }
}

fn policy_of(c: &ContainerInfo) -> Option<SecurityPolicy> {
    c.labels
        .get(LABEL_POLICY)
        .and_then(|raw| SecurityPolicy::from_label(raw))
}
