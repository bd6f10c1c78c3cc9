//! Security policy: resolution from request + defaults, and composition into
//! a hardened [`ContainerSpec`].

use std::collections::HashMap;
use std::net::Ipv4Addr;

use sandspace_protocol::{NetworkMode, PolicyInfo, PolicyRequest};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{SpaceError, SpaceResult};
use crate::runtime::{ContainerSpec, VolumeMount};

pub const LABEL_KIND: &str = "sandspace.kind";
pub const LABEL_SPACE: &str = "sandspace.space";
pub const LABEL_VOLUME: &str = "sandspace.volume";
pub const LABEL_POLICY: &str = "sandspace.policy";

pub const KIND_SPACE: &str = "space";
pub const KIND_VOLUME_INIT: &str = "volume-init";
pub const KIND_HISTORY_READ: &str = "history-read";

/// Immutable policy attached to a space at creation. Stored as JSON in the
/// container's `sandspace.policy` label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub writable_rootfs: bool,
    pub network: NetworkMode,
    pub blocked_ranges: Vec<String>,
    pub max_memory_bytes: u64,
    pub max_cpus: f64,
    pub pids_limit: i64,
}

impl SecurityPolicy {
    pub fn to_label(&self) -> String {
        // Plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn info(&self) -> PolicyInfo {
        PolicyInfo {
            writable_rootfs: self.writable_rootfs,
            network: self.network,
            blocked_ranges: self.blocked_ranges.clone(),
            max_memory_bytes: self.max_memory_bytes,
            max_cpus: self.max_cpus,
            pids_limit: self.pids_limit,
        }
    }
}

/// Resources granted to a space, within its policy ceilings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSpec {
    pub memory_bytes: u64,
    pub cpus: f64,
}

/// Parse a memory string: `<n>[g|m|k]`, case-insensitive. A bare number is MiB.
pub fn parse_memory(raw: &str) -> Option<u64> {
    let s = raw.trim().to_ascii_lowercase();
    let (digits, multiplier) = match s.chars().last()? {
        'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        'm' => (&s[..s.len() - 1], 1024 * 1024),
        'k' => (&s[..s.len() - 1], 1024),
        c if c.is_ascii_digit() => (s.as_str(), 1024 * 1024),
        _ => return None,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    if n == 0 {
        return None;
    }
    n.checked_mul(multiplier)
}

/// Parse an IPv4 CIDR such as `10.0.0.0/8`. A bare address is a /32.
pub fn parse_cidr(raw: &str) -> Option<(Ipv4Addr, u8)> {
    let raw = raw.trim();
    let (addr, prefix) = match raw.split_once('/') {
        Some((addr, prefix)) => (addr, prefix.parse::<u8>().ok()?),
        None => (raw, 32),
    };
    if prefix > 32 {
        return None;
    }
    Some((addr.parse().ok()?, prefix))
}

/// Trim and de-duplicate ranges, keeping first-seen order.
pub fn dedup_ranges<'a>(ranges: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ranges
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty() && seen.insert(r.clone()))
        .collect()
}

/// Merge a create request's policy overrides over the configured defaults.
pub fn resolve_policy(config: &Config, req: Option<&PolicyRequest>) -> SpaceResult<SecurityPolicy> {
    let defaults = &config.policy;
    let req = req.cloned().unwrap_or_default();

    let ranges = req.blocked_ranges.unwrap_or_else(|| defaults.blocked_ranges.clone());
    for range in &ranges {
        if parse_cidr(range).is_none() {
            return Err(SpaceError::InvalidRequest(format!(
                "blocked range '{}' is not a valid IPv4 CIDR",
                range
            )));
        }
    }

    let max_memory_bytes = parse_memory(&defaults.max_memory).ok_or_else(|| {
        SpaceError::InvalidRequest(format!("invalid memory ceiling '{}'", defaults.max_memory))
    })?;

    Ok(SecurityPolicy {
        writable_rootfs: req.writable_rootfs.unwrap_or(defaults.writable_rootfs),
        network: req.network.unwrap_or(defaults.network),
        blocked_ranges: dedup_ranges(&ranges),
        max_memory_bytes,
        max_cpus: defaults.max_cpus,
        pids_limit: defaults.pids_limit,
    })
}

/// Resolve requested resources against defaults and the policy ceilings.
pub fn resolve_resources(
    config: &Config,
    memory: Option<&str>,
    cpus: Option<f64>,
    policy: &SecurityPolicy,
) -> SpaceResult<ResourceSpec> {
    let memory_raw = memory.unwrap_or(&config.policy.default_memory);
    let memory_bytes = parse_memory(memory_raw).ok_or_else(|| {
        SpaceError::InvalidRequest(format!(
            "invalid memory '{}': expected <number>[g|m|k]",
            memory_raw
        ))
    })?;
    if memory_bytes > policy.max_memory_bytes {
        return Err(SpaceError::InvalidRequest(format!(
            "requested {} bytes memory exceeds maximum {} bytes per space",
            memory_bytes, policy.max_memory_bytes
        )));
    }

    let cpus = cpus.unwrap_or(config.policy.default_cpus);
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(SpaceError::InvalidRequest(format!(
            "invalid cpus {}: must be > 0",
            cpus
        )));
    }
    if cpus > policy.max_cpus {
        return Err(SpaceError::InvalidRequest(format!(
            "requested {} cpus exceeds maximum {} per space",
            cpus, policy.max_cpus
        )));
    }

    Ok(ResourceSpec { memory_bytes, cpus })
}

/// `KEY=VALUE` list with empty or malformed keys dropped.
pub fn env_list<'a>(env: impl IntoIterator<Item = (&'a String, &'a String)>) -> Vec<String> {
    env.into_iter()
        .filter(|(k, _)| !k.trim().is_empty() && !k.contains('='))
        .map(|(k, v)| format!("{}={}", k.trim(), v))
        .collect()
}

pub fn network_mode_for(config: &Config, mode: NetworkMode) -> String {
    match mode {
        NetworkMode::Isolated => "none".to_string(),
        NetworkMode::GatewayFiltered => config.egress.network_name.clone(),
        NetworkMode::Open => "bridge".to_string(),
    }
}

/// Build the runtime configuration for a space container.
pub fn compose(
    config: &Config,
    name: &str,
    image: &str,
    env: Vec<String>,
    resources: ResourceSpec,
    policy: &SecurityPolicy,
) -> ContainerSpec {
    let rt = &config.runtime;
    let volume = rt.volume_name(name);

    let mut labels = HashMap::new();
    labels.insert(LABEL_KIND.to_string(), KIND_SPACE.to_string());
    labels.insert(LABEL_SPACE.to_string(), name.to_string());
    labels.insert(LABEL_VOLUME.to_string(), volume.clone());
    labels.insert(LABEL_POLICY.to_string(), policy.to_label());

    let mut tmpfs = HashMap::new();
    if !policy.writable_rootfs {
        tmpfs.insert(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,nodev,size={}", config.policy.tmp_size),
        );
        tmpfs.insert(
            "/run".to_string(),
            format!("rw,noexec,nosuid,nodev,size={}", config.policy.run_size),
        );
    }

    ContainerSpec {
        name: rt.container_name(name),
        image: image.to_string(),
        cmd: vec!["sleep".into(), "infinity".into()],
        user: Some(rt.user.clone()),
        working_dir: Some(rt.workspace_mount.clone()),
        hostname: Some(name.to_string()),
        env,
        labels,
        mounts: vec![VolumeMount {
            volume,
            target: rt.workspace_mount.clone(),
            read_only: false,
        }],
        network_mode: Some(network_mode_for(config, policy.network)),
        memory_bytes: Some(resources.memory_bytes as i64),
        nano_cpus: Some((resources.cpus * 1e9).round() as i64),
        pids_limit: Some(policy.pids_limit),
        readonly_rootfs: !policy.writable_rootfs,
        tmpfs,
        cap_drop: vec!["ALL".into()],
        security_opt: vec!["no-new-privileges".into()],
        restart_unless_stopped: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(network: NetworkMode, writable_rootfs: bool) -> SecurityPolicy {
        SecurityPolicy {
            writable_rootfs,
            network,
            blocked_ranges: vec!["10.0.0.0/8".into()],
            max_memory_bytes: 8 << 30,
            max_cpus: 4.0,
            pids_limit: 512,
        }
    }

    #[test]
    fn parse_memory_units() {
        assert_eq!(parse_memory("2g"), Some(2 << 30));
        assert_eq!(parse_memory("512m"), Some(512 << 20));
        assert_eq!(parse_memory("512M"), Some(512 << 20));
        assert_eq!(parse_memory("1024k"), Some(1 << 20));
        assert_eq!(parse_memory("256"), Some(256 << 20));
    }

    #[test]
    fn parse_memory_rejects_garbage() {
        assert_eq!(parse_memory(""), None);
        assert_eq!(parse_memory("g"), None);
        assert_eq!(parse_memory("2gb"), None);
        assert_eq!(parse_memory("-1m"), None);
        assert_eq!(parse_memory("1.5g"), None);
        assert_eq!(parse_memory("0"), None);
    }

    #[test]
    fn parse_cidr_forms() {
        assert_eq!(parse_cidr("10.0.0.0/8"), Some((Ipv4Addr::new(10, 0, 0, 0), 8)));
        assert_eq!(parse_cidr("1.2.3.4"), Some((Ipv4Addr::new(1, 2, 3, 4), 32)));
        assert!(parse_cidr("10.0.0.0/33").is_none());
        assert!(parse_cidr("fd00::/8").is_none());
        assert!(parse_cidr("not-an-ip/8").is_none());
    }

    #[test]
    fn dedup_keeps_first_order() {
        let ranges = vec![
            " 10.0.0.0/8".to_string(),
            "192.168.0.0/16".to_string(),
            "10.0.0.0/8".to_string(),
            "".to_string(),
        ];
        assert_eq!(dedup_ranges(&ranges), vec!["10.0.0.0/8", "192.168.0.0/16"]);
    }

    #[test]
    fn resolve_policy_uses_defaults() {
        let config = Config::default();
        let p = resolve_policy(&config, None).unwrap();
        assert!(!p.writable_rootfs);
        assert_eq!(p.network, NetworkMode::GatewayFiltered);
        assert_eq!(p.blocked_ranges, config.policy.blocked_ranges);
        assert_eq!(p.pids_limit, 512);
    }

    #[test]
    fn resolve_policy_rejects_bad_range() {
        let config = Config::default();
        let req = PolicyRequest {
            blocked_ranges: Some(vec!["999.0.0.0/8".into()]),
            ..Default::default()
        };
        assert!(matches!(
            resolve_policy(&config, Some(&req)),
            Err(SpaceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn resources_within_ceilings() {
        let config = Config::default();
        let p = policy(NetworkMode::Isolated, false);
        let r = resolve_resources(&config, Some("1g"), Some(2.0), &p).unwrap();
        assert_eq!(r.memory_bytes, 1 << 30);
        assert_eq!(r.cpus, 2.0);

        let r = resolve_resources(&config, None, None, &p).unwrap();
        assert_eq!(r.memory_bytes, 2 << 30);
        assert_eq!(r.cpus, 1.0);
    }

    #[test]
    fn resources_above_ceiling_rejected() {
        let config = Config::default();
        let p = policy(NetworkMode::Isolated, false);
        assert!(resolve_resources(&config, Some("16g"), None, &p).is_err());
        assert!(resolve_resources(&config, None, Some(8.0), &p).is_err());
        assert!(resolve_resources(&config, None, Some(0.0), &p).is_err());
        assert!(resolve_resources(&config, Some("lots"), None, &p).is_err());
    }

    #[test]
    fn compose_hardened_defaults() {
        let config = Config::default();
        let p = policy(NetworkMode::Isolated, false);
        let spec = compose(
            &config,
            "demo",
            "img:1",
            vec!["A=1".into()],
            ResourceSpec {
                memory_bytes: 1 << 30,
                cpus: 1.5,
            },
            &p,
        );
        assert_eq!(spec.name, "sandspace-demo");
        assert_eq!(spec.cap_drop, vec!["ALL"]);
        assert_eq!(spec.security_opt, vec!["no-new-privileges"]);
        assert!(spec.readonly_rootfs);
        assert_eq!(
            spec.tmpfs.get("/tmp").map(String::as_str),
            Some("rw,noexec,nosuid,nodev,size=512m")
        );
        assert_eq!(
            spec.tmpfs.get("/run").map(String::as_str),
            Some("rw,noexec,nosuid,nodev,size=16m")
        );
        assert_eq!(spec.network_mode.as_deref(), Some("none"));
        assert_eq!(spec.nano_cpus, Some(1_500_000_000));
        assert_eq!(spec.pids_limit, Some(512));
        assert_eq!(spec.user.as_deref(), Some("sandbox"));
        assert_eq!(spec.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(spec.mounts[0].volume, "sandspace-vol-demo");
        assert!(spec.restart_unless_stopped);

        let label = spec.labels.get(LABEL_POLICY).unwrap();
        assert_eq!(SecurityPolicy::from_label(label), Some(p));
    }

    #[test]
    fn compose_writable_rootfs_skips_tmpfs() {
        let config = Config::default();
        let spec = compose(
            &config,
            "demo",
            "img",
            Vec::new(),
            ResourceSpec {
                memory_bytes: 1 << 30,
                cpus: 1.0,
            },
            &policy(NetworkMode::Open, true),
        );
        assert!(!spec.readonly_rootfs);
        assert!(spec.tmpfs.is_empty());
        assert_eq!(spec.network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn gateway_filtered_uses_dedicated_network() {
        let config = Config::default();
        assert_eq!(
            network_mode_for(&config, NetworkMode::GatewayFiltered),
            "sandspace-filtered"
        );
    }

    #[test]
    fn env_list_drops_empty_keys() {
        let mut env = std::collections::BTreeMap::new();
        env.insert("".to_string(), "x".to_string());
        env.insert("A=B".to_string(), "x".to_string());
        env.insert("PATH".to_string(), "/bin".to_string());
        assert_eq!(env_list(&env), vec!["PATH=/bin"]);
    }
}
