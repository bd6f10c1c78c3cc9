use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sandspace_protocol::NetworkMode;
use serde::{Deserialize, Serialize};

use crate::space::policy::{parse_cidr, parse_memory};

/// Top-level configuration for the sandspace daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub policy: PolicyDefaults,
    pub idle: IdleConfig,
    pub egress: EgressConfig,
    pub audit: AuditConfig,
    pub history: HistoryConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.server.port != 0, "server.port must be non-zero");
        anyhow::ensure!(
            self.runtime.workspace_mount.starts_with('/'),
            "runtime.workspace_mount must be an absolute path"
        );
        anyhow::ensure!(
            !self.runtime.container_prefix.is_empty(),
            "runtime.container_prefix must not be empty"
        );
        anyhow::ensure!(
            !self.runtime.volume_prefix.is_empty(),
            "runtime.volume_prefix must not be empty"
        );
        anyhow::ensure!(
            self.runtime.bootstrap_attempts >= 1,
            "runtime.bootstrap_attempts must be >= 1"
        );
        anyhow::ensure!(
            self.idle.timeout_secs <= MAX_IDLE_TIMEOUT_SECS,
            "idle.timeout_secs must be <= {} (one year)",
            MAX_IDLE_TIMEOUT_SECS
        );

        let default_memory = parse_memory(&self.policy.default_memory)
            .with_context(|| format!("policy.default_memory is invalid: {}", self.policy.default_memory))?;
        let max_memory = parse_memory(&self.policy.max_memory)
            .with_context(|| format!("policy.max_memory is invalid: {}", self.policy.max_memory))?;
        anyhow::ensure!(
            default_memory <= max_memory,
            "policy.default_memory must be <= policy.max_memory"
        );
        anyhow::ensure!(
            self.policy.default_cpus > 0.0 && self.policy.max_cpus > 0.0,
            "policy cpu values must be > 0"
        );
        anyhow::ensure!(
            self.policy.default_cpus <= self.policy.max_cpus,
            "policy.default_cpus must be <= policy.max_cpus"
        );
        anyhow::ensure!(self.policy.pids_limit >= 1, "policy.pids_limit must be >= 1");
        for (i, cidr) in self.policy.blocked_ranges.iter().enumerate() {
            anyhow::ensure!(
                parse_cidr(cidr).is_some(),
                "policy.blocked_ranges[{}] is not a valid IPv4 CIDR: {}",
                i,
                cidr
            );
        }

        anyhow::ensure!(
            self.idle.sweep_interval_secs >= 1,
            "idle.sweep_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            !self.egress.chain.is_empty() && !self.egress.hook_chain.is_empty(),
            "egress.chain and egress.hook_chain must not be empty"
        );
        // Linux limits interface names to 15 bytes.
        anyhow::ensure!(
            !self.egress.bridge_interface.is_empty() && self.egress.bridge_interface.len() <= 15,
            "egress.bridge_interface must be 1-15 characters"
        );
        anyhow::ensure!(
            self.audit.queue_capacity >= 1,
            "audit.queue_capacity must be >= 1"
        );
        if self.history.enabled {
            anyhow::ensure!(
                self.history.interval_secs >= 1,
                "history.interval_secs must be >= 1"
            );
        }
        Ok(())
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Admin token required as `Authorization: Bearer <token>` or `?key=<token>`.
    /// Empty disables authentication.
    pub api_key: String,
    /// Origins allowed by CORS. Empty allows none.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 3005,
            api_key: String::new(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Container runtime and naming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker Engine socket. Empty uses the local defaults (`DOCKER_HOST` or the unix socket).
    pub docker_socket: String,
    /// Image used when a create request names none.
    pub default_image: String,
    /// Image for the short-lived volume helper containers.
    pub helper_image: String,
    pub container_prefix: String,
    pub volume_prefix: String,
    pub workspace_mount: String,
    /// User name inside the image that commands run as.
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub bootstrap_attempts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: String::new(),
            default_image: "sandspace-sandbox:latest".into(),
            helper_image: "busybox:stable".into(),
            container_prefix: "sandspace-".into(),
            volume_prefix: "sandspace-vol-".into(),
            workspace_mount: "/workspace".into(),
            user: "sandbox".into(),
            uid: 1001,
            gid: 1001,
            bootstrap_attempts: 3,
        }
    }
}

impl RuntimeConfig {
    /// Runtime container name for a space, e.g. "sandspace-demo".
    pub fn container_name(&self, space: &str) -> String {
        format!("{}{}", self.container_prefix, space)
    }

    /// Volume name for a space, e.g. "sandspace-vol-demo".
    pub fn volume_name(&self, space: &str) -> String {
        format!("{}{}", self.volume_prefix, space)
    }

    /// Strip the container prefix, returning the space name.
    pub fn space_name<'a>(&self, container_name: &'a str) -> Option<&'a str> {
        container_name
            .trim_start_matches('/')
            .strip_prefix(self.container_prefix.as_str())
    }
}

/// Defaults and ceilings applied when composing a space's security policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDefaults {
    pub default_memory: String,
    pub max_memory: String,
    pub default_cpus: f64,
    pub max_cpus: f64,
    pub pids_limit: i64,
    pub writable_rootfs: bool,
    pub network: NetworkMode,
    /// Ranges unreachable from gateway-filtered spaces.
    pub blocked_ranges: Vec<String>,
    pub tmp_size: String,
    pub run_size: String,
}

fn default_blocked_ranges() -> Vec<String> {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "100.64.0.0/10",
        "169.254.0.0/16",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            default_memory: "2g".into(),
            max_memory: "8g".into(),
            default_cpus: 1.0,
            max_cpus: 4.0,
            pids_limit: 512,
            writable_rootfs: false,
            network: NetworkMode::GatewayFiltered,
            blocked_ranges: default_blocked_ranges(),
            tmp_size: "512m".into(),
            run_size: "16m".into(),
        }
    }
}

/// Longest accepted idle timeout: one year.
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Idle monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Pause spaces idle for longer than this. Zero disables the monitor.
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

/// Host egress filter configuration (iptables).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    pub chain: String,
    pub hook_chain: String,
    /// Runtime network that gateway-filtered spaces attach to.
    pub network_name: String,
    /// Host-side bridge interface of that network.
    pub bridge_interface: String,
    /// Fail instead of warning when iptables is unavailable.
    pub required: bool,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            chain: "SANDSPACE_EGRESS".into(),
            hook_chain: "DOCKER-USER".into(),
            network_name: "sandspace-filtered".into(),
            bridge_interface: "br-sandspace".into(),
            required: false,
        }
    }
}

/// Audit event sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Append-only JSONL file.
    pub path: PathBuf,
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/var/lib/sandspace/audit.jsonl"),
            queue_capacity: 1024,
        }
    }
}

/// Shell-history ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Path of the history file relative to the workspace root.
    pub file: String,
    pub max_bytes: u64,
    /// Only the tail of the file is considered on each pass.
    pub max_lines: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15,
            file: ".bash_history".into(),
            max_bytes: 200_000,
            max_lines: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3005);
        assert_eq!(config.runtime.workspace_mount, "/workspace");
        assert_eq!(config.runtime.user, "sandbox");
        assert_eq!(config.runtime.uid, 1001);
        assert_eq!(config.runtime.bootstrap_attempts, 3);
        assert_eq!(config.policy.pids_limit, 512);
        assert!(!config.policy.writable_rootfs);
        assert_eq!(config.policy.network, NetworkMode::GatewayFiltered);
        assert_eq!(config.policy.blocked_ranges.len(), 5);
        assert_eq!(config.idle.timeout_secs, 600);
        assert_eq!(config.idle.sweep_interval_secs, 60);
        assert_eq!(config.egress.chain, "SANDSPACE_EGRESS");
        assert_eq!(config.egress.hook_chain, "DOCKER-USER");
        assert_eq!(config.history.interval_secs, 15);
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let toml_content = r#"
[server]
port = 8080
api_key = "s3cret"

[policy]
default_memory = "512m"
network = "isolated"

[idle]
timeout_secs = 30
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.api_key, "s3cret");
        assert_eq!(config.policy.default_memory, "512m");
        assert_eq!(config.policy.network, NetworkMode::Isolated);
        assert_eq!(config.idle.timeout_secs, 30);
        // Unset fields use defaults
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(config.idle.sweep_interval_secs, 60);
        assert_eq!(config.runtime.volume_prefix, "sandspace-vol-");
    }

    #[test]
    fn config_validation_rejects_bad_memory() {
        let mut config = Config::default();
        config.policy.default_memory = "lots".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_default_above_ceiling() {
        let mut config = Config::default();
        config.policy.default_memory = "16g".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.policy.default_cpus = 8.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_bad_cidr() {
        let mut config = Config::default();
        config.policy.blocked_ranges.push("10.0.0.0/40".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_long_interface() {
        let mut config = Config::default();
        config.egress.bridge_interface = "br-this-name-is-too-long".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_huge_idle_timeout() {
        let mut config = Config::default();
        config.idle.timeout_secs = MAX_IDLE_TIMEOUT_SECS;
        assert!(config.validate().is_ok());
        config.idle.timeout_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn runtime_names() {
        let rc = RuntimeConfig::default();
        assert_eq!(rc.container_name("demo"), "sandspace-demo");
        assert_eq!(rc.volume_name("demo"), "sandspace-vol-demo");
        assert_eq!(rc.space_name("/sandspace-demo"), Some("demo"));
        assert_eq!(rc.space_name("other-demo"), None);
    }
}
