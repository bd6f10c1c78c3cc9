//! One-shot subcommands: `check` and `sync-egress`.
//!
//! Neither starts the API server. `check` is safe to run before the first
//! `serve` to find host problems early.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::activity::ActivityStore;
use crate::audit::AuditSink;
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::network::{EgressFilter, SyncOutcome};
use crate::runtime::DockerRuntime;
use crate::space::SpaceManager;

pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    Config::load_or_default(config_path.as_deref())
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `sandspace check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub async fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        Check::pass("Configuration", "valid"),
        check_engine(config).await,
        check_iptables(config).await,
        check_audit_dir(config),
    ];

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let Some(fix) = c.fix.as_ref().filter(|_| !c.ok) {
            println!("    Fix: {}", fix);
        }
    }

    println!();
    let failed = checks.iter().filter(|c| !c.ok).count();
    if failed == 0 {
        println!("All checks passed. Run: sandspace serve --config config.toml");
        Ok(())
    } else {
        anyhow::bail!("{} check(s) failed", failed)
    }
}

async fn check_engine(config: &Config) -> Check {
    let socket = &config.runtime.docker_socket;
    let runtime = match DockerRuntime::connect(socket) {
        Ok(r) => r,
        Err(e) => {
            return Check::fail(
                "Docker engine",
                e.to_string(),
                "set runtime.docker_socket or DOCKER_HOST to a reachable engine",
            )
        }
    };
    match runtime.ping().await {
        Ok(version) => Check::pass("Docker engine", format!("version {}", version)),
        Err(e) => Check::fail(
            "Docker engine",
            e.to_string(),
            "start the Docker daemon and make sure this user can access its socket",
        ),
    }
}

async fn check_iptables(config: &Config) -> Check {
    let filter = EgressFilter::system(&config.egress);
    if filter.available().await {
        return Check::pass("iptables", format!("chain {}", config.egress.chain));
    }
    if config.egress.required {
        Check::fail(
            "iptables",
            "not available and egress.required = true",
            "install iptables and run as root, or set egress.required = false",
        )
    } else {
        Check::pass("iptables", "not available (egress filter will be skipped)")
    }
}

fn check_audit_dir(config: &Config) -> Check {
    if !config.audit.enabled {
        return Check::pass("Audit log", "disabled");
    }
    let Some(parent) = config.audit.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Check::pass("Audit log", config.audit.path.display().to_string());
    };
    match writable_dir(parent) {
        Ok(()) => Check::pass("Audit log", config.audit.path.display().to_string()),
        Err(e) => Check::fail(
            "Audit log",
            format!("{:#}", e),
            format!("create {} and make it writable, or set audit.path", parent.display()),
        ),
    }
}

fn writable_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let marker = dir.join(".sandspace-check");
    std::fs::write(&marker, b"").with_context(|| format!("writing {}", marker.display()))?;
    let _ = std::fs::remove_file(&marker);
    Ok(())
}

// ---------------------------------------------------------------------------
// sync-egress
// ---------------------------------------------------------------------------

/// Converge the host egress filter onto the live spaces once and exit.
pub async fn run_sync_egress(config: Config) -> Result<()> {
    let runtime = DockerRuntime::connect(&config.runtime.docker_socket)
        .context("connecting to the Docker engine")?;
    let egress = Arc::new(EgressFilter::system(&config.egress));
    let chain = config.egress.chain.clone();
    let manager = SpaceManager::new(
        config,
        Arc::new(runtime),
        Arc::new(ActivityStore::new()),
        AuditSink::disabled(),
        egress,
        MetricsRegistry::new(),
    );

    match manager.sync_egress().await.context("syncing egress filter")? {
        SyncOutcome::Applied { rules } => {
            println!("Egress filter {} synced ({} rules)", chain, rules)
        }
        SyncOutcome::Skipped => println!("iptables not available; egress filter skipped"),
    }
    Ok(())
}
