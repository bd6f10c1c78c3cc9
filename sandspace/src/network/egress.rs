use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::EgressConfig;

/// Result of one `iptables` invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `iptables` (filter table). The system implementation shells out; tests
/// use an in-memory table.
#[async_trait]
pub trait Iptables: Send + Sync {
    async fn available(&self) -> bool;
    async fn run(&self, args: &[String]) -> Result<CommandOutput>;
}

/// Shells out to the host `iptables` binary.
#[derive(Debug, Clone, Default)]
pub struct SystemIptables;

#[async_trait]
impl Iptables for SystemIptables {
    async fn available(&self) -> bool {
        matches!(
            Command::new("iptables").arg("-V").output().await,
            Ok(out) if out.status.success()
        )
    }

    async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        debug!(args = ?args, "running iptables command");

        let output = Command::new("iptables")
            .arg("-w")
            .args(args)
            .output()
            .await
            .context("failed to execute iptables command")?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied { rules: usize },
    Skipped,
}

/// Host egress filter for gateway-filtered spaces.
///
/// Chain layout after a sync:
/// ```text
/// -A DOCKER-USER -j SANDSPACE_EGRESS            (exactly once)
/// -A SANDSPACE_EGRESS -m conntrack --ctstate ESTABLISHED,RELATED -j RETURN
/// -A SANDSPACE_EGRESS -i br-sandspace -d <cidr> -j REJECT   (per range)
/// -A SANDSPACE_EGRESS -j RETURN
/// ```
/// Each sync flushes and rebuilds the chain, so the result depends only on the
/// range list passed in.
pub struct EgressFilter {
    iptables: Arc<dyn Iptables>,
    chain: String,
    hook_chain: String,
    interface: String,
    required: bool,
    lock: Mutex<()>,
}

impl EgressFilter {
    pub fn new(config: &EgressConfig, iptables: Arc<dyn Iptables>) -> Self {
        Self {
            iptables,
            chain: config.chain.clone(),
            hook_chain: config.hook_chain.clone(),
            interface: config.bridge_interface.clone(),
            required: config.required,
            lock: Mutex::new(()),
        }
    }

    pub fn system(config: &EgressConfig) -> Self {
        Self::new(config, Arc::new(SystemIptables))
    }

    pub async fn available(&self) -> bool {
        self.iptables.available().await
    }

    /// Converge the chain onto `ranges`, which must already be de-duplicated.
    #[instrument(skip(self, ranges), fields(ranges = ranges.len()))]
    pub async fn sync(&self, ranges: &[String]) -> Result<SyncOutcome> {
        let _guard = self.lock.lock().await;

        if !self.iptables.available().await {
            if self.required {
                bail!("iptables is not available and egress.required is set");
            }
            warn!("iptables not available, skipping egress filter sync");
            return Ok(SyncOutcome::Skipped);
        }

        self.ensure_chain().await?;
        self.ensure_single_jump().await?;

        self.run_checked(&["-F", &self.chain])
            .await
            .with_context(|| format!("failed to flush chain {}", self.chain))?;

        let rules = generate_chain_rules(&self.interface, ranges);
        for rule in &rules {
            let mut args = vec!["-A".to_string(), self.chain.clone()];
            args.extend(rule.iter().cloned());
            self.run_args_checked(&args)
                .await
                .with_context(|| format!("failed to append rule to {}", self.chain))?;
        }

        info!(chain = %self.chain, rules = rules.len(), "egress filter synced");
        Ok(SyncOutcome::Applied { rules: rules.len() })
    }

    async fn ensure_chain(&self) -> Result<()> {
        let listed = self.run(&["-S", &self.chain]).await?;
        if listed.success {
            return Ok(());
        }
        self.run_checked(&["-N", &self.chain])
            .await
            .with_context(|| format!("failed to create chain {}", self.chain))?;
        debug!(chain = %self.chain, "egress chain created");
        Ok(())
    }

    async fn ensure_single_jump(&self) -> Result<()> {
        let listed = self
            .run_checked(&["-S", &self.hook_chain])
            .await
            .with_context(|| format!("failed to list hook chain {}", self.hook_chain))?;
        let jumps = count_jumps(&listed.stdout, &self.hook_chain, &self.chain);

        if jumps == 0 {
            self.run_checked(&["-I", &self.hook_chain, "1", "-j", &self.chain])
                .await
                .with_context(|| format!("failed to hook {} into {}", self.chain, self.hook_chain))?;
        }
        for _ in 1..jumps.max(1) {
            self.run_checked(&["-D", &self.hook_chain, "-j", &self.chain])
                .await
                .context("failed to remove duplicate egress jump")?;
        }
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.iptables.run(&args).await
    }

    async fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.run_args_checked(&args).await
    }

    async fn run_args_checked(&self, args: &[String]) -> Result<CommandOutput> {
        let output = self.iptables.run(args).await?;
        if !output.success {
            bail!("iptables failed: {}", output.stderr.trim());
        }
        Ok(output)
    }
}

/// Rule bodies (everything after `-A <chain>`) for the egress chain.
pub(crate) fn generate_chain_rules(interface: &str, ranges: &[String]) -> Vec<Vec<String>> {
    let mut rules = Vec::with_capacity(ranges.len() + 2);
    rules.push(
        ["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "RETURN"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    for cidr in ranges {
        rules.push(
            ["-i", interface, "-d", cidr.as_str(), "-j", "REJECT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
    }
    rules.push(vec!["-j".to_string(), "RETURN".to_string()]);
    rules
}

/// Count `-A <hook> -j <chain>` lines in `iptables -S <hook>` output.
pub(crate) fn count_jumps(listing: &str, hook: &str, chain: &str) -> usize {
    let wanted = format!("-A {} -j {}", hook, chain);
    listing.lines().filter(|l| l.trim() == wanted).count()
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use super::*;

    /// In-memory filter table understanding the subset of `iptables` the
    /// egress filter issues.
    pub struct FakeIptables {
        pub available: bool,
        pub chains: Mutex<BTreeMap<String, Vec<String>>>,
        hold_flush: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    }

    impl FakeIptables {
        pub fn with_hook(hook: &str) -> Self {
            let mut chains = BTreeMap::new();
            chains.insert(hook.to_string(), vec!["-j RETURN".to_string()]);
            Self {
                available: true,
                chains: Mutex::new(chains),
                hold_flush: Mutex::new(None),
            }
        }

        /// Park the next `-F`: `entered` fires when it arrives and it runs
        /// once `release` does.
        pub fn hold_next_flush(&self, entered: oneshot::Sender<()>, release: oneshot::Receiver<()>) {
            *self.hold_flush.lock().unwrap() = Some((entered, release));
        }

        pub fn rules(&self, chain: &str) -> Vec<String> {
            self.chains
                .lock()
                .unwrap()
                .get(chain)
                .cloned()
                .unwrap_or_default()
        }
    }

    fn fail(msg: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: msg.to_string(),
        }
    }

    #[async_trait]
    impl Iptables for FakeIptables {
        async fn available(&self) -> bool {
            self.available
        }

        async fn run(&self, args: &[String]) -> Result<CommandOutput> {
            if args.first().map(String::as_str) == Some("-F") {
                let held = self.hold_flush.lock().unwrap().take();
                if let Some((entered, release)) = held {
                    let _ = entered.send(());
                    let _ = release.await;
                }
            }
            let mut chains = self.chains.lock().unwrap();
            let op = args.first().map(String::as_str).unwrap_or("");
            let chain = args.get(1).cloned().unwrap_or_default();
            let ok = |stdout: String| CommandOutput {
                success: true,
                stdout,
                stderr: String::new(),
            };
            match op {
                "-S" => match chains.get(&chain) {
                    Some(rules) => {
                        let mut out = format!("-N {}\n", chain);
                        for r in rules {
                            out.push_str(&format!("-A {} {}\n", chain, r));
                        }
                        Ok(ok(out))
                    }
                    None => Ok(fail("iptables: No chain/target/match by that name.")),
                },
                "-N" => {
                    if chains.contains_key(&chain) {
                        return Ok(fail("iptables: Chain already exists."));
                    }
                    chains.insert(chain, Vec::new());
                    Ok(ok(String::new()))
                }
                "-F" => match chains.get_mut(&chain) {
                    Some(rules) => {
                        rules.clear();
                        Ok(ok(String::new()))
                    }
                    None => Ok(fail("iptables: No chain/target/match by that name.")),
                },
                "-A" => match chains.get_mut(&chain) {
                    Some(rules) => {
                        rules.push(args[2..].join(" "));
                        Ok(ok(String::new()))
                    }
                    None => Ok(fail("iptables: No chain/target/match by that name.")),
                },
                "-I" => {
                    let pos: usize = args.get(2).and_then(|p| p.parse().ok()).unwrap_or(1);
                    match chains.get_mut(&chain) {
                        Some(rules) => {
                            let at = (pos - 1).min(rules.len());
                            rules.insert(at, args[3..].join(" "));
                            Ok(ok(String::new()))
                        }
                        None => Ok(fail("iptables: No chain/target/match by that name.")),
                    }
                }
                "-D" => {
                    let rule = args[2..].join(" ");
                    match chains.get_mut(&chain) {
                        Some(rules) => match rules.iter().position(|r| *r == rule) {
                            Some(i) => {
                                rules.remove(i);
                                Ok(ok(String::new()))
                            }
                            None => Ok(fail("iptables: Bad rule (does a matching rule exist in that chain?).")),
                        },
                        None => Ok(fail("iptables: No chain/target/match by that name.")),
                    }
                }
                other => Ok(fail(&format!("unsupported op {}", other))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeIptables;
    use super::*;

    fn filter(table: Arc<FakeIptables>) -> EgressFilter {
        EgressFilter::new(&EgressConfig::default(), table)
    }

    fn ranges(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_generate_chain_rules_order() {
        let rules = generate_chain_rules("br-sandspace", &ranges(&["10.0.0.0/8", "192.168.0.0/16"]));
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0].join(" "),
            "-m conntrack --ctstate ESTABLISHED,RELATED -j RETURN"
        );
        assert_eq!(rules[1].join(" "), "-i br-sandspace -d 10.0.0.0/8 -j REJECT");
        assert_eq!(rules[2].join(" "), "-i br-sandspace -d 192.168.0.0/16 -j REJECT");
        assert_eq!(rules[3].join(" "), "-j RETURN");
    }

    #[test]
    fn test_count_jumps() {
        let listing = "-N DOCKER-USER\n-A DOCKER-USER -j SANDSPACE_EGRESS\n-A DOCKER-USER -j RETURN\n-A DOCKER-USER -j SANDSPACE_EGRESS\n";
        assert_eq!(count_jumps(listing, "DOCKER-USER", "SANDSPACE_EGRESS"), 2);
        assert_eq!(count_jumps("-N DOCKER-USER\n", "DOCKER-USER", "SANDSPACE_EGRESS"), 0);
    }

    #[tokio::test]
    async fn sync_is_convergent() {
        let table = Arc::new(FakeIptables::with_hook("DOCKER-USER"));
        let egress = filter(table.clone());

        egress.sync(&ranges(&["1.1.1.0/24", "2.2.2.0/24"])).await.unwrap();
        egress.sync(&ranges(&["2.2.2.0/24", "3.3.3.0/24"])).await.unwrap();

        assert_eq!(
            table.rules("SANDSPACE_EGRESS"),
            vec![
                "-m conntrack --ctstate ESTABLISHED,RELATED -j RETURN",
                "-i br-sandspace -d 2.2.2.0/24 -j REJECT",
                "-i br-sandspace -d 3.3.3.0/24 -j REJECT",
                "-j RETURN",
            ]
        );
        let hook = table.rules("DOCKER-USER");
        assert_eq!(hook.iter().filter(|r| *r == "-j SANDSPACE_EGRESS").count(), 1);
        assert_eq!(hook[0], "-j SANDSPACE_EGRESS");
    }

    #[tokio::test]
    async fn sync_removes_duplicate_jumps() {
        let table = Arc::new(FakeIptables::with_hook("DOCKER-USER"));
        {
            let mut chains = table.chains.lock().unwrap();
            chains.insert("SANDSPACE_EGRESS".into(), Vec::new());
            let hook = chains.get_mut("DOCKER-USER").unwrap();
            hook.insert(0, "-j SANDSPACE_EGRESS".into());
            hook.insert(0, "-j SANDSPACE_EGRESS".into());
        }
        filter(table.clone()).sync(&[]).await.unwrap();
        let hook = table.rules("DOCKER-USER");
        assert_eq!(hook.iter().filter(|r| *r == "-j SANDSPACE_EGRESS").count(), 1);
        assert_eq!(
            table.rules("SANDSPACE_EGRESS"),
            vec!["-m conntrack --ctstate ESTABLISHED,RELATED -j RETURN", "-j RETURN"]
        );
    }

    #[tokio::test]
    async fn sync_skips_without_iptables() {
        let mut table = FakeIptables::with_hook("DOCKER-USER");
        table.available = false;
        let outcome = filter(Arc::new(table)).sync(&ranges(&["10.0.0.0/8"])).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);
    }

    #[tokio::test]
    async fn sync_fails_without_iptables_when_required() {
        let mut table = FakeIptables::with_hook("DOCKER-USER");
        table.available = false;
        let config = EgressConfig {
            required: true,
            ..Default::default()
        };
        let egress = EgressFilter::new(&config, Arc::new(table));
        assert!(egress.sync(&[]).await.is_err());
    }

    #[tokio::test]
    async fn sync_fails_without_hook_chain() {
        let table = Arc::new(FakeIptables::with_hook("OTHER"));
        let err = filter(table).sync(&[]).await.unwrap_err();
        assert!(format!("{:#}", err).contains("DOCKER-USER"));
    }
}
