//! Per-VM packet-filter chains in the kernel's bridge family.
//!
//! One table `bridge infinivirt` holds a base chain `forward` hooked at
//! forward priority 0 (policy accept) plus one chain per VM. A VM's filter
//! presence moves through `absent → chain-only → chain+jumps → chain-only →
//! absent`: the chain persists across stop/start, only the jump rules from
//! the base chain toggle with the VM's process.
//!
//! The kernel evaluates rules in append order, so priority is enforced by
//! sort-then-append. Every mutation ends with a mirror of the whole table to
//! the persistence file.

pub mod persist;
pub mod translate;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use infinivirt_core::firewall::{FirewallRule, RuleDirection};
use infinivirt_core::naming;
use infinivirt_core::retry::{RetryPolicy, is_busy_error, retry_if};

use crate::exec;
use persist::PersistFile;

pub const FAMILY: &str = "bridge";
pub const TABLE: &str = "infinivirt";
pub const BASE_CHAIN: &str = "forward";

/// Wait for the kernel to settle between jump removal, flush, and delete.
const CHAIN_SETTLE: Duration = Duration::from_millis(500);

const CHAIN_DELETE_RETRY: RetryPolicy = RetryPolicy::new(5, Duration::from_millis(500));

/// Outcome of one rule-application pass.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub changed: bool,
    pub total: usize,
    pub applied: usize,
    pub failed: usize,
    pub failures: Vec<String>,
}

impl ApplyOutcome {
    fn unchanged(total: usize) -> Self {
        Self {
            changed: false,
            total,
            applied: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }
}

pub struct FilterService {
    persist: PersistFile,
    /// Per-VM hash of the last successfully applied rule set.
    rule_hashes: Mutex<HashMap<String, String>>,
}

impl FilterService {
    pub fn new(persist_path: PathBuf) -> Self {
        Self {
            persist: PersistFile::new(persist_path),
            rule_hashes: Mutex::new(HashMap::new()),
        }
    }

    async fn nft(&self, args: &[&str]) -> Result<()> {
        exec::run_ok("nft", args).await
    }

    async fn nft_exists(&self, args: &[&str]) -> Result<bool> {
        exec::succeeds("nft", args).await
    }

    /// Create the table and base chain if absent. On base-chain creation,
    /// three stateless DHCP-allow rules are *inserted* so they stay ahead of
    /// any later jump rules.
    pub async fn initialize(&self) -> Result<()> {
        if !self.nft_exists(&["list", "table", FAMILY, TABLE]).await? {
            self.nft(&["add", "table", FAMILY, TABLE]).await?;
            info!(table = TABLE, "packet-filter table created");
        }

        if !self
            .nft_exists(&["list", "chain", FAMILY, TABLE, BASE_CHAIN])
            .await?
        {
            self.nft(&[
                "add", "chain", FAMILY, TABLE, BASE_CHAIN, "{", "type", "filter", "hook",
                "forward", "priority", "0", ";", "policy", "accept", ";", "}",
            ])
            .await?;

            // DHCP must keep working regardless of what per-VM rules say.
            self.nft(&[
                "insert", "rule", FAMILY, TABLE, BASE_CHAIN, "udp", "dport", "67", "accept",
                "comment", "\"dhcp client to server\"",
            ])
            .await?;
            self.nft(&[
                "insert", "rule", FAMILY, TABLE, BASE_CHAIN, "udp", "dport", "68", "accept",
                "comment", "\"dhcp server to client\"",
            ])
            .await?;
            self.nft(&[
                "insert", "rule", FAMILY, TABLE, BASE_CHAIN, "ether", "daddr",
                "ff:ff:ff:ff:ff:ff", "udp", "dport", "67", "accept", "comment",
                "\"dhcp broadcast\"",
            ])
            .await?;
            info!(chain = BASE_CHAIN, "base chain created with DHCP allows");
        }

        self.export().await;
        Ok(())
    }

    /// Idempotent creation of a VM's chain. Does not wire jump rules.
    pub async fn ensure_vm_chain(&self, vm_id: &str) -> Result<String> {
        let chain = naming::chain_name(vm_id);
        if !self
            .nft_exists(&["list", "chain", FAMILY, TABLE, &chain])
            .await?
        {
            self.nft(&["add", "chain", FAMILY, TABLE, &chain]).await?;
            debug!(chain, "VM chain created");
        }
        Ok(chain)
    }

    /// Wire base-chain jumps for both directions of a VM's TAP device.
    /// An already-present jump is success.
    pub async fn attach_jump_rules(&self, vm_id: &str, tap: &str) -> Result<()> {
        let chain = naming::chain_name(vm_id);
        let existing = self.list_base_rules().await.unwrap_or_default();

        for selector in ["oifname", "iifname"] {
            let quoted = format!("\"{}\"", tap);
            let marker = format!("{} {} jump {}", selector, quoted, chain);
            if existing.iter().any(|line| line.contains(&marker)) {
                continue;
            }
            let result = self
                .nft(&[
                    "add", "rule", FAMILY, TABLE, BASE_CHAIN, selector, &quoted, "jump", &chain,
                ])
                .await;
            if let Err(e) = result {
                if format!("{:#}", e).to_lowercase().contains("file exists") {
                    continue;
                }
                return Err(e).with_context(|| format!("Failed to attach jump to {}", chain));
            }
        }

        self.export().await;
        Ok(())
    }

    /// Remove every base-chain rule that jumps to this VM's chain.
    /// Best-effort: individual delete failures are logged, not raised.
    pub async fn detach_jump_rules(&self, vm_id: &str) -> Result<()> {
        let chain = naming::chain_name(vm_id);
        for handle in self.jump_handles(&chain).await? {
            let handle_str = handle.to_string();
            if let Err(e) = self
                .nft(&["delete", "rule", FAMILY, TABLE, BASE_CHAIN, "handle", &handle_str])
                .await
            {
                warn!(chain, handle, error = %e, "failed to remove jump rule");
            }
        }
        self.export().await;
        Ok(())
    }

    /// Chain plus jumps in one call, for VM start.
    pub async fn create_vm_chain(&self, vm_id: &str, tap: &str) -> Result<String> {
        let chain = self.ensure_vm_chain(vm_id).await?;
        self.attach_jump_rules(vm_id, tap).await?;
        Ok(chain)
    }

    /// Merge, order, and apply the effective rule set for a VM.
    ///
    /// The chain is flushed and rebuilt: merged department + VM rules, plus
    /// the synthetic established/related tail, appended in ascending
    /// priority. Per-rule failures are counted without aborting the pass.
    pub async fn apply_rules(
        &self,
        vm_id: &str,
        tap: &str,
        dept_rules: &[FirewallRule],
        vm_rules: &[FirewallRule],
    ) -> Result<ApplyOutcome> {
        let chain = self.ensure_vm_chain(vm_id).await?;
        self.nft(&["flush", "chain", FAMILY, TABLE, &chain])
            .await
            .with_context(|| format!("Failed to flush chain {}", chain))?;

        let rules = effective_rule_set(dept_rules, vm_rules);
        let mut outcome = ApplyOutcome {
            changed: true,
            total: rules.len(),
            applied: 0,
            failed: 0,
            failures: Vec::new(),
        };

        for rule in &rules {
            match self.append_rule(&chain, rule, tap).await {
                Ok(()) => outcome.applied += 1,
                Err(e) => {
                    outcome.failed += 1;
                    outcome.failures.push(format!("{}: {:#}", rule.name, e));
                    warn!(rule = %rule.name, error = %e, "rule application failed");
                }
            }
        }

        self.export().await;
        info!(
            chain,
            total = outcome.total,
            applied = outcome.applied,
            failed = outcome.failed,
            "rule set applied"
        );
        Ok(outcome)
    }

    /// Apply only when the effective rule set differs from the last one
    /// successfully applied for this VM.
    pub async fn apply_rules_if_changed(
        &self,
        vm_id: &str,
        tap: &str,
        dept_rules: &[FirewallRule],
        vm_rules: &[FirewallRule],
    ) -> Result<ApplyOutcome> {
        let rules = effective_rule_set(dept_rules, vm_rules);
        let hash = rule_set_hash(&rules)?;

        if self
            .rule_hashes
            .lock()
            .unwrap()
            .get(vm_id)
            .is_some_and(|cached| *cached == hash)
        {
            debug!(vm_id, "rule set unchanged, skipping apply");
            return Ok(ApplyOutcome::unchanged(rules.len()));
        }

        let outcome = self.apply_rules(vm_id, tap, dept_rules, vm_rules).await?;
        if outcome.failed == 0 {
            self.rule_hashes
                .lock()
                .unwrap()
                .insert(vm_id.to_string(), hash);
        }
        Ok(outcome)
    }

    /// Tear down a VM's chain: jumps off, settle, verify, flush, settle,
    /// delete under busy-retry. A chain that is already gone is benign.
    pub async fn remove_vm_chain(&self, vm_id: &str) -> Result<()> {
        let chain = naming::chain_name(vm_id);

        self.detach_jump_rules(vm_id).await?;
        tokio::time::sleep(CHAIN_SETTLE).await;

        // Late joiners (a racing start, an unflushed batch) may have re-added
        // a jump while we slept.
        if !self.jump_handles(&chain).await?.is_empty() {
            warn!(chain, "residual jump rules found, detaching again");
            self.detach_jump_rules(vm_id).await?;
        }

        self.flush_chain_benign(&chain).await;
        tokio::time::sleep(CHAIN_SETTLE).await;

        let delete = retry_if(CHAIN_DELETE_RETRY, "chain delete", is_busy_error, || async {
            self.delete_chain_benign(&chain).await
        })
        .await;

        if let Err(e) = delete {
            if is_busy_error(&e) {
                // Last resort: a jump handle the enumeration missed is
                // pinning the chain. Strip by handle and try once more.
                warn!(chain, "chain still busy, removing orphan jumps by handle");
                for handle in self.jump_handles(&chain).await.unwrap_or_default() {
                    let handle_str = handle.to_string();
                    let _ = self
                        .nft(&["delete", "rule", FAMILY, TABLE, BASE_CHAIN, "handle", &handle_str])
                        .await;
                }
                self.delete_chain_benign(&chain).await?;
            } else {
                return Err(e);
            }
        }

        self.rule_hashes.lock().unwrap().remove(vm_id);
        self.export().await;
        info!(chain, "VM chain removed");
        Ok(())
    }

    /// Names of every chain in the table.
    pub async fn list_chains(&self) -> Result<Vec<String>> {
        let listing = exec::run_stdout("nft", &["list", "table", FAMILY, TABLE]).await?;
        Ok(listing
            .lines()
            .filter_map(|line| {
                let trimmed = line.trim_start();
                trimmed
                    .strip_prefix("chain ")
                    .and_then(|rest| rest.split_whitespace().next())
                    .map(|name| name.to_string())
            })
            .collect())
    }

    pub async fn chain_exists(&self, name: &str) -> Result<bool> {
        self.nft_exists(&["list", "chain", FAMILY, TABLE, name]).await
    }

    /// Load the persisted ruleset back into the kernel (host boot).
    pub async fn reload_persisted(&self) -> Result<()> {
        let _ = self.persist.read_validated()?;
        let path = self.persist.path().display().to_string();
        self.nft(&["-f", &path])
            .await
            .with_context(|| format!("Failed to reload ruleset from {}", path))?;
        info!(path, "persisted ruleset reloaded");
        Ok(())
    }

    async fn append_rule(&self, chain: &str, rule: &FirewallRule, tap: &str) -> Result<()> {
        let directions: &[RuleDirection] = match rule.direction {
            RuleDirection::InOut => &[RuleDirection::In, RuleDirection::Out],
            RuleDirection::In => &[RuleDirection::In],
            RuleDirection::Out => &[RuleDirection::Out],
        };

        for direction in directions {
            let mut directed = rule.clone();
            directed.direction = *direction;
            let tokens = translate::translate(&directed, tap)
                .map_err(|e| anyhow::anyhow!("{}", e))?;

            let mut args = vec!["add", "rule", FAMILY, TABLE, chain];
            args.extend(tokens.iter().map(|t| t.as_str()));
            self.nft(&args).await?;
        }
        Ok(())
    }

    async fn list_base_rules(&self) -> Result<Vec<String>> {
        let listing =
            exec::run_stdout("nft", &["-a", "list", "chain", FAMILY, TABLE, BASE_CHAIN]).await?;
        Ok(listing.lines().map(|l| l.to_string()).collect())
    }

    /// Handles of base-chain rules jumping to `chain`.
    async fn jump_handles(&self, chain: &str) -> Result<Vec<u64>> {
        let mut handles = Vec::new();
        for line in self.list_base_rules().await? {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let jumps_here = tokens
                .windows(2)
                .any(|w| w[0] == "jump" && w[1] == chain);
            if !jumps_here {
                continue;
            }
            if let Some(idx) = line.rfind("# handle ")
                && let Ok(handle) = line[idx + "# handle ".len()..].trim().parse::<u64>()
            {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    async fn flush_chain_benign(&self, chain: &str) {
        match exec::run("nft", &["flush", "chain", FAMILY, TABLE, chain]).await {
            Ok(output) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !is_missing(&stderr) {
                    warn!(chain, stderr = %stderr.trim(), "chain flush failed");
                }
            }
            Err(e) => warn!(chain, error = %e, "chain flush failed"),
            _ => {}
        }
    }

    async fn delete_chain_benign(&self, chain: &str) -> Result<()> {
        let output = exec::run("nft", &["delete", "chain", FAMILY, TABLE, chain]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                debug!(chain, "chain already gone on delete");
                return Ok(());
            }
            anyhow::bail!("nft delete chain {} failed: {}", chain, stderr.trim());
        }
        Ok(())
    }

    /// Mirror the kernel table to disk. Best-effort: a failed mirror must
    /// not fail the kernel mutation that already happened.
    async fn export(&self) {
        match exec::run_stdout("nft", &["list", "table", FAMILY, TABLE]).await {
            Ok(listing) => {
                if let Err(e) = self.persist.write(&listing) {
                    warn!(error = %e, "failed to persist ruleset");
                }
            }
            Err(e) => warn!(error = %e, "failed to list table for persistence"),
        }
    }
}

fn is_missing(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("no such file or directory") || s.contains("does not exist")
}

/// Merge department and VM rules, append the synthetic return-traffic rule,
/// and stable-sort ascending by priority. The resulting order *is* the
/// kernel evaluation order.
pub fn effective_rule_set(
    dept_rules: &[FirewallRule],
    vm_rules: &[FirewallRule],
) -> Vec<FirewallRule> {
    let mut merged: Vec<FirewallRule> = dept_rules
        .iter()
        .filter(|dept| {
            !vm_rules.iter().any(|vm| {
                vm.overrides_dept
                    && vm.direction == dept.direction
                    && vm.protocol.eq_ignore_ascii_case(&dept.protocol)
            })
        })
        .cloned()
        .collect();
    merged.extend(vm_rules.iter().cloned());
    merged.push(FirewallRule::default_return_traffic());
    merged.sort_by_key(|r| r.priority);
    merged
}

/// SHA-256 over the stable JSON of the effective rule set.
pub fn rule_set_hash(rules: &[FirewallRule]) -> Result<String> {
    let json = serde_json::to_string(rules).context("Failed to serialize rule set")?;
    let digest = Sha256::digest(json.as_bytes());
    Ok(format!("{:x}", digest))
}
