//! [`FirewallBackend`] committing batches with `iptables-restore -n`.
//!
//! A batch becomes one restore payload per IP version, so a commit is atomic
//! per family only: IPv4 is restored first and stays applied when the IPv6
//! restore fails. Declaring a chain in
//! the payload empties it under `--noflush`, and chains the batch does not
//! name are left alone. Jumps from the built-in hook chains are added
//! afterwards, once per chain.

use async_trait::async_trait;
use dvr::{DvrError, FirewallBackend, IpVersion, OwnedChain, Result, RuleBatch, Table};
use tracing::{debug, info};

use crate::command::{Privilege, exec, exec_with_stdin};

#[derive(Debug, Clone)]
pub struct IptablesBackend {
    privilege: Privilege,
}

impl IptablesBackend {
    pub fn new(privilege: Privilege) -> Self {
        Self { privilege }
    }

    async fn restore(&self, namespace: &str, version: IpVersion, payload: &str) -> Result<()> {
        let program = restore_program(version);
        exec_with_stdin(
            "ip",
            &["netns", "exec", namespace, program, "-n"],
            self.privilege,
            payload,
        )
        .await
        .map_err(|e| DvrError::Firewall(format!("{namespace}: {e}")))?;
        Ok(())
    }

    /// Add the jump from `chain.hook` to `chain` unless it is already there.
    async fn ensure_hook(&self, namespace: &str, chain: &OwnedChain) -> Result<()> {
        let program = iptables_program(chain.version);
        let check = hook_args(chain, "-C");
        let mut args = vec!["netns", "exec", namespace, program];
        args.extend(check.iter().map(String::as_str));
        if exec("ip", &args, self.privilege).await.is_ok() {
            return Ok(());
        }

        let insert = hook_args(chain, "-I");
        let mut args = vec!["netns", "exec", namespace, program];
        args.extend(insert.iter().map(String::as_str));
        exec("ip", &args, self.privilege)
            .await
            .map_err(|e| DvrError::Firewall(format!("{namespace}: {e}")))?;
        debug!(namespace = %namespace, chain = %chain.name, hook = %chain.hook, "chain hooked");
        Ok(())
    }
}

fn restore_program(version: IpVersion) -> &'static str {
    match version {
        IpVersion::V4 => "iptables-restore",
        IpVersion::V6 => "ip6tables-restore",
    }
}

fn iptables_program(version: IpVersion) -> &'static str {
    match version {
        IpVersion::V4 => "iptables",
        IpVersion::V6 => "ip6tables",
    }
}

fn hook_args(chain: &OwnedChain, op: &str) -> Vec<String> {
    [
        "-w",
        "-t",
        chain.table.name(),
        op,
        chain.hook,
        "-j",
        chain.name.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Restore payload for the `version` part of `batch`.
///
/// Tables the batch does not touch for this version are omitted.
pub fn render_restore(batch: &RuleBatch, version: IpVersion) -> String {
    let mut out = String::new();
    for table in Table::ALL {
        let chains: Vec<&OwnedChain> = batch
            .chains()
            .iter()
            .filter(|c| c.version == version && c.table == table)
            .collect();
        let rules: Vec<_> = batch
            .rules()
            .iter()
            .filter(|r| r.version == version && r.table == table)
            .collect();
        if chains.is_empty() && rules.is_empty() {
            continue;
        }
        out.push('*');
        out.push_str(table.name());
        out.push('\n');
        for chain in chains {
            out.push_str(&format!(":{} - [0:0]\n", chain.name));
        }
        for rule in rules {
            out.push_str(&format!("-A {} {}\n", rule.chain, rule.spec));
        }
        out.push_str("COMMIT\n");
    }
    out
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    /// Restores each family in turn and stops at the first failure.
    async fn apply(&self, namespace: &str, batch: &RuleBatch) -> Result<()> {
        for version in batch.versions() {
            let payload = render_restore(batch, version);
            self.restore(namespace, version, &payload).await?;
        }
        for chain in batch.chains() {
            self.ensure_hook(namespace, chain).await?;
        }
        info!(
            namespace = %namespace,
            chains = batch.chains().len(),
            rules = batch.rules().len(),
            "firewall batch applied"
        );
        Ok(())
    }
}
