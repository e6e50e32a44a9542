use async_trait::async_trait;

use crate::error::Result;
use crate::model::IpVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Filter, Table::Nat, Table::Mangle];

    pub fn name(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
            Self::Mangle => "mangle",
        }
    }
}

/// A chain owned by the agent, hooked from a built-in chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedChain {
    pub version: IpVersion,
    pub table: Table,
    pub name: String,
    /// Built-in chain that jumps into this one, e.g. `POSTROUTING`.
    pub hook: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub version: IpVersion,
    pub table: Table,
    pub chain: String,
    pub spec: String,
}

/// A set of chain resets and rule additions committed as one unit.
///
/// Every chain listed in [`chains`](Self::chains) is emptied and rebuilt from
/// [`rules`](Self::rules); chains not listed are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleBatch {
    chains: Vec<OwnedChain>,
    rules: Vec<FirewallRule>,
}

impl RuleBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty `name` (creating it if needed) and make sure `hook` jumps to it.
    pub fn empty_chain(
        &mut self,
        version: IpVersion,
        table: Table,
        name: &str,
        hook: &'static str,
    ) {
        let exists = self
            .chains
            .iter()
            .any(|c| c.version == version && c.table == table && c.name == name);
        if !exists {
            self.chains.push(OwnedChain {
                version,
                table,
                name: name.to_string(),
                hook,
            });
        }
    }

    pub fn add_rule(&mut self, version: IpVersion, table: Table, chain: &str, spec: String) {
        self.rules.push(FirewallRule {
            version,
            table,
            chain: chain.to_string(),
            spec,
        });
    }

    pub fn chains(&self) -> &[OwnedChain] {
        &self.chains
    }

    pub fn rules(&self) -> &[FirewallRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty() && self.rules.is_empty()
    }

    /// IP versions touched by this batch, in ascending order.
    pub fn versions(&self) -> Vec<IpVersion> {
        let mut versions: Vec<IpVersion> = self
            .chains
            .iter()
            .map(|c| c.version)
            .chain(self.rules.iter().map(|r| r.version))
            .collect();
        versions.sort();
        versions.dedup();
        versions
    }
}

/// Commits rule batches inside a namespace.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Apply `batch` atomically: either every change becomes visible or none does.
    async fn apply(&self, namespace: &str, batch: &RuleBatch) -> Result<()>;
}
