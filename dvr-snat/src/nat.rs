//! SNAT and address scope rules of one namespace.
//!
//! Rules are staged in a [`DeferredBatch`] and only reach the firewall on
//! [`DeferredBatch::commit`]. A batch dropped before commit changes nothing.

use std::sync::Arc;

use dvr::{FirewallBackend, IpVersion, Port, Result, RuleBatch, Table};
use tracing::{debug, info};

use crate::scope::ScopeMark;

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

/// Accepts traffic that neither enters nor leaves through the gateway.
pub const POST_CHAIN: &str = "dvr-post";
/// Source-NATs traffic leaving through the gateway.
pub const SNAT_CHAIN: &str = "dvr-snat";
/// Marks traffic arriving on the gateway.
pub const MARK_CHAIN: &str = "dvr-mark";
/// Address scope marking (mangle) and enforcement (filter).
pub const SCOPE_CHAIN: &str = "dvr-scope";

/// Mark set on traffic that arrived through the external gateway.
const GATEWAY_MARK: &str = "0x2/0xffff";

#[derive(Clone)]
pub struct NatRuleManager {
    namespace: String,
    backend: Arc<dyn FirewallBackend>,
    use_ipv6: bool,
}

impl std::fmt::Debug for NatRuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatRuleManager")
            .field("namespace", &self.namespace)
            .field("use_ipv6", &self.use_ipv6)
            .finish_non_exhaustive()
    }
}

impl NatRuleManager {
    pub fn new(namespace: impl Into<String>, backend: Arc<dyn FirewallBackend>, use_ipv6: bool) -> Self {
        Self {
            namespace: namespace.into(),
            backend,
            use_ipv6,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Open a batch. Nothing is applied until it is committed.
    pub fn begin(&self) -> DeferredBatch<'_> {
        DeferredBatch {
            manager: self,
            batch: RuleBatch::new(),
        }
    }

    fn versions(&self) -> &'static [IpVersion] {
        if self.use_ipv6 {
            &[IpVersion::V4, IpVersion::V6]
        } else {
            &[IpVersion::V4]
        }
    }
}

#[must_use = "a deferred batch does nothing unless committed"]
pub struct DeferredBatch<'a> {
    manager: &'a NatRuleManager,
    batch: RuleBatch,
}

impl DeferredBatch<'_> {
    /// Reset the SNAT chains so the rules below rebuild them from scratch.
    pub fn empty_snat_chains(&mut self) {
        let v4 = IpVersion::V4;
        self.batch.empty_chain(v4, Table::Nat, POST_CHAIN, "POSTROUTING");
        self.batch.empty_chain(v4, Table::Nat, SNAT_CHAIN, "POSTROUTING");
        self.batch.empty_chain(v4, Table::Mangle, MARK_CHAIN, "PREROUTING");
    }

    /// SNAT everything leaving through `gw_device` to the gateway port's
    /// first IPv4 address. A gateway without IPv4 gets no rules.
    pub fn add_snat_rules(&mut self, gw_device: &str, gw_port: &Port) {
        let Some(ip) = gw_port.first_ip(IpVersion::V4).map(|ip| ip.ip_address) else {
            debug!(port_id = %gw_port.id, "gateway has no IPv4 address, no SNAT rules");
            return;
        };
        let v4 = IpVersion::V4;
        self.batch.add_rule(
            v4,
            Table::Nat,
            POST_CHAIN,
            format!("! -i {gw_device} ! -o {gw_device} -m conntrack ! --ctstate DNAT -j ACCEPT"),
        );
        self.batch.add_rule(
            v4,
            Table::Nat,
            SNAT_CHAIN,
            format!("-o {gw_device} -j SNAT --to-source {ip}"),
        );
        self.batch.add_rule(
            v4,
            Table::Nat,
            SNAT_CHAIN,
            format!("-m mark ! --mark {GATEWAY_MARK} -m conntrack --ctstate DNAT -j SNAT --to-source {ip}"),
        );
        self.batch.add_rule(
            v4,
            Table::Mangle,
            MARK_CHAIN,
            format!("-i {gw_device} -j MARK --set-xmark {GATEWAY_MARK}"),
        );
    }

    /// Replace the scope chains with the marks in `marks`.
    pub fn add_scope_marks(&mut self, marks: &ScopeMark) {
        for &version in self.manager.versions() {
            self.batch
                .empty_chain(version, Table::Mangle, SCOPE_CHAIN, "PREROUTING");
            self.batch
                .empty_chain(version, Table::Filter, SCOPE_CHAIN, "FORWARD");
            for (device, mark) in marks.get(version) {
                self.batch.add_rule(
                    version,
                    Table::Mangle,
                    SCOPE_CHAIN,
                    format!("-i {device} -j MARK --set-xmark {mark}"),
                );
                self.batch.add_rule(
                    version,
                    Table::Filter,
                    SCOPE_CHAIN,
                    format!("-o {device} -m mark ! --mark {mark} -j DROP"),
                );
            }
        }
    }

    pub fn batch(&self) -> &RuleBatch {
        &self.batch
    }

    /// Apply every staged change at once.
    pub async fn commit(self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let namespace = self.manager.namespace();
        self.manager.backend.apply(namespace, &self.batch).await?;
        info!(
            namespace = %namespace,
            chains = self.batch.chains().len(),
            rules = self.batch.rules().len(),
            "firewall batch committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use dvr::{AddressScopes, FixedIp};

    use super::*;
    use crate::testing::RecordingFirewall;

    fn gw_port() -> Port {
        Port {
            id: "gw".into(),
            network_id: "ext".into(),
            mac_address: "fa:16:3e:00:00:99".into(),
            fixed_ips: vec![
                FixedIp {
                    subnet_id: "ext6".into(),
                    ip_address: "2001:db8::5".parse().unwrap(),
                    prefixlen: 64,
                },
                FixedIp {
                    subnet_id: "ext4".into(),
                    ip_address: "203.0.113.5".parse().unwrap(),
                    prefixlen: 24,
                },
            ],
            mtu: None,
            subnets: Vec::new(),
            address_scopes: AddressScopes::default(),
        }
    }

    fn manager(fw: &Arc<RecordingFirewall>, use_ipv6: bool) -> NatRuleManager {
        NatRuleManager::new("snat-r1", fw.clone(), use_ipv6)
    }

    #[tokio::test]
    async fn dropped_batch_applies_nothing() {
        let fw = Arc::new(RecordingFirewall::new());
        let nat = manager(&fw, true);
        {
            let mut batch = nat.begin();
            batch.empty_snat_chains();
            batch.add_snat_rules("qg-gw", &gw_port());
        }
        assert!(fw.batches().is_empty());
    }

    #[tokio::test]
    async fn snat_rules_use_first_ipv4() {
        let fw = Arc::new(RecordingFirewall::new());
        let nat = manager(&fw, true);
        let mut batch = nat.begin();
        batch.empty_snat_chains();
        batch.add_snat_rules("qg-gw", &gw_port());
        batch.commit().await.unwrap();

        let chains = fw.chains("snat-r1");
        let snat = &chains[&(IpVersion::V4, Table::Nat, SNAT_CHAIN.to_string())];
        assert_eq!(snat[0], "-o qg-gw -j SNAT --to-source 203.0.113.5");
        assert_eq!(snat.len(), 2);
        assert_eq!(
            chains[&(IpVersion::V4, Table::Mangle, MARK_CHAIN.to_string())],
            vec!["-i qg-gw -j MARK --set-xmark 0x2/0xffff".to_string()]
        );
    }

    #[tokio::test]
    async fn rebuild_replaces_previous_rules() {
        let fw = Arc::new(RecordingFirewall::new());
        let nat = manager(&fw, false);

        let mut batch = nat.begin();
        batch.empty_snat_chains();
        batch.add_snat_rules("qg-old", &gw_port());
        batch.commit().await.unwrap();

        let mut batch = nat.begin();
        batch.empty_snat_chains();
        batch.add_snat_rules("qg-new", &gw_port());
        batch.commit().await.unwrap();

        let chains = fw.chains("snat-r1");
        let all: Vec<&String> = chains.values().flatten().collect();
        assert!(all.iter().all(|r| !r.contains("qg-old")), "{all:?}");
        assert!(all.iter().any(|r| r.contains("qg-new")));
    }

    #[tokio::test]
    async fn scope_marks_respect_ipv6_switch() {
        let fw = Arc::new(RecordingFirewall::new());
        let marks = ScopeMark {
            v4: BTreeMap::from([("qr-a".to_string(), "0x4000000/0xffff0000".to_string())]),
            v6: BTreeMap::from([("qr-a".to_string(), "0x4000000/0xffff0000".to_string())]),
        };

        let nat = manager(&fw, false);
        let mut batch = nat.begin();
        batch.add_scope_marks(&marks);
        assert_eq!(batch.batch().versions(), vec![IpVersion::V4]);
        assert_eq!(batch.batch().rules().len(), 2);

        let nat = manager(&fw, true);
        let mut batch = nat.begin();
        batch.add_scope_marks(&marks);
        assert_eq!(batch.batch().rules().len(), 4);
        batch.commit().await.unwrap();
    }

    #[tokio::test]
    async fn failed_commit_surfaces_error() {
        let fw = Arc::new(RecordingFirewall::new());
        fw.set_failing(true);
        let nat = manager(&fw, false);
        let mut batch = nat.begin();
        batch.empty_snat_chains();
        assert!(batch.commit().await.is_err());
        assert!(fw.batches().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_not_sent() {
        let fw = Arc::new(RecordingFirewall::new());
        manager(&fw, true).begin().commit().await.unwrap();
        assert!(fw.batches().is_empty());
    }
}
