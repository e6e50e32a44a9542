//! Link-local addressing of the router/SNAT veth link.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};

use dvr::{DvrError, IpNetwork, Result};
use ipnetwork::Ipv4Network;

/// Default pool: a single /31 shared by every router.
pub const SNAT_LL_SUBNET: &str = "169.254.128.128/31";
pub const ROUTER_2_SNAT_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 128, 128);
pub const SNAT_2_ROUTER_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 128, 129);
/// Routing table holding the default route towards the SNAT namespace.
pub const SNAT_RT_TBL: u32 = 18;

const PAIR_PREFIX: u8 = 31;

/// Two addresses of one /31: the router end and the SNAT end of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLocalAddressPair {
    /// Even-aligned first address of the /31.
    base: Ipv4Addr,
}

impl Default for LinkLocalAddressPair {
    fn default() -> Self {
        Self {
            base: ROUTER_2_SNAT_IP,
        }
    }
}

impl LinkLocalAddressPair {
    pub fn from_subnet(subnet: Ipv4Network) -> Result<Self> {
        if subnet.prefix() != PAIR_PREFIX {
            return Err(DvrError::InvalidAddress(format!(
                "link-local pair needs a /{PAIR_PREFIX}, got {subnet}"
            )));
        }
        Ok(Self {
            base: subnet.network(),
        })
    }

    pub fn router_side(&self) -> Ipv4Addr {
        self.base
    }

    pub fn snat_side(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) | 1)
    }

    /// Both ends as /31 CIDRs, router end first.
    pub fn get_pair(&self) -> Result<(IpNetwork, IpNetwork)> {
        let cidr = |ip: Ipv4Addr| {
            IpNetwork::new(IpAddr::V4(ip), PAIR_PREFIX)
                .map_err(|e| DvrError::InvalidAddress(format!("{ip}/{PAIR_PREFIX}: {e}")))
        };
        Ok((cidr(self.router_side())?, cidr(self.snat_side())?))
    }
}

/// Hands out /31 pairs from a pool, one per key.
///
/// A single-/31 pool is shared: every key receives the same pair.
#[derive(Debug)]
pub struct LinkLocalAllocator {
    pool: Ipv4Network,
    slots: u64,
    allocations: BTreeMap<String, u64>,
}

impl LinkLocalAllocator {
    pub fn new(pool: Ipv4Network) -> Result<Self> {
        if pool.prefix() > PAIR_PREFIX {
            return Err(DvrError::InvalidConfig(format!(
                "link-local pool {pool} is smaller than a /{PAIR_PREFIX}"
            )));
        }
        let slots = (1u64 << (32 - u32::from(pool.prefix()))) / 2;
        Ok(Self {
            pool,
            slots,
            allocations: BTreeMap::new(),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.slots
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// The pair held by `key`, allocating the lowest free slot on first use.
    pub fn allocate(&mut self, key: &str) -> Result<LinkLocalAddressPair> {
        if let Some(&slot) = self.allocations.get(key) {
            return Ok(self.pair_at(slot));
        }
        let slot = if self.slots == 1 {
            0
        } else {
            let used: BTreeSet<u64> = self.allocations.values().copied().collect();
            (0..self.slots)
                .find(|slot| !used.contains(slot))
                .ok_or_else(|| DvrError::LinkLocalExhausted(self.pool.to_string()))?
        };
        self.allocations.insert(key.to_string(), slot);
        Ok(self.pair_at(slot))
    }

    pub fn release(&mut self, key: &str) -> Option<LinkLocalAddressPair> {
        self.allocations
            .remove(key)
            .map(|slot| self.pair_at(slot))
    }

    fn pair_at(&self, slot: u64) -> LinkLocalAddressPair {
        let base = u64::from(u32::from(self.pool.network())) + slot * 2;
        LinkLocalAddressPair {
            base: Ipv4Addr::from(u32::try_from(base).unwrap_or(u32::MAX - 1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn default_pair_matches_reserved_addresses() {
        let pair = LinkLocalAddressPair::default();
        assert_eq!(pair.router_side(), ROUTER_2_SNAT_IP);
        assert_eq!(pair.snat_side(), SNAT_2_ROUTER_IP);
        let (r, s) = pair.get_pair().unwrap();
        assert_eq!(r.to_string(), "169.254.128.128/31");
        assert_eq!(s.to_string(), "169.254.128.129/31");
    }

    #[test]
    fn pair_requires_slash_31() {
        assert!(LinkLocalAddressPair::from_subnet(net("169.254.0.0/30")).is_err());
        let pair = LinkLocalAddressPair::from_subnet(net(SNAT_LL_SUBNET)).unwrap();
        assert_eq!(pair, LinkLocalAddressPair::default());
    }

    #[test]
    fn single_slot_pool_reuses_fixed_pair_per_key() {
        let mut alloc = LinkLocalAllocator::new(net(SNAT_LL_SUBNET)).unwrap();
        assert_eq!(alloc.capacity(), 1);
        let a = alloc.allocate("r1").unwrap();
        assert_eq!(a, LinkLocalAddressPair::default());
        assert_eq!(alloc.allocate("r1").unwrap(), a);
    }

    #[test]
    fn single_slot_pool_is_shared_between_keys() {
        let mut alloc = LinkLocalAllocator::new(net(SNAT_LL_SUBNET)).unwrap();
        let a = alloc.allocate("r1").unwrap();
        assert_eq!(alloc.allocate("r2").unwrap(), a);
        assert_eq!(alloc.len(), 2);
        alloc.release("r1");
        assert_eq!(alloc.len(), 1);
    }

    #[test]
    fn pool_pairs_are_unique_per_key() {
        let mut alloc = LinkLocalAllocator::new(net("169.254.64.0/28")).unwrap();
        assert_eq!(alloc.capacity(), 8);
        let mut seen = std::collections::HashSet::new();
        for i in 0..8 {
            let pair = alloc.allocate(&format!("r{i}")).unwrap();
            assert!(seen.insert(pair.router_side()));
            assert!(seen.insert(pair.snat_side()));
            assert_eq!(u32::from(pair.router_side()) % 2, 0);
        }
        assert!(alloc.allocate("r8").is_err());
    }

    #[test]
    fn release_frees_lowest_slot_for_reuse() {
        let mut alloc = LinkLocalAllocator::new(net("169.254.64.0/29")).unwrap();
        let first = alloc.allocate("a").unwrap();
        alloc.allocate("b").unwrap();
        assert_eq!(alloc.release("a"), Some(first));
        assert_eq!(alloc.release("a"), None);
        assert_eq!(alloc.allocate("c").unwrap(), first);
        assert_eq!(alloc.len(), 2);
    }

    #[test]
    fn pool_smaller_than_pair_rejected() {
        let err = LinkLocalAllocator::new(net("169.254.64.1/32")).unwrap_err();
        assert!(matches!(err, DvrError::InvalidConfig(_)));
    }
}
