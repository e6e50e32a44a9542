use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Add,
    Delete,
}

/// Outcome of a neighbour table update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArpUpdate {
    Applied,
    /// The port's device is not plumbed yet. Additions are kept and replayed
    /// once the port is added.
    DeviceAbsent,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: IpAddr,
    pub mac: String,
    pub subnet_id: String,
}

/// Neighbour entries waiting for their internal port to appear.
#[derive(Debug, Default)]
pub struct ArpCache {
    pending: Vec<ArpEntry>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `entry`, replacing an earlier one for the same address.
    pub fn insert(&mut self, entry: ArpEntry) {
        self.remove(entry.ip, &entry.subnet_id);
        self.pending.push(entry);
    }

    pub fn remove(&mut self, ip: IpAddr, subnet_id: &str) {
        self.pending
            .retain(|e| !(e.ip == ip && e.subnet_id == subnet_id));
    }

    /// Drain the entries of `subnet_id`, oldest first.
    pub fn take_subnet(&mut self, subnet_id: &str) -> Vec<ArpEntry> {
        let (taken, kept) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|e| e.subnet_id == subnet_id);
        self.pending = kept;
        taken
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ip: &str, mac: &str, subnet: &str) -> ArpEntry {
        ArpEntry {
            ip: ip.parse().unwrap(),
            mac: mac.into(),
            subnet_id: subnet.into(),
        }
    }

    #[test]
    fn insert_replaces_same_address() {
        let mut cache = ArpCache::new();
        cache.insert(entry("10.0.0.5", "aa:aa:aa:aa:aa:01", "s1"));
        cache.insert(entry("10.0.0.5", "aa:aa:aa:aa:aa:02", "s1"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.take_subnet("s1")[0].mac, "aa:aa:aa:aa:aa:02");
    }

    #[test]
    fn take_subnet_leaves_others() {
        let mut cache = ArpCache::new();
        cache.insert(entry("10.0.0.5", "aa:aa:aa:aa:aa:01", "s1"));
        cache.insert(entry("10.1.0.5", "aa:aa:aa:aa:aa:02", "s2"));
        cache.insert(entry("10.0.0.6", "aa:aa:aa:aa:aa:03", "s1"));

        let taken = cache.take_subnet("s1");
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(cache.len(), 1);
        assert!(cache.take_subnet("s1").is_empty());
    }

    #[test]
    fn remove_forgets_entry() {
        let mut cache = ArpCache::new();
        cache.insert(entry("10.0.0.5", "aa:aa:aa:aa:aa:01", "s1"));
        cache.remove("10.0.0.5".parse().unwrap(), "s1");
        assert!(cache.is_empty());
    }
}
