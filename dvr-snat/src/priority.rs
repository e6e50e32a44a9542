use std::collections::BTreeMap;

/// First policy-rule priority handed out for local SNAT redirects.
pub const LOCAL_SNAT_PR_START: u32 = 32768;
/// Last policy-rule priority handed out for local SNAT redirects.
pub const LOCAL_SNAT_PR_END: u32 = 36863;

/// Allocates `ip rule` priorities from a fixed range, one per key.
///
/// The same key always gets the same priority until released.
#[derive(Debug, Clone)]
pub struct PriorityAllocator {
    start: u32,
    end: u32,
    allocations: BTreeMap<String, u32>,
}

impl Default for PriorityAllocator {
    fn default() -> Self {
        Self::new(LOCAL_SNAT_PR_START, LOCAL_SNAT_PR_END)
    }
}

impl PriorityAllocator {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            allocations: BTreeMap::new(),
        }
    }

    /// Priority for `key`, or `None` when the range is used up.
    pub fn allocate(&mut self, key: &str) -> Option<u32> {
        if let Some(&priority) = self.allocations.get(key) {
            return Some(priority);
        }
        let priority = (self.start..=self.end).find(|p| !self.allocations.values().any(|v| v == p))?;
        self.allocations.insert(key.to_string(), priority);
        Some(priority)
    }

    pub fn release(&mut self, key: &str) -> Option<u32> {
        self.allocations.remove(key)
    }

    pub fn clear(&mut self) {
        self.allocations.clear();
    }
}
