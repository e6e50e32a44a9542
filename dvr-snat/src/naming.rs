//! Namespace and device names.
//!
//! Every name is a pure function of a role prefix and an identifier, so
//! re-plugging the same port always lands on the same device.

use dvr::DEV_NAME_LEN;

/// Router namespace prefix.
pub const ROUTER_NS_PREFIX: &str = "qrouter-";
/// SNAT namespace prefix.
pub const SNAT_NS_PREFIX: &str = "snat-";

/// Internal router port, in the router namespace.
pub const INTERNAL_DEV_PREFIX: &str = "qr-";
/// External gateway port.
pub const EXTERNAL_DEV_PREFIX: &str = "qg-";
/// Centralized SNAT port, in the SNAT namespace.
pub const SNAT_INT_DEV_PREFIX: &str = "sg-";
/// Router end of the router/SNAT veth link.
pub const ROUTER_2_SNAT_DEV_PREFIX: &str = "rfp-";
/// SNAT end of the router/SNAT veth link.
pub const SNAT_2_ROUTER_DEV_PREFIX: &str = "snat2r-";

pub fn router_ns_name(router_id: &str) -> String {
    format!("{ROUTER_NS_PREFIX}{router_id}")
}

pub fn snat_ns_name(router_id: &str) -> String {
    format!("{SNAT_NS_PREFIX}{router_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNamer {
    max_len: usize,
}

impl Default for DeviceNamer {
    fn default() -> Self {
        Self::new(DEV_NAME_LEN)
    }
}

impl DeviceNamer {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// `prefix + id`, truncated to the driver's length limit.
    pub fn name(&self, prefix: &str, id: &str) -> String {
        prefix.chars().chain(id.chars()).take(self.max_len).collect()
    }

    pub fn internal(&self, port_id: &str) -> String {
        self.name(INTERNAL_DEV_PREFIX, port_id)
    }

    pub fn external(&self, port_id: &str) -> String {
        self.name(EXTERNAL_DEV_PREFIX, port_id)
    }

    pub fn snat_internal(&self, port_id: &str) -> String {
        self.name(SNAT_INT_DEV_PREFIX, port_id)
    }

    pub fn router_to_snat(&self, router_id: &str) -> String {
        self.name(ROUTER_2_SNAT_DEV_PREFIX, router_id)
    }

    pub fn snat_to_router(&self, router_id: &str) -> String {
        self.name(SNAT_2_ROUTER_DEV_PREFIX, router_id)
    }
}
