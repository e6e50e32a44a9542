//! Linux implementations of the collaborator traits.

mod ip;
mod iptables;

pub use ip::{IpDriver, TAP_DEV_PREFIX};
pub use iptables::{IptablesBackend, render_restore};
