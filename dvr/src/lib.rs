mod agent;
mod driver;
mod error;
mod firewall;
mod model;

pub use agent::RouterAgent;
pub use driver::{DEV_NAME_LEN, Device, InterfaceDriver, IpRule, PlugRequest, RouteEntry, RouteScope};
pub use error::{DvrError, Result};
pub use firewall::{FirewallBackend, FirewallRule, OwnedChain, RuleBatch, Table};
pub use model::{AddressScopes, FixedIp, GatewayIps, IpVersion, Port, Route, Router, Subnet};

pub use ipnetwork::IpNetwork;
