/// What an `external_gateway_updated` event must do on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPlan {
    /// Not the SNAT host and nothing local to clean up.
    NonSnat,
    /// SNAT moved away; remove the local namespace.
    Remove,
    /// SNAT moved here; build it like a new gateway.
    Add,
    /// Steady state; re-plumb the gateway in place.
    Refresh,
    /// The event contradicts the router snapshot. Logged and ignored.
    Inconsistent,
}

/// Classify a gateway update from live state.
///
/// `port_matches_snapshot` is false when the event's gateway port is not the
/// router snapshot's gateway port. Such an event cannot build or refresh
/// SNAT here, but a namespace left on a host that lost SNAT is still removed.
pub fn plan_gateway_update(
    is_snat_host: bool,
    namespace_exists: bool,
    port_matches_snapshot: bool,
) -> GatewayPlan {
    match (is_snat_host, namespace_exists) {
        (false, false) => GatewayPlan::NonSnat,
        (false, true) => GatewayPlan::Remove,
        (true, _) if !port_matches_snapshot => GatewayPlan::Inconsistent,
        (true, false) => GatewayPlan::Add,
        (true, true) => GatewayPlan::Refresh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_combinations() {
        assert_eq!(plan_gateway_update(false, false, true), GatewayPlan::NonSnat);
        assert_eq!(plan_gateway_update(false, true, true), GatewayPlan::Remove);
        assert_eq!(plan_gateway_update(true, false, true), GatewayPlan::Add);
        assert_eq!(plan_gateway_update(true, true, true), GatewayPlan::Refresh);
    }

    #[test]
    fn mismatched_port_cannot_build_or_refresh() {
        assert_eq!(plan_gateway_update(true, false, false), GatewayPlan::Inconsistent);
        assert_eq!(plan_gateway_update(true, true, false), GatewayPlan::Inconsistent);
    }

    #[test]
    fn mismatched_port_still_clears_lost_snat() {
        assert_eq!(plan_gateway_update(false, true, false), GatewayPlan::Remove);
        assert_eq!(plan_gateway_update(false, false, false), GatewayPlan::NonSnat);
    }
}
