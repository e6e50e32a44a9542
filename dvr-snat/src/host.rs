use dvr::Router;
use tracing::debug;

/// Whether `local_host` is the designated SNAT host for `router`.
///
/// A missing `gw_port_host` means no host currently owns SNAT (no gateway
/// yet, or a reschedule in flight) and yields `false`. Always evaluate
/// against the latest router snapshot; the answer changes under rescheduling.
pub fn is_snat_host(router: &Router, local_host: &str) -> bool {
    match router.gw_port_host.as_deref() {
        Some(host) if !host.is_empty() => host == local_host,
        _ => {
            debug!(
                router_id = %router.id,
                router_host = ?router.host,
                "gw_port_host missing from router"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(gw_port_host: Option<&str>) -> Router {
        let mut r = Router::new("r1");
        r.gw_port_host = gw_port_host.map(String::from);
        r
    }

    #[test]
    fn matches_local_host() {
        assert!(is_snat_host(&router(Some("hostA")), "hostA"));
    }

    #[test]
    fn other_host_is_not_snat_host() {
        assert!(!is_snat_host(&router(Some("hostB")), "hostA"));
    }

    #[test]
    fn missing_or_empty_host_is_not_snat_host() {
        assert!(!is_snat_host(&router(None), "hostA"));
        assert!(!is_snat_host(&router(Some("")), ""));
    }

    #[test]
    fn scheduled_host_does_not_make_snat_host() {
        let mut r = router(None);
        r.host = Some("hostA".into());
        assert!(!is_snat_host(&r, "hostA"));
        r.gw_port_host = Some("hostB".into());
        assert!(!is_snat_host(&r, "hostA"));
    }

    #[test]
    fn does_not_mutate_router() {
        let r = router(Some("hostA"));
        let before = r.clone();
        let _ = is_snat_host(&r, "hostA");
        let _ = is_snat_host(&r, "hostB");
        assert_eq!(r, before);
    }
}
