//! One worker task per router id.
//!
//! Events of a router are applied strictly in order by its worker; different
//! routers progress concurrently. A `router_deleted` event tears the router
//! down, releases its link-local pair and ends the worker.

use std::collections::HashMap;
use std::sync::Arc;

use dvr_snat::{DvrEdgeRouter, LinkLocalAllocator, RouterDeps};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::events::{EventKind, RouterEvent, apply_event};

struct Worker {
    sender: mpsc::Sender<RouterEvent>,
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    deps: RouterDeps,
    allocator: Arc<Mutex<LinkLocalAllocator>>,
    queue_depth: usize,
    workers: HashMap<String, Worker>,
    /// Workers that received `router_deleted` and may still be tearing down.
    retiring: HashMap<String, JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(deps: RouterDeps, allocator: Arc<Mutex<LinkLocalAllocator>>, queue_depth: usize) -> Self {
        Self {
            deps,
            allocator,
            queue_depth,
            workers: HashMap::new(),
            retiring: HashMap::new(),
        }
    }

    /// Number of routers with a live worker.
    pub fn active(&self) -> usize {
        self.workers.len()
    }

    /// Queue `event` on its router's worker, starting the worker if needed.
    ///
    /// Waits while the router's queue is full.
    pub async fn dispatch(&mut self, event: RouterEvent) -> AgentResult<()> {
        let router_id = event.router.id.clone();
        let deleted = matches!(event.kind, EventKind::RouterDeleted);

        if !self.workers.contains_key(&router_id) {
            let worker = self.spawn(&event).await?;
            self.workers.insert(router_id.clone(), worker);
        }
        let Some(worker) = self.workers.get(&router_id) else {
            return Err(AgentError::Event(format!("no worker for router {router_id}")));
        };
        worker
            .sender
            .send(event)
            .await
            .map_err(|_| AgentError::Event(format!("worker for router {router_id} stopped")))?;

        if deleted && let Some(worker) = self.workers.remove(&router_id) {
            self.retiring.insert(router_id, worker.handle);
        }
        Ok(())
    }

    async fn spawn(&mut self, event: &RouterEvent) -> AgentResult<Worker> {
        let router_id = event.router.id.clone();
        if let Some(handle) = self.retiring.remove(&router_id) {
            debug!(router_id = %router_id, "waiting for previous worker to finish");
            join(&router_id, handle).await;
        }
        let link = self.allocator.lock().await.allocate(&router_id)?;
        let router = DvrEdgeRouter::new(event.router.clone(), self.deps.clone(), link);
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        let handle = tokio::spawn(run_worker(router, receiver, self.allocator.clone()));
        debug!(router_id = %router_id, "router worker started");
        Ok(Worker { sender, handle })
    }

    /// Close every queue and wait for all workers to finish their backlog.
    pub async fn drain(mut self) {
        let workers: Vec<(String, JoinHandle<()>)> = self
            .workers
            .drain()
            .map(|(id, worker)| (id, worker.handle))
            .chain(self.retiring.drain())
            .collect();
        for (router_id, handle) in workers {
            join(&router_id, handle).await;
        }
    }
}

async fn join(router_id: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(router_id = %router_id, error = %e, "router worker panicked");
    }
}

async fn run_worker(
    mut router: DvrEdgeRouter,
    mut events: mpsc::Receiver<RouterEvent>,
    allocator: Arc<Mutex<LinkLocalAllocator>>,
) {
    let router_id = router.router().id.clone();
    if let Err(e) = router.initialize().await {
        warn!(router_id = %router_id, error = %e, "failed to create router namespace");
    }

    while let Some(event) = events.recv().await {
        let name = event.kind.name();
        let deleted = matches!(event.kind, EventKind::RouterDeleted);
        debug!(router_id = %router_id, event = name, "applying event");
        if let Err(e) = apply_event(&mut router, event).await {
            error!(router_id = %router_id, event = name, error = %e, "router event failed");
        }
        if deleted {
            allocator.lock().await.release(&router_id);
            info!(router_id = %router_id, "router deleted");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use dvr::{AddressScopes, FixedIp, Port, Router, Subnet};
    use dvr_snat::testing::{FakeDriver, RecordingAgent, RecordingFirewall};
    use dvr_snat::{EdgeMode, SnatConfig};

    use super::*;

    fn gw_port() -> Port {
        Port {
            id: "gw".into(),
            network_id: "ext".into(),
            mac_address: "fa:16:3e:00:00:01".into(),
            fixed_ips: vec![FixedIp {
                subnet_id: "ext4".into(),
                ip_address: "203.0.113.5".parse().unwrap(),
                prefixlen: 24,
            }],
            mtu: Some(1500),
            subnets: vec![Subnet {
                id: "ext4".into(),
                cidr: "203.0.113.0/24".parse().unwrap(),
                gateway_ip: Some("203.0.113.1".parse().unwrap()),
            }],
            address_scopes: AddressScopes::default(),
        }
    }

    fn router(id: &str) -> Router {
        let mut router = Router::new(id);
        router.host = Some("h1".into());
        router.gw_port_host = Some("h1".into());
        router.gw_port = Some(gw_port());
        router
    }

    fn event(id: &str, kind: EventKind) -> RouterEvent {
        RouterEvent {
            router: router(id),
            kind,
        }
    }

    fn pool(driver: Arc<FakeDriver>, queue_depth: usize) -> (WorkerPool, Arc<Mutex<LinkLocalAllocator>>) {
        let deps = RouterDeps {
            config: Arc::new(SnatConfig::new("h1", EdgeMode::Local)),
            driver,
            firewall: Arc::new(RecordingFirewall::new()),
            agent: Arc::new(RecordingAgent::new()),
        };
        let allocator = Arc::new(Mutex::new(
            LinkLocalAllocator::new("169.254.64.0/24".parse().unwrap()).unwrap(),
        ));
        (WorkerPool::new(deps, allocator.clone(), queue_depth), allocator)
    }

    #[tokio::test]
    async fn routers_get_distinct_links_and_namespaces() {
        let driver = Arc::new(FakeDriver::new());
        let (mut pool, allocator) = pool(driver.clone(), 4);
        for id in ["r1", "r2"] {
            pool.dispatch(event(id, EventKind::ExternalGatewayAdded { port: gw_port() }))
                .await
                .unwrap();
        }
        assert_eq!(pool.active(), 2);
        pool.drain().await;

        let state = driver.state();
        for ns in ["qrouter-r1", "snat-r1", "qrouter-r2", "snat-r2"] {
            assert!(state.namespaces.contains(ns), "missing {ns}");
        }
        let r1 = &state.device("snat-r1", "snat2r-r1").unwrap().addresses;
        let r2 = &state.device("snat-r2", "snat2r-r2").unwrap().addresses;
        assert_ne!(r1, r2);
        assert_eq!(allocator.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn router_deleted_tears_down_and_releases_link() {
        let driver = Arc::new(FakeDriver::new());
        let (mut pool, allocator) = pool(driver.clone(), 1);
        pool.dispatch(event("r1", EventKind::ExternalGatewayAdded { port: gw_port() }))
            .await
            .unwrap();
        pool.dispatch(event("r1", EventKind::RouterDeleted))
            .await
            .unwrap();
        assert_eq!(pool.active(), 0);
        pool.drain().await;

        assert!(driver.state().namespaces.is_empty());
        assert!(allocator.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_event_does_not_stop_worker() {
        let driver = Arc::new(FakeDriver::new());
        driver.fail_on("add_veth");
        let (mut pool, _allocator) = pool(driver.clone(), 4);
        pool.dispatch(event("r1", EventKind::ExternalGatewayAdded { port: gw_port() }))
            .await
            .unwrap();
        pool.dispatch(event("r1", EventKind::RouterDeleted))
            .await
            .unwrap();
        pool.drain().await;

        assert!(driver.state().namespaces.is_empty());
    }

    #[tokio::test]
    async fn router_recreated_after_delete() {
        let driver = Arc::new(FakeDriver::new());
        let (mut pool, allocator) = pool(driver.clone(), 4);
        pool.dispatch(event("r1", EventKind::ExternalGatewayAdded { port: gw_port() }))
            .await
            .unwrap();
        pool.dispatch(event("r1", EventKind::RouterDeleted))
            .await
            .unwrap();
        pool.dispatch(event("r1", EventKind::ExternalGatewayAdded { port: gw_port() }))
            .await
            .unwrap();
        pool.drain().await;

        assert!(driver.state().namespaces.contains("snat-r1"));
        assert_eq!(allocator.lock().await.len(), 1);
    }
}
