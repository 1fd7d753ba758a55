//! Routers: packet forwarders with a fixed per-hop latency, a shared
//! per-port bandwidth, and a bounded port budget.

use std::collections::BTreeMap;

use latsim_types::{HostId, RouterId};

#[derive(Debug, Clone)]
pub struct Router {
    pub id: RouterId,
    pub name: String,
    /// Nanoseconds added to every transmission crossing this router.
    pub latency: f64,
    /// Bytes per second each port forwards, in either direction.
    pub egress_ingress_bw: f64,
    pub ports_count: usize,
    /// Connected hosts, port number per host.
    pub hosts: BTreeMap<HostId, usize>,
    /// Connected peer routers, port number per router.
    pub routers: BTreeMap<RouterId, usize>,
}

impl Router {
    /// # Panics
    ///
    /// Panics on a zero-port router.
    pub fn new(
        id: RouterId,
        name: impl Into<String>,
        latency: f64,
        egress_ingress_bw: f64,
        ports_count: usize,
    ) -> Self {
        assert!(ports_count > 0, "can't have a router without ports");
        Self {
            id,
            name: name.into(),
            latency,
            egress_ingress_bw,
            ports_count,
            hosts: BTreeMap::new(),
            routers: BTreeMap::new(),
        }
    }

    fn used_ports(&self) -> usize {
        self.hosts.len() + self.routers.len()
    }

    /// Connects a host to the next free port.
    ///
    /// # Panics
    ///
    /// Panics when every port is taken.
    pub fn connect_host(&mut self, host: HostId) {
        assert!(
            self.used_ports() < self.ports_count,
            "router {} is out of ports for host {host}",
            self.name
        );
        let port = self.used_ports();
        self.hosts.insert(host, port);
    }

    /// Connects a peer router to the next free port.
    ///
    /// # Panics
    ///
    /// Panics when every port is taken.
    pub fn connect_router(&mut self, router: RouterId) {
        assert!(
            self.used_ports() < self.ports_count,
            "router {} is out of ports for router {router}",
            self.name
        );
        let port = self.used_ports();
        self.routers.insert(router, port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_fill_in_connection_order() {
        let mut r = Router::new(RouterId::new(0), "r0", 730_000.0, 1.25e9, 3);
        r.connect_host(HostId::new(0));
        r.connect_router(RouterId::new(1));
        r.connect_host(HostId::new(2));
        assert_eq!(r.hosts[&HostId::new(0)], 0);
        assert_eq!(r.routers[&RouterId::new(1)], 1);
        assert_eq!(r.hosts[&HostId::new(2)], 2);
    }

    #[test]
    #[should_panic(expected = "out of ports")]
    fn over_connecting_panics() {
        let mut r = Router::new(RouterId::new(0), "r0", 0.0, 1.25e9, 1);
        r.connect_host(HostId::new(0));
        r.connect_host(HostId::new(1));
    }
}
