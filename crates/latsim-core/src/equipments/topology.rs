//! The network topology: a directed multigraph of hosts and routers.
//!
//! Links carry a fixed latency, the set of flows currently crossing them,
//! and a cached per-flow bandwidth portion. Hosts attach only to routers;
//! routers attach to hosts and to each other. Paths are fewest-hop and
//! precomputed per transmission; parallel links between the same pair are
//! disambiguated by taking the earliest-added one.

use std::collections::{BTreeMap, BTreeSet};

use latsim_types::{HostId, LinkId, RouterId, TopologyNode, TransmissionId};
use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::equipments::host::Host;
use crate::equipments::router::Router;

#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub name: String,
    /// Nanoseconds per traversal.
    pub latency: f64,
    pub src: TopologyNode,
    pub dst: TopologyNode,
    /// Flows currently crossing this link.
    pub transmissions: BTreeSet<TransmissionId>,
    /// Cached per-flow fair share of the link bandwidth (bytes/s).
    pub portion: f64,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub name: String,
    /// Relative shortfall between a replica's configured egress bandwidth
    /// and what it actually gets (0.05 = 5%).
    pub egress_err: f64,
    pub ingress_err: f64,

    graph: DiGraph<TopologyNode, LinkId>,
    node_ix: BTreeMap<TopologyNode, NodeIndex>,
    pub links: Vec<Link>,

    /// Links carrying at least one flow.
    pub active_links: BTreeSet<LinkId>,
    /// Links whose last flow just left; their portion cache is refreshed on
    /// the next allocation pass, then the set drains.
    pub zombie_links: BTreeSet<LinkId>,
    pub active_transmissions: BTreeSet<TransmissionId>,
}

impl Topology {
    pub fn new(name: impl Into<String>, egress_err: f64, ingress_err: f64) -> Self {
        Self {
            name: name.into(),
            egress_err,
            ingress_err,
            graph: DiGraph::new(),
            node_ix: BTreeMap::new(),
            links: Vec::new(),
            active_links: BTreeSet::new(),
            zombie_links: BTreeSet::new(),
            active_transmissions: BTreeSet::new(),
        }
    }

    pub fn add_host(&mut self, host: HostId) {
        let node = TopologyNode::Host(host);
        let ix = self.graph.add_node(node);
        self.node_ix.insert(node, ix);
    }

    pub fn add_router(&mut self, router: RouterId) {
        let node = TopologyNode::Router(router);
        let ix = self.graph.add_node(node);
        self.node_ix.insert(node, ix);
    }

    /// Adds a directed link, wiring up router port bookkeeping.
    ///
    /// # Panics
    ///
    /// Panics when a host is linked to anything but a router, or when an
    /// endpoint is missing from the topology.
    pub fn add_link(
        &mut self,
        name: impl Into<String>,
        latency: f64,
        src: TopologyNode,
        dst: TopologyNode,
        routers: &mut [Router],
    ) -> LinkId {
        let name = name.into();
        match (src, dst) {
            (TopologyNode::Host(h), TopologyNode::Router(r)) => {
                routers[r.index()].connect_host(h);
            }
            (TopologyNode::Router(a), TopologyNode::Router(b)) => {
                routers[b.index()].connect_router(a);
            }
            (TopologyNode::Router(_), TopologyNode::Host(_)) => {}
            (TopologyNode::Host(_), TopologyNode::Host(_)) => {
                panic!("link {name}: a host can only be connected to a router")
            }
        }

        let id = LinkId::from(self.links.len());
        let s = self.node_index(src);
        let d = self.node_index(dst);
        self.graph.add_edge(s, d, id);
        self.links.push(Link {
            id,
            name,
            latency,
            src,
            dst,
            transmissions: BTreeSet::new(),
            portion: 0.0,
        });
        id
    }

    fn node_index(&self, node: TopologyNode) -> NodeIndex {
        *self
            .node_ix
            .get(&node)
            .unwrap_or_else(|| panic!("{node} is not part of topology {}", self.name))
    }

    /// Physical bandwidth of a link: the minimum of the two endpoint NICs.
    pub fn link_capacity(&self, link: LinkId, hosts: &[Host], routers: &[Router]) -> f64 {
        let l = &self.links[link.index()];
        match (l.src, l.dst) {
            (TopologyNode::Host(h), TopologyNode::Router(r)) => hosts[h.index()]
                .egress_nic
                .bandwidth
                .min(routers[r.index()].egress_ingress_bw),
            (TopologyNode::Router(r), TopologyNode::Host(h)) => routers[r.index()]
                .egress_ingress_bw
                .min(hosts[h.index()].ingress_nic.bandwidth),
            (TopologyNode::Router(a), TopologyNode::Router(b)) => routers[a.index()]
                .egress_ingress_bw
                .min(routers[b.index()].egress_ingress_bw),
            (TopologyNode::Host(_), TopologyNode::Host(_)) => {
                unreachable!("host-to-host links are rejected at construction")
            }
        }
    }

    /// Seeds every link's portion cache with its full capacity. Run once
    /// after construction, before any flow exists.
    pub fn seed_portions(&mut self, hosts: &[Host], routers: &[Router]) {
        for link_id in 0..self.links.len() {
            let id = LinkId::from(link_id);
            self.links[link_id].portion = self.link_capacity(id, hosts, routers);
        }
    }

    /// Fewest-hop route between two hosts as an ordered list of links.
    /// Empty for a host talking to itself.
    ///
    /// # Panics
    ///
    /// Panics when no route exists; a scenario placing communicating
    /// replicas on disconnected hosts is malformed.
    pub fn route_links(&self, src: HostId, dst: HostId) -> Vec<LinkId> {
        if src == dst {
            return Vec::new();
        }
        let start = self.node_index(TopologyNode::Host(src));
        let goal = self.node_index(TopologyNode::Host(dst));
        let (_, path) = astar(&self.graph, start, |n| n == goal, |_| 1usize, |_| 0)
            .unwrap_or_else(|| panic!("no route from host {src} to host {dst}"));

        path.windows(2)
            .map(|pair| {
                self.graph
                    .edges_connecting(pair[0], pair[1])
                    .map(|e| *e.weight())
                    .min()
                    .expect("adjacent path nodes share a link")
            })
            .collect()
    }

    /// Distinct intermediate routers of a link path, each counted once for
    /// latency purposes.
    pub fn routers_on_path(&self, links: &[LinkId]) -> BTreeSet<RouterId> {
        let mut routers = BTreeSet::new();
        for link in links {
            for node in [self.links[link.index()].src, self.links[link.index()].dst] {
                if let TopologyNode::Router(r) = node {
                    routers.insert(r);
                }
            }
        }
        routers
    }

    /// Registers a flow on each of its links, activating them.
    pub fn attach_flow(&mut self, transmission: TransmissionId, links: &[LinkId]) {
        for link in links {
            self.links[link.index()].transmissions.insert(transmission);
            self.active_links.insert(*link);
        }
        self.active_transmissions.insert(transmission);
    }

    /// Removes a finished flow from its links; links left empty move to the
    /// zombie set for one final portion refresh.
    pub fn detach_flow(&mut self, transmission: TransmissionId, links: &[LinkId]) {
        for link in links {
            let l = &mut self.links[link.index()];
            l.transmissions.remove(&transmission);
            if l.transmissions.is_empty() {
                self.active_links.remove(link);
                self.zombie_links.insert(*link);
            }
        }
        self.active_transmissions.remove(&transmission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equipments::host::HostSpec;

    fn host_spec() -> HostSpec {
        HostSpec {
            cpu_core_count: 1,
            cpu_clock_rate: 1e9,
            memory_capacity: 1e9,
            ram_speed: 1e9,
            storage_capacity: 1e9,
            storage_speed: 1e9,
            network_bandwidth: 117_300_000.0,
        }
    }

    fn star(hosts: usize) -> (Topology, Vec<Host>, Vec<Router>) {
        let mut topo = Topology::new("tau", 0.05, 0.05);
        let mut hs = Vec::new();
        let mut routers = vec![Router::new(RouterId::new(0), "r0", 730_000.0, 1.25e9, 64)];
        topo.add_router(RouterId::new(0));
        for i in 0..hosts {
            let id = HostId::from(i);
            hs.push(Host::new(id, format!("h{i}"), &host_spec()));
            topo.add_host(id);
            topo.add_link(
                format!("l{i}_up"),
                420_000.0,
                TopologyNode::Host(id),
                TopologyNode::Router(RouterId::new(0)),
                &mut routers,
            );
            topo.add_link(
                format!("l{i}_down"),
                420_000.0,
                TopologyNode::Router(RouterId::new(0)),
                TopologyNode::Host(id),
                &mut routers,
            );
        }
        topo.seed_portions(&hs, &routers);
        (topo, hs, routers)
    }

    #[test]
    fn star_route_crosses_the_router() {
        let (topo, _, _) = star(2);
        let links = topo.route_links(HostId::new(0), HostId::new(1));
        assert_eq!(links.len(), 2);
        assert_eq!(topo.routers_on_path(&links).len(), 1);
    }

    #[test]
    fn same_host_route_is_empty() {
        let (topo, _, _) = star(1);
        assert!(topo.route_links(HostId::new(0), HostId::new(0)).is_empty());
    }

    #[test]
    fn link_capacity_is_the_narrower_nic() {
        let (topo, hosts, routers) = star(1);
        // Host uplink: host egress (117.3 MB/s) vs router port (1.25 GB/s).
        assert_eq!(
            topo.link_capacity(LinkId::new(0), &hosts, &routers),
            117_300_000.0
        );
        assert_eq!(topo.links[0].portion, 117_300_000.0);
    }

    #[test]
    fn empty_links_become_zombies_until_refreshed() {
        let (mut topo, _, _) = star(2);
        let links = topo.route_links(HostId::new(0), HostId::new(1));
        let t = TransmissionId::new(0);
        topo.attach_flow(t, &links);
        assert_eq!(topo.active_links.len(), 2);

        topo.detach_flow(t, &links);
        assert!(topo.active_links.is_empty());
        assert_eq!(topo.zombie_links.len(), 2);
        assert!(topo.active_transmissions.is_empty());
    }

    #[test]
    #[should_panic(expected = "can only be connected to a router")]
    fn host_to_host_links_are_rejected() {
        let mut topo = Topology::new("tau", 0.0, 0.0);
        topo.add_host(HostId::new(0));
        topo.add_host(HostId::new(1));
        let mut routers = Vec::new();
        topo.add_link(
            "bad",
            0.0,
            TopologyNode::Host(HostId::new(0)),
            TopologyNode::Host(HostId::new(1)),
            &mut routers,
        );
    }
}
