//! Service chains and their unfolded alternative graphs.
//!
//! A service chain is a directed multigraph whose nodes are endpoint
//! functions and whose edges carry payload byte counts. Before simulation it
//! is unfolded into the *alternative graph*: every node gets one copy per
//! incoming edge, so each parallel branch through a merge becomes its own
//! linear subchain. Requests progress per subchain and conclude when all
//! subchains conclude.

use std::collections::HashMap;

use latsim_types::ScmId;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::service::microservice::EndpointRef;

// ============================================================================
// Service chain
// ============================================================================

/// Payload-carrying edge between two endpoint functions.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEdge {
    pub name: String,
    /// Request size in bytes.
    pub payload: f64,
}

#[derive(Debug, Clone)]
pub struct ServiceChain {
    pub name: String,
    pub graph: DiGraph<EndpointRef, ChainEdge>,
    nodes_by_ref: HashMap<EndpointRef, NodeIndex>,
}

impl ServiceChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: DiGraph::new(),
            nodes_by_ref: HashMap::new(),
        }
    }

    /// Adds an endpoint function node. Idempotent per endpoint.
    pub fn add_node(&mut self, endpoint: EndpointRef) -> NodeIndex {
        if let Some(ix) = self.nodes_by_ref.get(&endpoint) {
            return *ix;
        }
        let ix = self.graph.add_node(endpoint);
        self.nodes_by_ref.insert(endpoint, ix);
        ix
    }

    /// Adds a payload edge between two previously added endpoints.
    ///
    /// # Panics
    ///
    /// Panics if either endpoint is missing from the chain.
    pub fn add_edge(&mut self, src: EndpointRef, dst: EndpointRef, edge: ChainEdge) -> EdgeIndex {
        let s = self.node_of(src);
        let d = self.node_of(dst);
        self.graph.add_edge(s, d, edge)
    }

    pub fn node_of(&self, endpoint: EndpointRef) -> NodeIndex {
        *self
            .nodes_by_ref
            .get(&endpoint)
            .unwrap_or_else(|| panic!("endpoint not part of service chain {}", self.name))
    }

    /// Payload of the first edge ever added between two endpoints. Parallel
    /// edges between the same endpoint pair share this payload for
    /// transmission sizing.
    pub fn first_edge_payload(&self, src: EndpointRef, dst: EndpointRef) -> f64 {
        let s = self.node_of(src);
        let d = self.node_of(dst);
        self.graph
            .edge_references()
            .find(|e| e.source() == s && e.target() == d)
            .map(|e| e.weight().payload)
            .unwrap_or_else(|| panic!("no edge between endpoints in chain {}", self.name))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

// ============================================================================
// Alternative graph
// ============================================================================

/// A node of the alternative graph: copy `copy` of an endpoint function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AltNode {
    pub copy: usize,
    pub endpoint: EndpointRef,
}

/// Precomputed routing state for one deployed service chain.
#[derive(Debug, Clone)]
pub struct ServiceChainManager {
    pub id: ScmId,
    pub name: String,
    pub chain: ServiceChain,
    pub alt: DiGraph<AltNode, ChainEdge>,
    /// Maximal linear paths of the alternative graph; fork points start new
    /// subchains.
    pub subchains: Vec<Vec<NodeIndex>>,
    /// Dense alt-node -> subchain id map.
    node_subchain: Vec<usize>,
    pub root: NodeIndex,
}

impl ServiceChainManager {
    /// Builds the manager: unfolds the chain, extracts subchains, finds the
    /// root.
    ///
    /// # Panics
    ///
    /// Panics on an empty chain or a chain without a unique entry node.
    pub fn new(id: ScmId, name: impl Into<String>, chain: ServiceChain) -> Self {
        assert!(chain.node_count() > 0, "service chain length can't be zero");

        let (alt, first_node) = Self::generate_alternative_graph(&chain);
        let mut subchains: Vec<Vec<NodeIndex>> = vec![Vec::new()];
        let mut node_subchain = vec![usize::MAX; alt.node_count()];
        Self::extract_subchains(&alt, &mut subchains, &mut node_subchain, first_node, 0, false);

        let root = alt
            .node_indices()
            .find(|n| alt.edges_directed(*n, Direction::Incoming).next().is_none())
            .expect("alternative graph has no entry node");

        Self {
            id,
            name: name.into(),
            chain,
            alt,
            subchains,
            node_subchain,
            root,
        }
    }

    /// Unfolds merges: every chain node becomes `max(in_degree, 1)` alt
    /// copies (the entry node counts one extra incoming slot), and each
    /// incoming edge lands on its own copy. Outgoing edges leave from the
    /// most recently materialized copy of their source.
    fn generate_alternative_graph(
        chain: &ServiceChain,
    ) -> (DiGraph<AltNode, ChainEdge>, NodeIndex) {
        let mut alt = DiGraph::new();
        let mut alt_nodes: HashMap<(usize, NodeIndex), NodeIndex> = HashMap::new();
        let mut incoming_copy: HashMap<NodeIndex, usize> = HashMap::new();
        let mut out_copy: HashMap<NodeIndex, isize> = HashMap::new();
        let mut first_alt_node = None;

        for (counter, node) in chain.graph.node_indices().enumerate() {
            let mut in_degree = chain
                .graph
                .edges_directed(node, Direction::Incoming)
                .count();
            if counter == 0 {
                incoming_copy.insert(node, 1);
                out_copy.insert(node, 0);
                in_degree += 1;
            } else {
                incoming_copy.insert(node, 0);
                out_copy.insert(node, -1);
            }

            let copies = in_degree.max(1);
            for copy in 0..copies {
                let ix = alt.add_node(AltNode {
                    copy,
                    endpoint: chain.graph[node],
                });
                alt_nodes.insert((copy, node), ix);
                if first_alt_node.is_none() {
                    first_alt_node = Some(ix);
                }
            }
        }

        // Wire edges in insertion order. Each edge into a node claims the
        // next unclaimed copy; the node's outgoing edges then originate from
        // that copy.
        let mut materialized: HashMap<(usize, NodeIndex), ()> = HashMap::new();
        for edge in chain.graph.edge_references() {
            let u = edge.source();
            let v = edge.target();

            let u_out = out_copy[&u];
            assert!(
                u_out >= 0,
                "service chain {}: edge leaves a node before any edge reaches it; \
                 add edges in flow order from a single entry node",
                chain.name
            );
            materialized.entry((u_out as usize, u)).or_insert(());

            let claimed = incoming_copy[&v];
            if !materialized.contains_key(&(claimed, v)) {
                materialized.insert((claimed, v), ());
                *incoming_copy.get_mut(&v).expect("node seen above") += 1;
                *out_copy.get_mut(&v).expect("node seen above") += 1;
            }

            let src = alt_nodes[&(u_out as usize, u)];
            let dst = alt_nodes[&(claimed, v)];
            alt.add_edge(src, dst, edge.weight().clone());
        }

        (alt, first_alt_node.expect("chain has at least one node"))
    }

    /// Walks the alternative graph splitting at forks: a single successor
    /// continues the current subchain, several successors each open a new
    /// one.
    fn extract_subchains(
        alt: &DiGraph<AltNode, ChainEdge>,
        subchains: &mut Vec<Vec<NodeIndex>>,
        node_subchain: &mut [usize],
        current: NodeIndex,
        subchain_id: usize,
        append: bool,
    ) {
        let sid = if append || subchain_id >= subchains.len() {
            subchains.push(Vec::new());
            subchains.len() - 1
        } else {
            subchain_id
        };

        subchains[sid].push(current);
        node_subchain[current.index()] = sid;

        let successors = Self::successors_in_order_of(alt, current);
        match successors.len() {
            0 => {}
            1 => Self::extract_subchains(alt, subchains, node_subchain, successors[0], sid, false),
            _ => {
                for s in successors {
                    Self::extract_subchains(alt, subchains, node_subchain, s, 0, true);
                }
            }
        }
    }

    fn successors_in_order_of(
        alt: &DiGraph<AltNode, ChainEdge>,
        node: NodeIndex,
    ) -> Vec<NodeIndex> {
        let mut out: Vec<(EdgeIndex, NodeIndex)> = alt
            .edges_directed(node, Direction::Outgoing)
            .map(|e| (e.id(), e.target()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out.into_iter().map(|(_, target)| target).collect()
    }

    /// Successors of an alt node, in chain-edge insertion order.
    pub fn successors_in_order(&self, node: NodeIndex) -> Vec<NodeIndex> {
        Self::successors_in_order_of(&self.alt, node)
    }

    /// The subchain an alt node belongs to.
    ///
    /// # Panics
    ///
    /// Panics for nodes the extraction never reached (malformed chains).
    pub fn node_subchain(&self, node: NodeIndex) -> usize {
        let sid = self.node_subchain[node.index()];
        assert!(sid != usize::MAX, "alt node outside every subchain");
        sid
    }

    pub fn subchain_count(&self) -> usize {
        self.subchains.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latsim_types::{EndpointId, MsId};

    fn ep(ms: u32) -> EndpointRef {
        EndpointRef {
            ms: MsId::new(ms),
            endpoint: EndpointId::new(0),
        }
    }

    fn edge(name: &str, payload: f64) -> ChainEdge {
        ChainEdge {
            name: name.into(),
            payload,
        }
    }

    fn linear_chain(n: u32) -> ServiceChain {
        let mut chain = ServiceChain::new("linear");
        for i in 0..n {
            chain.add_node(ep(i));
        }
        for i in 1..n {
            chain.add_edge(ep(i - 1), ep(i), edge(&format!("e{i}"), 100.0));
        }
        chain
    }

    #[test]
    fn single_node_chain_has_one_subchain() {
        let scm = ServiceChainManager::new(ScmId::new(0), "sfc", linear_chain(1));
        assert_eq!(scm.subchain_count(), 1);
        assert_eq!(scm.subchains[0].len(), 1);
        assert_eq!(scm.node_subchain(scm.root), 0);
    }

    #[test]
    fn linear_chain_stays_one_subchain() {
        let scm = ServiceChainManager::new(ScmId::new(0), "sfc", linear_chain(3));
        assert_eq!(scm.subchain_count(), 1);
        assert_eq!(scm.subchains[0].len(), 3);
        assert_eq!(scm.successors_in_order(scm.root).len(), 1);
    }

    #[test]
    fn fork_opens_one_subchain_per_branch() {
        // a -> b, a -> c
        let mut chain = ServiceChain::new("fork");
        for i in 0..3 {
            chain.add_node(ep(i));
        }
        chain.add_edge(ep(0), ep(1), edge("ab", 10.0));
        chain.add_edge(ep(0), ep(2), edge("ac", 20.0));

        let scm = ServiceChainManager::new(ScmId::new(0), "sfc", chain);
        assert_eq!(scm.subchain_count(), 3);
        assert_eq!(scm.subchains[0], vec![scm.root]);
        assert_eq!(scm.successors_in_order(scm.root).len(), 2);
    }

    #[test]
    fn merge_duplicates_the_join_node_per_branch() {
        // a -> b -> d, a -> c -> d, d -> e
        let mut chain = ServiceChain::new("diamond");
        for i in 0..5 {
            chain.add_node(ep(i));
        }
        chain.add_edge(ep(0), ep(1), edge("ab", 1.0));
        chain.add_edge(ep(0), ep(2), edge("ac", 1.0));
        chain.add_edge(ep(1), ep(3), edge("bd", 1.0));
        chain.add_edge(ep(2), ep(3), edge("cd", 1.0));
        chain.add_edge(ep(3), ep(4), edge("de", 1.0));

        let scm = ServiceChainManager::new(ScmId::new(0), "sfc", chain);

        // Two copies of d exist, one per incoming branch.
        let d_copies = scm
            .alt
            .node_indices()
            .filter(|n| scm.alt[*n].endpoint == ep(3))
            .count();
        assert_eq!(d_copies, 2);

        // Root fork, then one subchain per branch; the continuation after
        // the merge rides on the branch that claimed the last copy.
        assert_eq!(scm.subchain_count(), 3);
        let lens: Vec<usize> = scm.subchains.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![1, 2, 3]);
    }

    #[test]
    fn first_parallel_edge_sizes_the_payload() {
        let mut chain = ServiceChain::new("parallel");
        chain.add_node(ep(0));
        chain.add_node(ep(1));
        chain.add_edge(ep(0), ep(1), edge("first", 111.0));
        chain.add_edge(ep(0), ep(1), edge("second", 222.0));
        assert_eq!(chain.first_edge_payload(ep(0), ep(1)), 111.0);
    }
}
