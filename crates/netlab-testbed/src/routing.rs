//! Shortest-hop routing over the links that are currently up.
//!
//! Recomputed from scratch on every link-state change, like a global route
//! manager. Ties between equal-length paths go to the lower link id, so
//! a parallel backup link only carries traffic once the primary is down.

use netlab_core::collab::RoutingCollaborator;
use netlab_core::topology::{LinkId, NodeId, Topology};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct GlobalRouting {
    /// (from, to) -> first hop.
    next_hop: HashMap<(NodeId, NodeId), LinkId>,
    recomputes: u64,
}

impl GlobalRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recomputes(&self) -> u64 {
        self.recomputes
    }

    /// Links traversed from `from` to `to`, or `None` when unreachable.
    pub fn path(&self, topology: &Topology, from: NodeId, to: NodeId) -> Option<Vec<LinkId>> {
        route(self, topology, from, to)
    }
}

/// Follows `next_link` hop by hop. Bounded by the node count so a stale
/// table can never loop forever.
pub fn route(
    routing: &dyn RoutingCollaborator,
    topology: &Topology,
    from: NodeId,
    to: NodeId,
) -> Option<Vec<LinkId>> {
    let mut path = Vec::new();
    let mut at = from;
    while at != to {
        if path.len() > topology.nodes().len() {
            return None;
        }
        let link = routing.next_link(at, to)?;
        at = topology.link(link).ok()?.peer_of(at)?;
        path.push(link);
    }
    Some(path)
}

impl RoutingCollaborator for GlobalRouting {
    fn recompute(&mut self, topology: &Topology) {
        self.recomputes += 1;
        self.next_hop.clear();

        // Adjacency over up links, in link id order.
        let mut adjacency: HashMap<NodeId, Vec<(LinkId, NodeId)>> = HashMap::new();
        for link in topology.links().iter().filter(|l| l.is_up()) {
            let [a, b] = link.ends;
            adjacency.entry(a.node).or_default().push((link.id, b.node));
            adjacency.entry(b.node).or_default().push((link.id, a.node));
        }

        // BFS from every destination; the hop that reaches a node first is
        // its next hop towards that destination.
        for dst in topology.nodes().iter().map(|n| n.id) {
            let mut queue = VecDeque::from([dst]);
            let mut seen = HashSet::from([dst]);
            while let Some(node) = queue.pop_front() {
                for &(link, peer) in adjacency.get(&node).into_iter().flatten() {
                    if seen.insert(peer) {
                        self.next_hop.insert((peer, dst), link);
                        queue.push_back(peer);
                    }
                }
            }
        }

        tracing::debug!(
            routes = self.next_hop.len(),
            recomputes = self.recomputes,
            "routes recomputed"
        );
    }

    fn next_link(&self, from: NodeId, to: NodeId) -> Option<LinkId> {
        self.next_hop.get(&(from, to)).copied()
    }
}
