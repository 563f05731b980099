//! # Topology & Link-State Model
//!
//! Nodes, their interfaces, and point-to-point links with an explicit up/down
//! state. State only changes through [`Topology::set_link_state`], which the
//! experiment context calls from scheduled callbacks, so every transition is
//! totally ordered by the scheduler. Route recomputation is not done here.

use crate::error::TopologyError;
use crate::time::{SimDuration, SimTime};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// MTU used to convert byte-sized queue limits into packets.
pub const DEFAULT_MTU: u32 = 1400;
/// Lower bound for automatically sized packet queues.
const MIN_QUEUE_PACKETS: u32 = 20;

// ─── Identifiers ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link{}", self.0)
    }
}

/// Interface `index` on `node`. Index 0 is the loopback interface, so the
/// first link attached to a node gets index 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InterfaceId {
    pub node: NodeId,
    pub index: u32,
}

// ─── Link Attributes ────────────────────────────────────────────────────────

/// Per-packet error model applied on receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LossModel {
    /// Each packet is lost independently with `probability` (0.0-1.0).
    Rate { probability: f64 },
    /// Gilbert-Elliott two-state model. `p` is the Good -> Bad transition
    /// probability, `r` Bad -> Good; `loss_good`/`loss_bad` are the loss
    /// probabilities within each state. All values are 0.0-1.0.
    GilbertElliott {
        p: f64,
        r: f64,
        loss_good: f64,
        loss_bad: f64,
    },
}

impl LossModel {
    /// Long-run average loss probability.
    pub fn mean_loss(&self) -> f64 {
        match *self {
            LossModel::Rate { probability } => probability.clamp(0.0, 1.0),
            LossModel::GilbertElliott {
                p,
                r,
                loss_good,
                loss_bad,
            } => {
                if p + r <= 0.0 {
                    return loss_good.clamp(0.0, 1.0);
                }
                let bad_share = p / (p + r);
                ((1.0 - bad_share) * loss_good + bad_share * loss_bad).clamp(0.0, 1.0)
            }
        }
    }
}

/// Queueing discipline installed on both ends of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueDisc {
    PfifoFast { limit_packets: Option<u32> },
    CoDel { limit_bytes: Option<u64> },
}

impl Default for QueueDisc {
    fn default() -> Self {
        QueueDisc::PfifoFast {
            limit_packets: None,
        }
    }
}

impl QueueDisc {
    pub fn name(&self) -> &'static str {
        match self {
            QueueDisc::PfifoFast { .. } => "pfifo_fast",
            QueueDisc::CoDel { .. } => "codel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkAttributes {
    pub data_rate_bps: u64,
    /// One-way propagation delay.
    pub delay: SimDuration,
    pub loss: Option<LossModel>,
    pub queue: QueueDisc,
}

impl Default for LinkAttributes {
    fn default() -> Self {
        LinkAttributes {
            data_rate_bps: 100_000_000,
            delay: SimDuration::ZERO,
            loss: None,
            queue: QueueDisc::default(),
        }
    }
}

impl LinkAttributes {
    /// Queue capacity in bytes. When the discipline carries no explicit limit
    /// it is sized to one round trip's worth of data at line rate
    /// (`rate/8 × 2 × rtt_delay`), where `rtt_delay` is the one-way delay of
    /// the path the queue feeds.
    pub fn queue_limit_bytes(&self, rtt_delay: SimDuration) -> u64 {
        match self.queue {
            QueueDisc::PfifoFast {
                limit_packets: Some(p),
            } => p as u64 * DEFAULT_MTU as u64,
            QueueDisc::CoDel {
                limit_bytes: Some(b),
            } => b,
            _ => {
                let packets = bdp_queue_packets(self.data_rate_bps, rtt_delay, DEFAULT_MTU);
                packets as u64 * DEFAULT_MTU as u64
            }
        }
    }
}

/// Bandwidth-delay sized queue in packets: `rate/8 × 2 × delay / mtu`,
/// never less than 20 packets.
pub fn bdp_queue_packets(rate_bps: u64, delay: SimDuration, mtu: u32) -> u32 {
    let delay_ns = delay.as_nanos().max(0) as u128;
    let bytes = rate_bps as u128 * 2 * delay_ns / 8_000_000_000;
    let packets = u32::try_from(bytes / mtu.max(1) as u128).unwrap_or(u32::MAX);
    packets.max(MIN_QUEUE_PACKETS)
}

// ─── Nodes and Links ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Interfaces in index order; entry 0 is loopback and has no link.
    interfaces: Vec<Option<LinkId>>,
}

impl Node {
    pub fn interface_count(&self) -> u32 {
        self.interfaces.len() as u32
    }

    pub fn links(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.interfaces.iter().flatten().copied()
    }
}

#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub name: String,
    pub ends: [InterfaceId; 2],
    pub attributes: LinkAttributes,
    up: bool,
}

impl Link {
    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn connects(&self, a: NodeId, b: NodeId) -> bool {
        let [x, y] = self.ends;
        (x.node == a && y.node == b) || (x.node == b && y.node == a)
    }

    pub fn peer_of(&self, node: NodeId) -> Option<NodeId> {
        let [x, y] = self.ends;
        if x.node == node {
            Some(y.node)
        } else if y.node == node {
            Some(x.node)
        } else {
            None
        }
    }
}

/// Result of a link-state mutation, forwarded to the routing collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStateChange {
    pub link: LinkId,
    pub up: bool,
    pub previous: bool,
    pub at: SimTime,
}

impl LinkStateChange {
    /// Whether the call actually flipped the state.
    pub fn changed(&self) -> bool {
        self.up != self.previous
    }
}

// ─── Topology ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: Vec<Node>,
    links: Vec<Link>,
    node_names: HashMap<String, NodeId>,
    link_names: HashMap<String, LinkId>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str) -> Result<NodeId, TopologyError> {
        if self.node_names.contains_key(name) {
            return Err(TopologyError::DuplicateName(name.to_string()));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            interfaces: vec![None],
        });
        self.node_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Connects `a` and `b`, creating one interface on each. Links start up.
    pub fn add_link(
        &mut self,
        name: &str,
        a: NodeId,
        b: NodeId,
        attributes: LinkAttributes,
    ) -> Result<LinkId, TopologyError> {
        if self.link_names.contains_key(name) {
            return Err(TopologyError::DuplicateName(name.to_string()));
        }
        self.node(a)?;
        self.node(b)?;

        let id = LinkId(self.links.len() as u32);
        let ia = self.attach(a, id);
        let ib = self.attach(b, id);
        self.links.push(Link {
            id,
            name: name.to_string(),
            ends: [ia, ib],
            attributes,
            up: true,
        });
        self.link_names.insert(name.to_string(), id);
        Ok(id)
    }

    fn attach(&mut self, node: NodeId, link: LinkId) -> InterfaceId {
        let n = &mut self.nodes[node.0 as usize];
        n.interfaces.push(Some(link));
        InterfaceId {
            node,
            index: n.interfaces.len() as u32 - 1,
        }
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, TopologyError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(TopologyError::UnknownNode(id))
    }

    pub fn link(&self, id: LinkId) -> Result<&Link, TopologyError> {
        self.links
            .get(id.0 as usize)
            .ok_or(TopologyError::UnknownLink(id))
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.node_names.get(name).copied()
    }

    pub fn link_by_name(&self, name: &str) -> Option<LinkId> {
        self.link_names.get(name).copied()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// The link behind interface `index` of `node`.
    pub fn interface_link(&self, node: NodeId, index: u32) -> Result<LinkId, TopologyError> {
        self.node(node)?
            .interfaces
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or(TopologyError::UnknownInterface { node, index })
    }

    pub fn link_state(&self, id: LinkId) -> Result<bool, TopologyError> {
        Ok(self.link(id)?.up)
    }

    /// Sets a link up or down. Setting the current state again is allowed and
    /// reported with `changed() == false`.
    pub fn set_link_state(
        &mut self,
        id: LinkId,
        up: bool,
        at: SimTime,
    ) -> Result<LinkStateChange, TopologyError> {
        let link = self
            .links
            .get_mut(id.0 as usize)
            .ok_or(TopologyError::UnknownLink(id))?;
        let previous = link.up;
        link.up = up;
        Ok(LinkStateChange {
            link: id,
            up,
            previous,
            at,
        })
    }

    /// Interface-addressed form of [`set_link_state`](Self::set_link_state),
    /// matching how scenarios toggle "interface 2 of gateway 0".
    pub fn set_interface_state(
        &mut self,
        node: NodeId,
        index: u32,
        up: bool,
        at: SimTime,
    ) -> Result<LinkStateChange, TopologyError> {
        let link = self.interface_link(node, index)?;
        self.set_link_state(link, up, at)
    }

    /// Links between `a` and `b` that are currently up, in id order.
    pub fn up_links_between(&self, a: NodeId, b: NodeId) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|l| l.up && l.connects(a, b))
            .map(|l| l.id)
            .collect()
    }
}

// ─── Link-State History ─────────────────────────────────────────────────────

/// Ordered record of every link-state mutation of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStateHistory {
    initial: Vec<bool>,
    changes: Vec<LinkStateChange>,
}

impl LinkStateHistory {
    /// Captures the state of every link before the run starts.
    pub fn new(topology: &Topology) -> Self {
        LinkStateHistory {
            initial: topology.links().iter().map(|l| l.is_up()).collect(),
            changes: Vec::new(),
        }
    }

    pub fn record(&mut self, change: LinkStateChange) {
        self.changes.push(change);
    }

    pub fn changes(&self) -> &[LinkStateChange] {
        &self.changes
    }

    /// State of `link` once every change with `at <= t` has been applied.
    pub fn is_up_at(&self, link: LinkId, t: SimTime) -> bool {
        let initial = self.initial.get(link.0 as usize).copied().unwrap_or(false);
        self.changes
            .iter()
            .take_while(|c| c.at <= t)
            .filter(|c| c.link == link)
            .last()
            .map_or(initial, |c| c.up)
    }

    /// Links up at `t`, in id order.
    pub fn up_links_at(&self, t: SimTime) -> Vec<LinkId> {
        (0..self.initial.len() as u32)
            .map(LinkId)
            .filter(|l| self.is_up_at(*l, t))
            .collect()
    }

    /// Instants at which the state of any link changed, deduplicated.
    pub fn transition_times(&self) -> Vec<SimTime> {
        let mut times: Vec<SimTime> = self.changes.iter().map(|c| c.at).collect();
        times.dedup();
        times
    }
}
