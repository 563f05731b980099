//! Interfaces to the external engine: routing, the transport stack and the
//! traffic generators installed on nodes.
//!
//! The core never implements protocol logic. It drives these collaborators
//! from scheduled callbacks and consumes what they report.

use crate::flow::FlowSnapshot;
use crate::time::{SimDuration, SimTime};
use crate::topology::{LinkId, NodeId, Topology};
use crate::trace::{ObjectPath, ObjectRegistry, TraceEvent};

/// Route computation over the current link states.
pub trait RoutingCollaborator {
    /// Rebuilds forwarding state. Called synchronously after every link-state
    /// change and once before the run starts.
    fn recompute(&mut self, topology: &Topology);

    /// Link a packet at `from` takes towards `to`, or `None` when unreachable.
    fn next_link(&self, from: NodeId, to: NodeId) -> Option<LinkId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Reliable stream over a connection (QUIC/TCP-like).
    Stream,
    /// Unacknowledged datagrams (UDP).
    Datagram,
}

/// Application-level traffic source bound to a source and a sink node.
pub trait TrafficGenerator {
    fn name(&self) -> &str;
    fn source(&self) -> NodeId;
    fn sink(&self) -> NodeId;
    fn transport(&self) -> TransportKind;
    /// Destination port, used by the stack to build flow 5-tuples.
    fn port(&self) -> u16;
    /// Payload bytes per packet.
    fn packet_size(&self) -> u32;

    fn start(&mut self, now: SimTime);
    fn stop(&mut self, now: SimTime);
    fn is_active(&self, now: SimTime) -> bool;

    /// Bytes the application wants to hand to the stack during `dt`.
    fn offered_bytes(&mut self, now: SimTime, dt: SimDuration) -> u64;
    fn on_sent(&mut self, bytes: u64);
    fn on_delivered(&mut self, bytes: u64);

    fn total_tx(&self) -> u64;
    /// Cumulative bytes received by the sink side.
    fn total_rx(&self) -> u64;
}

/// What the stack reports while advancing.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEvent {
    /// A protocol object came into existence and is registered.
    ObjectCreated { path: ObjectPath },
    Trace { object: ObjectPath, event: TraceEvent },
    /// A packet was dropped by the receiving PHY of `link`.
    PhyDrop { link: LinkId },
}

/// Everything the stack may look at or touch during one advance step.
pub struct StackEnv<'a> {
    pub now: SimTime,
    pub topology: &'a Topology,
    pub routing: &'a dyn RoutingCollaborator,
    pub apps: &'a mut [Box<dyn TrafficGenerator>],
    pub objects: &'a mut ObjectRegistry,
}

/// The external transport stack.
pub trait TransportStack {
    /// Period of the repeating advance task.
    fn tick(&self) -> SimDuration;

    /// Moves the stack forward to `env.now`, appending what happened to
    /// `events` in emission order.
    fn advance(&mut self, env: StackEnv<'_>, events: &mut Vec<StackEvent>);

    /// Cumulative counters of every flow seen so far.
    fn flows(&self) -> Vec<FlowSnapshot>;

    /// End-of-run accounting: packets still in flight count as lost.
    fn finalize(&mut self, now: SimTime);
}

/// The full set of collaborators an experiment runs against.
pub struct Collaborators {
    pub routing: Box<dyn RoutingCollaborator>,
    pub stack: Box<dyn TransportStack>,
    /// One generator per configured application, in configuration order.
    pub apps: Vec<Box<dyn TrafficGenerator>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field(
                "apps",
                &self.apps.iter().map(|a| a.name().to_string()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
