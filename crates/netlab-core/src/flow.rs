//! Flow identities and cumulative counters.
//!
//! Counters belong to the transport stack; the statistics engine only ever
//! sees [`FlowSnapshot`] copies of them.

use crate::time::SimDuration;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct FlowId(pub u32);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

impl Protocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Other(n) => n,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Other(n) => write!(f, "proto{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FiveTuple {
    pub protocol: Protocol,
    pub source: Ipv4Addr,
    pub source_port: u16,
    pub destination: Ipv4Addr,
    pub destination_port: u16,
}

/// `UDP 10.1.1.1 / 49153 --> 10.1.2.2 / 50000`
impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} / {} --> {} / {}",
            self.protocol, self.source, self.source_port, self.destination, self.destination_port
        )
    }
}

/// Monotonically non-decreasing per-flow counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowCounters {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub lost_packets: u64,
    /// Sum of one-way delays of all received packets.
    pub delay_sum: SimDuration,
    /// Sum of delay variation between consecutive received packets.
    pub jitter_sum: SimDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub id: FlowId,
    pub tuple: FiveTuple,
    pub counters: FlowCounters,
}

// ─── Exclusion ──────────────────────────────────────────────────────────────

type FlowPredicate = Box<dyn Fn(&FlowSnapshot) -> bool>;

/// Flows left out of statistics and reports, typically the reverse (ACK)
/// direction or control traffic of a particular topology.
#[derive(Default)]
pub struct FlowFilter {
    flow_ids: BTreeSet<FlowId>,
    sources: BTreeSet<Ipv4Addr>,
    predicate: Option<FlowPredicate>,
}

impl FlowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_flow(mut self, id: FlowId) -> Self {
        self.flow_ids.insert(id);
        self
    }

    pub fn exclude_source(mut self, addr: Ipv4Addr) -> Self {
        self.sources.insert(addr);
        self
    }

    /// Adds a custom exclusion rule, OR-ed with the id/source lists.
    pub fn exclude_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FlowSnapshot) -> bool + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn is_excluded(&self, flow: &FlowSnapshot) -> bool {
        self.flow_ids.contains(&flow.id)
            || self.sources.contains(&flow.tuple.source)
            || self.predicate.as_ref().is_some_and(|p| p(flow))
    }
}

impl fmt::Debug for FlowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowFilter")
            .field("flow_ids", &self.flow_ids)
            .field("sources", &self.sources)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
