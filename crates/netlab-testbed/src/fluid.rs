//! # Fluid Transport Stack
//!
//! A packet-granular but deliberately coarse transport model. Each hop is a
//! fluid FIFO draining at line rate; loss models are sampled per hop on
//! receive; stream connections run an AIMD window driven by acknowledgments.
//! It exists to feed the orchestration core realistic counters and trace
//! events, not to be a faithful protocol implementation.

use crate::routing::route;
use netlab_core::collab::{StackEnv, StackEvent, TrafficGenerator, TransportKind, TransportStack};
use netlab_core::config::parse_duration;
use netlab_core::error::ConfigError;
use netlab_core::flow::{FiveTuple, FlowCounters, FlowId, FlowSnapshot, Protocol};
use netlab_core::scenario::stream_seed;
use netlab_core::topology::{LinkId, LossModel, NodeId, Topology};
use netlab_core::trace::{
    HeaderForm, Layer, ObjectPath, ObjectRegistry, Property, TraceEvent, WindowKind,
};
use netlab_core::{ExperimentConfig, SimDuration, SimTime};
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::net::Ipv4Addr;

/// Source ports are handed out from here, one per application.
const EPHEMERAL_PORT_BASE: u16 = 49153;
/// Wire size of an acknowledgment.
const ACK_BYTES: u32 = 50;
/// Packets sent with a long header before switching to short headers.
const LONG_HEADER_PACKETS: u64 = 2;
/// RTT assumed until the first sample arrives.
const INITIAL_RTT: SimDuration = SimDuration::from_millis(100);
/// Upper bound on packets a single connection emits per advance.
const MAX_BURST_PACKETS: u32 = 10_000;
/// Random stream index of the per-hop loss sampler.
const LOSS_STREAM: u64 = 2;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Congestion response flavour. Only the multiplicative decrease differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    NewReno,
    Cubic,
    Bbr,
}

impl Variant {
    /// Accepts `NewReno`, `TcpCubic`, `bbr` and similar spellings.
    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let bare = lower.strip_prefix("tcp").unwrap_or(&lower);
        match bare {
            "newreno" => Some(Variant::NewReno),
            "cubic" => Some(Variant::Cubic),
            "bbr" => Some(Variant::Bbr),
            _ => None,
        }
    }

    /// Window multiplier applied on loss.
    pub fn backoff(self) -> f64 {
        match self {
            Variant::NewReno => 0.5,
            Variant::Cubic => 0.7,
            Variant::Bbr => 0.85,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FluidConfigInput {
    variant: String,
    tick: String,
    mss: u32,
    /// Initial congestion window in packets.
    initial_cwnd: u32,
    /// Receive buffer in bytes.
    rwnd: u32,
    spin_bit: bool,
    receive_window: bool,
    ack_every: u32,
}

impl Default for FluidConfigInput {
    fn default() -> Self {
        Self {
            variant: "NewReno".into(),
            tick: "1ms".into(),
            mss: 1400,
            initial_cwnd: 10,
            rwnd: 4 * 1024 * 1024,
            spin_bit: true,
            receive_window: true,
            ack_every: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FluidConfig {
    pub variant: Variant,
    pub tick: SimDuration,
    pub mss: u32,
    pub initial_cwnd: u32,
    pub rwnd: u32,
    /// Expose the spin bit property on stream sockets.
    pub spin_bit: bool,
    /// Expose the receive window property on stream sockets.
    pub receive_window: bool,
    pub ack_every: u32,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            variant: Variant::NewReno,
            tick: SimDuration::from_millis(1),
            mss: 1400,
            initial_cwnd: 10,
            rwnd: 4 * 1024 * 1024,
            spin_bit: true,
            receive_window: true,
            ack_every: 2,
        }
    }
}

impl FluidConfig {
    /// Reads the experiment's `[stack]` table.
    pub fn from_table(table: &toml::Table) -> Result<Self, ConfigError> {
        let input: FluidConfigInput = toml::Value::Table(table.clone())
            .try_into()
            .map_err(|e| ConfigError::invalid("stack", e.to_string()))?;
        input.resolve()
    }
}

impl FluidConfigInput {
    fn resolve(self) -> Result<FluidConfig, ConfigError> {
        let variant =
            Variant::parse(&self.variant).ok_or(ConfigError::UnknownProtocol(self.variant))?;
        let tick = parse_duration(&self.tick).map_err(|r| ConfigError::invalid("stack.tick", r))?;
        if !tick.is_positive() {
            return Err(ConfigError::invalid("stack.tick", "must be positive"));
        }
        if self.mss == 0 {
            return Err(ConfigError::invalid("stack.mss", "must be positive"));
        }
        Ok(FluidConfig {
            variant,
            tick,
            mss: self.mss,
            initial_cwnd: self.initial_cwnd.max(1),
            rwnd: self.rwnd.max(self.mss),
            spin_bit: self.spin_bit,
            receive_window: self.receive_window,
            ack_every: self.ack_every.max(1),
        })
    }
}

// ─── Packets ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Payload {
    Data,
    Datagram,
    /// Acknowledges `acked` bytes and echoes the send time of the newest
    /// data packet it covers.
    Ack { acked: u64, echo: SimTime },
    /// Sender-side discovery that `credit` bytes will never be acked.
    LossNotice { credit: u64, backoff: bool },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    arrive: SimTime,
    seq: u64,
    conn: usize,
    flow: usize,
    bytes: u32,
    sent_at: SimTime,
    payload: Payload,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.arrive, self.seq).cmp(&(other.arrive, other.seq))
    }
}

enum Transit {
    Arrives(SimTime),
    /// `phy` is set when the link's error model dropped the packet rather
    /// than a full queue.
    Lost { phy: Option<LinkId> },
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Fluid FIFO on one direction of a link.
#[derive(Debug, Clone, Copy)]
struct HopQueue {
    backlog: f64,
    updated: SimTime,
    /// Gilbert-Elliott state.
    bad: bool,
}

#[derive(Debug)]
struct FlowState {
    id: FlowId,
    tuple: FiveTuple,
    counters: FlowCounters,
    last_delay: Option<SimDuration>,
}

#[derive(Debug)]
struct Connection {
    app: usize,
    kind: TransportKind,
    source: NodeId,
    sink: NodeId,
    data_flow: usize,
    ack_flow: Option<usize>,
    client: Option<ObjectPath>,
    server: Option<ObjectPath>,

    cwnd: u32,
    ssthresh: u32,
    in_flight: u64,
    srtt: Option<SimDuration>,
    last_rtt: Option<SimDuration>,
    last_backoff: Option<SimTime>,

    received: u64,
    unacked_packets: u32,
    unacked_bytes: u64,
    advertised: u32,
    spin: bool,
    spin_flipped: SimTime,
}

/// The fluid stack. Connections open the first time their application is
/// seen active; a stream application gets a data flow and an ACK flow, a
/// datagram application a single flow.
pub struct FluidStack {
    config: FluidConfig,
    rng: StdRng,
    flows: Vec<FlowState>,
    conns: Vec<Connection>,
    by_app: HashMap<usize, usize>,
    queues: HashMap<(LinkId, NodeId), HopQueue>,
    pending: BinaryHeap<Reverse<InFlight>>,
    next_seq: u64,
    last_advance: Option<SimTime>,
}

impl std::fmt::Debug for FluidStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluidStack")
            .field("variant", &self.config.variant)
            .field("flows", &self.flows.len())
            .field("connections", &self.conns.len())
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

/// `10.1.{n+1}.1`, one subnet per node.
pub fn node_address(node: NodeId) -> Ipv4Addr {
    let octet = u8::try_from(node.0 + 1).unwrap_or(u8::MAX);
    Ipv4Addr::new(10, 1, octet, 1)
}

fn sample_loss(rng: &mut StdRng, model: &LossModel, bad: &mut bool) -> bool {
    match *model {
        LossModel::Rate { probability } => rng.random::<f64>() < probability,
        LossModel::GilbertElliott {
            p,
            r,
            loss_good,
            loss_bad,
        } => {
            let flip = if *bad { r } else { p };
            if rng.random::<f64>() < flip {
                *bad = !*bad;
            }
            let loss = if *bad { loss_bad } else { loss_good };
            rng.random::<f64>() < loss
        }
    }
}

impl FluidStack {
    pub fn new(config: FluidConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            flows: Vec::new(),
            conns: Vec::new(),
            by_app: HashMap::new(),
            queues: HashMap::new(),
            pending: BinaryHeap::new(),
            next_seq: 0,
            last_advance: None,
        }
    }

    /// Stack for an experiment: reads `[stack]` and seeds the loss sampler
    /// from the experiment's seed and run.
    pub fn for_experiment(config: &ExperimentConfig) -> Result<Self, ConfigError> {
        let fluid = FluidConfig::from_table(&config.stack)?;
        tracing::info!(
            variant = ?fluid.variant,
            tick = %fluid.tick,
            mss = fluid.mss,
            "fluid stack configured"
        );
        Ok(Self::new(
            fluid,
            stream_seed(config.seed, config.run, LOSS_STREAM),
        ))
    }

    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn socket_properties(&self) -> Vec<Property> {
        let mut props = vec![Property::CongestionWindow, Property::Rtt, Property::Rx];
        if self.config.receive_window {
            props.push(Property::ReceiveWindow);
        }
        if self.config.spin_bit {
            props.push(Property::SpinBit);
        }
        props
    }

    fn add_flow(&mut self, tuple: FiveTuple) -> usize {
        let id = FlowId(self.flows.len() as u32 + 1);
        self.flows.push(FlowState {
            id,
            tuple,
            counters: FlowCounters::default(),
            last_delay: None,
        });
        self.flows.len() - 1
    }

    // ─── Connection Setup ───────────────────────────────────────────────

    fn open(
        &mut self,
        app_index: usize,
        app: &dyn TrafficGenerator,
        objects: &mut ObjectRegistry,
        events: &mut Vec<StackEvent>,
        now: SimTime,
    ) {
        let (source, sink) = (app.source(), app.sink());
        let port = EPHEMERAL_PORT_BASE.saturating_add(u16::try_from(app_index).unwrap_or(u16::MAX));
        let tuple = FiveTuple {
            protocol: Protocol::Udp,
            source: node_address(source),
            source_port: port,
            destination: node_address(sink),
            destination_port: app.port(),
        };
        let data_flow = self.add_flow(tuple);

        let (client, server, ack_flow) = match app.transport() {
            TransportKind::Stream => {
                let props = self.socket_properties();
                let client = objects.register(source, Layer::TransportL4, &props);
                let server = objects.register(sink, Layer::TransportL4, &props);
                events.push(StackEvent::ObjectCreated { path: client });
                events.push(StackEvent::ObjectCreated { path: server });
                let ack = self.add_flow(FiveTuple {
                    source: tuple.destination,
                    source_port: tuple.destination_port,
                    destination: tuple.source,
                    destination_port: tuple.source_port,
                    ..tuple
                });
                (Some(client), Some(server), Some(ack))
            }
            TransportKind::Datagram => {
                let server = objects.register(sink, Layer::Application, &[Property::Rx]);
                events.push(StackEvent::ObjectCreated { path: server });
                (None, Some(server), None)
            }
        };

        let cwnd = self.config.initial_cwnd.saturating_mul(self.config.mss);
        self.conns.push(Connection {
            app: app_index,
            kind: app.transport(),
            source,
            sink,
            data_flow,
            ack_flow,
            client,
            server,
            cwnd,
            ssthresh: self.config.rwnd,
            in_flight: 0,
            srtt: None,
            last_rtt: None,
            last_backoff: None,
            received: 0,
            unacked_packets: 0,
            unacked_bytes: 0,
            advertised: self.config.rwnd,
            spin: false,
            spin_flipped: now,
        });
        self.by_app.insert(app_index, self.conns.len() - 1);
        tracing::debug!(
            app = app.name(),
            flow = %self.flows[data_flow].id,
            tuple = %tuple,
            "connection opened"
        );
    }

    // ─── Forwarding ─────────────────────────────────────────────────────

    /// Pushes `bytes` through every hop of `path` starting at `from`.
    fn transit(
        &mut self,
        topology: &Topology,
        path: &[LinkId],
        from: NodeId,
        bytes: u32,
        now: SimTime,
    ) -> Transit {
        let mut at = from;
        let mut delay = SimDuration::ZERO;
        for &id in path {
            let Ok(link) = topology.link(id) else {
                return Transit::Lost { phy: None };
            };
            let attrs = &link.attributes;
            let rate = attrs.data_rate_bps.max(1) as f64 / 8.0;
            let limit = attrs.queue_limit_bytes(attrs.delay) as f64;

            let queue = self.queues.entry((id, at)).or_insert(HopQueue {
                backlog: 0.0,
                updated: now,
                bad: false,
            });
            let drained = rate * (now - queue.updated).as_secs_f64().max(0.0);
            queue.backlog = (queue.backlog - drained).max(0.0);
            queue.updated = now;
            if queue.backlog + bytes as f64 > limit {
                return Transit::Lost { phy: None };
            }
            let wait = queue.backlog / rate;
            queue.backlog += bytes as f64;
            delay = delay + SimDuration::from_secs_f64(wait + bytes as f64 / rate) + attrs.delay;

            if let Some(model) = &attrs.loss {
                if sample_loss(&mut self.rng, model, &mut queue.bad) {
                    return Transit::Lost { phy: Some(id) };
                }
            }
            at = match link.peer_of(at) {
                Some(peer) => peer,
                None => return Transit::Lost { phy: None },
            };
        }
        Transit::Arrives(now + delay)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &mut self,
        topology: &Topology,
        path: Option<&[LinkId]>,
        from: NodeId,
        conn: usize,
        flow: usize,
        bytes: u32,
        payload: Payload,
        now: SimTime,
        events: &mut Vec<StackEvent>,
    ) {
        let counters = &mut self.flows[flow].counters;
        counters.tx_bytes += bytes as u64;
        counters.tx_packets += 1;

        let transit = match path {
            Some(path) => self.transit(topology, path, from, bytes, now),
            None => Transit::Lost { phy: None },
        };
        self.next_seq += 1;
        match transit {
            Transit::Arrives(arrive) => self.pending.push(Reverse(InFlight {
                arrive,
                seq: self.next_seq,
                conn,
                flow,
                bytes,
                sent_at: now,
                payload,
            })),
            Transit::Lost { phy } => {
                self.flows[flow].counters.lost_packets += 1;
                if let Some(link) = phy {
                    events.push(StackEvent::PhyDrop { link });
                }
                let notice = match payload {
                    Payload::Data => Some((bytes as u64, true)),
                    Payload::Ack { acked, .. } => Some((acked, false)),
                    Payload::Datagram | Payload::LossNotice { .. } => None,
                };
                if let Some((credit, backoff)) = notice {
                    let rtt = self.conns[conn].srtt.unwrap_or(INITIAL_RTT);
                    self.pending.push(Reverse(InFlight {
                        arrive: now + rtt,
                        seq: self.next_seq,
                        conn,
                        flow,
                        bytes: 0,
                        sent_at: now,
                        payload: Payload::LossNotice { credit, backoff },
                    }));
                }
            }
        }
    }

    // ─── Sending ────────────────────────────────────────────────────────

    fn pump_stream(
        &mut self,
        i: usize,
        env: &mut StackEnv<'_>,
        dt: SimDuration,
        events: &mut Vec<StackEvent>,
    ) {
        let (app, source, sink) = {
            let c = &self.conns[i];
            (c.app, c.source, c.sink)
        };
        let Some(path) = route(env.routing, env.topology, source, sink) else {
            return;
        };
        let offered = env.apps[app].offered_bytes(env.now, dt);
        let c = &self.conns[i];
        let window = c.cwnd.min(self.config.rwnd) as u64;
        let mut budget = offered.min(window.saturating_sub(c.in_flight));
        let data_flow = c.data_flow;
        let mss = self.config.mss as u64;

        let mut sent = 0u64;
        let mut packets = 0;
        while budget > 0 && packets < MAX_BURST_PACKETS {
            let size = budget.min(mss);
            // Window-limited: wait for a full segment.
            if size < mss && budget < offered {
                break;
            }
            self.emit(
                env.topology,
                Some(path.as_slice()),
                source,
                i,
                data_flow,
                size as u32,
                Payload::Data,
                env.now,
                events,
            );
            budget -= size;
            sent += size;
            packets += 1;
        }
        if sent > 0 {
            env.apps[app].on_sent(sent);
            self.conns[i].in_flight += sent;
        }
    }

    fn pump_datagrams(
        &mut self,
        i: usize,
        env: &mut StackEnv<'_>,
        dt: SimDuration,
        events: &mut Vec<StackEvent>,
    ) {
        let (app, source, sink, flow) = {
            let c = &self.conns[i];
            (c.app, c.source, c.sink, c.data_flow)
        };
        let offered = env.apps[app].offered_bytes(env.now, dt);
        if offered == 0 {
            return;
        }
        let size = env.apps[app].packet_size().max(1) as u64;
        let path = route(env.routing, env.topology, source, sink);
        let mut left = offered;
        while left > 0 {
            let bytes = left.min(size);
            self.emit(
                env.topology,
                path.as_deref(),
                source,
                i,
                flow,
                bytes as u32,
                Payload::Datagram,
                env.now,
                events,
            );
            left -= bytes;
        }
        env.apps[app].on_sent(offered);
    }

    // ─── Receiving ──────────────────────────────────────────────────────

    fn record_rx(&mut self, flow: usize, bytes: u32, delay: SimDuration) {
        let state = &mut self.flows[flow];
        let c = &mut state.counters;
        c.rx_bytes += bytes as u64;
        c.rx_packets += 1;
        c.delay_sum = c.delay_sum + delay;
        if let Some(prev) = state.last_delay {
            let diff = (delay.as_nanos() - prev.as_nanos()).abs();
            c.jitter_sum = c.jitter_sum + SimDuration::from_nanos(diff);
        }
        state.last_delay = Some(delay);
    }

    fn deliver(&mut self, packet: InFlight, env: &mut StackEnv<'_>, events: &mut Vec<StackEvent>) {
        let now = env.now;
        match packet.payload {
            Payload::Datagram => {
                self.record_rx(packet.flow, packet.bytes, packet.arrive - packet.sent_at);
                let c = &self.conns[packet.conn];
                env.apps[c.app].on_delivered(packet.bytes as u64);
                if let Some(server) = c.server {
                    events.push(StackEvent::Trace {
                        object: server,
                        event: TraceEvent::PacketReceived {
                            size: packet.bytes,
                            header: HeaderForm::Long,
                        },
                    });
                }
            }
            Payload::Data => self.on_data(packet, env, events),
            Payload::Ack { acked, echo } => {
                self.record_rx(packet.flow, packet.bytes, packet.arrive - packet.sent_at);
                let c = &self.conns[packet.conn];
                if let Some(client) = c.client {
                    events.push(StackEvent::Trace {
                        object: client,
                        event: TraceEvent::PacketReceived {
                            size: packet.bytes,
                            header: HeaderForm::Short { spin: c.spin },
                        },
                    });
                }
                self.on_ack(packet.conn, acked, packet.arrive - echo, events);
            }
            Payload::LossNotice { credit, backoff } => {
                let c = &mut self.conns[packet.conn];
                c.in_flight = c.in_flight.saturating_sub(credit);
                if backoff {
                    self.on_loss(packet.conn, now, events);
                }
            }
        }
    }

    fn on_data(&mut self, packet: InFlight, env: &mut StackEnv<'_>, events: &mut Vec<StackEvent>) {
        let now = env.now;
        self.record_rx(packet.flow, packet.bytes, packet.arrive - packet.sent_at);

        let rwnd = self.config.rwnd;
        let track_rwnd = self.config.receive_window;
        let ack_every = self.config.ack_every;
        let c = &mut self.conns[packet.conn];
        env.apps[c.app].on_delivered(packet.bytes as u64);

        c.received += 1;
        let header = if c.received <= LONG_HEADER_PACKETS {
            HeaderForm::Long
        } else {
            if now - c.spin_flipped >= c.srtt.unwrap_or(INITIAL_RTT) {
                c.spin = !c.spin;
                c.spin_flipped = now;
            }
            HeaderForm::Short { spin: c.spin }
        };
        if let Some(server) = c.server {
            events.push(StackEvent::Trace {
                object: server,
                event: TraceEvent::PacketReceived {
                    size: packet.bytes,
                    header,
                },
            });
        }

        c.unacked_packets += 1;
        c.unacked_bytes += packet.bytes as u64;
        let buffered = u32::try_from(c.unacked_bytes).unwrap_or(u32::MAX);
        let mut advertise = rwnd.saturating_sub(buffered);

        let ack = if c.unacked_packets >= ack_every {
            let acked = c.unacked_bytes;
            c.unacked_packets = 0;
            c.unacked_bytes = 0;
            advertise = rwnd;
            Some(acked)
        } else {
            None
        };

        if track_rwnd && advertise != c.advertised {
            if let Some(server) = c.server {
                events.push(StackEvent::Trace {
                    object: server,
                    event: TraceEvent::WindowChange {
                        window: WindowKind::Receive,
                        old: c.advertised,
                        new: advertise,
                    },
                });
            }
        }
        c.advertised = advertise;

        if let Some(acked) = ack {
            let (conn, sink, source, ack_flow) = (packet.conn, c.sink, c.source, c.ack_flow);
            if let Some(flow) = ack_flow {
                let path = route(env.routing, env.topology, sink, source);
                self.emit(
                    env.topology,
                    path.as_deref(),
                    sink,
                    conn,
                    flow,
                    ACK_BYTES,
                    Payload::Ack {
                        acked,
                        echo: packet.sent_at,
                    },
                    now,
                    events,
                );
            }
        }
    }

    fn on_ack(&mut self, i: usize, acked: u64, sample: SimDuration, events: &mut Vec<StackEvent>) {
        let mss = self.config.mss as u64;
        let cap = self.config.rwnd;
        let c = &mut self.conns[i];
        c.in_flight = c.in_flight.saturating_sub(acked);

        c.srtt = Some(match c.srtt {
            None => sample,
            Some(s) => s.mul_f64(0.875) + sample.mul_f64(0.125),
        });
        if c.last_rtt != Some(sample) {
            if let Some(client) = c.client {
                events.push(StackEvent::Trace {
                    object: client,
                    event: TraceEvent::RttChange {
                        old: c.last_rtt.unwrap_or(SimDuration::ZERO),
                        new: sample,
                    },
                });
            }
            c.last_rtt = Some(sample);
        }

        let old = c.cwnd;
        let grown = if c.cwnd < c.ssthresh {
            c.cwnd as u64 + acked
        } else {
            c.cwnd as u64 + (mss * acked / (c.cwnd as u64).max(1)).max(1)
        };
        c.cwnd = u32::try_from(grown).unwrap_or(u32::MAX).min(cap);
        push_cwnd_change(c, old, events);
    }

    fn on_loss(&mut self, i: usize, now: SimTime, events: &mut Vec<StackEvent>) {
        let factor = self.config.variant.backoff();
        let floor = 2 * self.config.mss;
        let c = &mut self.conns[i];
        let rtt = c.srtt.unwrap_or(INITIAL_RTT);
        if c.last_backoff.is_some_and(|t| now - t < rtt) {
            return;
        }
        let old = c.cwnd;
        c.ssthresh = ((c.cwnd as f64 * factor) as u32).max(floor);
        c.cwnd = c.ssthresh;
        c.last_backoff = Some(now);
        push_cwnd_change(c, old, events);
    }
}

fn push_cwnd_change(c: &Connection, old: u32, events: &mut Vec<StackEvent>) {
    if old == c.cwnd {
        return;
    }
    if let Some(client) = c.client {
        events.push(StackEvent::Trace {
            object: client,
            event: TraceEvent::WindowChange {
                window: WindowKind::Congestion,
                old,
                new: c.cwnd,
            },
        });
    }
}

impl TransportStack for FluidStack {
    fn tick(&self) -> SimDuration {
        self.config.tick
    }

    fn advance(&mut self, mut env: StackEnv<'_>, events: &mut Vec<StackEvent>) {
        let now = env.now;
        let dt = self.last_advance.map_or(self.config.tick, |t| now - t);
        self.last_advance = Some(now);

        for idx in 0..env.apps.len() {
            if self.by_app.contains_key(&idx) || !env.apps[idx].is_active(now) {
                continue;
            }
            let app = env.apps[idx].as_ref();
            self.open(idx, app, env.objects, events, now);
        }

        while self.pending.peek().is_some_and(|Reverse(p)| p.arrive <= now) {
            if let Some(Reverse(packet)) = self.pending.pop() {
                self.deliver(packet, &mut env, events);
            }
        }

        for i in 0..self.conns.len() {
            match self.conns[i].kind {
                TransportKind::Stream => self.pump_stream(i, &mut env, dt, events),
                TransportKind::Datagram => self.pump_datagrams(i, &mut env, dt, events),
            }
        }
    }

    fn flows(&self) -> Vec<FlowSnapshot> {
        self.flows
            .iter()
            .map(|f| FlowSnapshot {
                id: f.id,
                tuple: f.tuple,
                counters: f.counters,
            })
            .collect()
    }

    fn finalize(&mut self, now: SimTime) {
        let mut lost = 0;
        for Reverse(packet) in self.pending.drain() {
            if matches!(packet.payload, Payload::LossNotice { .. }) {
                continue;
            }
            self.flows[packet.flow].counters.lost_packets += 1;
            lost += 1;
        }
        tracing::debug!(%now, lost, "in-flight packets counted as lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{BulkSend, OnOffApp};
    use crate::routing::GlobalRouting;
    use netlab_core::collab::RoutingCollaborator;
    use netlab_core::topology::LinkAttributes;

    fn table(src: &str) -> toml::Table {
        toml::from_str(src).unwrap()
    }

    /// client -- server over one link.
    fn single_link(attrs: LinkAttributes) -> (Topology, GlobalRouting) {
        let mut topo = Topology::new();
        let c = topo.add_node("client").unwrap();
        let s = topo.add_node("server").unwrap();
        topo.add_link("path", c, s, attrs).unwrap();
        let mut routing = GlobalRouting::new();
        routing.recompute(&topo);
        (topo, routing)
    }

    fn drive(
        stack: &mut FluidStack,
        topo: &Topology,
        routing: &GlobalRouting,
        apps: &mut [Box<dyn TrafficGenerator>],
        objects: &mut ObjectRegistry,
        until_ms: u64,
    ) -> Vec<StackEvent> {
        let mut events = Vec::new();
        for ms in 1..=until_ms {
            stack.advance(
                StackEnv {
                    now: SimTime::from_millis(ms),
                    topology: topo,
                    routing,
                    apps: &mut *apps,
                    objects: &mut *objects,
                },
                &mut events,
            );
        }
        events
    }

    fn link(rate: u64, delay_ms: i64) -> LinkAttributes {
        LinkAttributes {
            data_rate_bps: rate,
            delay: SimDuration::from_millis(delay_ms),
            ..LinkAttributes::default()
        }
    }

    // ─── Configuration ──────────────────────────────────────────────────

    #[test]
    fn variant_names_are_lenient() {
        assert_eq!(Variant::parse("NewReno"), Some(Variant::NewReno));
        assert_eq!(Variant::parse("TcpCubic"), Some(Variant::Cubic));
        assert_eq!(Variant::parse("TcpBbr"), Some(Variant::Bbr));
        assert_eq!(Variant::parse("Vegas"), None);
    }

    #[test]
    fn empty_table_gives_defaults() {
        let cfg = FluidConfig::from_table(&toml::Table::new()).unwrap();
        assert_eq!(cfg, FluidConfig::default());
    }

    #[test]
    fn stack_table_overrides() {
        let cfg = FluidConfig::from_table(&table(
            r#"
            variant = "Cubic"
            tick = "5ms"
            spin_bit = false
            ack_every = 0
            "#,
        ))
        .unwrap();
        assert_eq!(cfg.variant, Variant::Cubic);
        assert_eq!(cfg.tick, SimDuration::from_millis(5));
        assert!(!cfg.spin_bit);
        assert_eq!(cfg.ack_every, 1);
    }

    #[test]
    fn unknown_variant_is_setup_error() {
        let err = FluidConfig::from_table(&table(r#"variant = "QuicVegas""#)).unwrap_err();
        assert_eq!(err, ConfigError::UnknownProtocol("QuicVegas".into()));
    }

    #[test]
    fn zero_tick_rejected() {
        let err = FluidConfig::from_table(&table(r#"tick = "0ms""#)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    // ─── Stream ─────────────────────────────────────────────────────────

    #[test]
    fn bulk_connection_creates_data_and_ack_flows() {
        let (topo, routing) = single_link(link(10_000_000, 10));
        let mut apps: Vec<Box<dyn TrafficGenerator>> =
            vec![Box::new(BulkSend::new("bulk", NodeId(0), NodeId(1), 9))];
        apps[0].start(SimTime::ZERO);
        let mut objects = ObjectRegistry::new();
        let mut stack = FluidStack::new(FluidConfig::default(), 1);

        let events = drive(&mut stack, &topo, &routing, &mut apps, &mut objects, 1_000);

        let created: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StackEvent::ObjectCreated { path } => Some(*path),
                _ => None,
            })
            .collect();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].node, NodeId(0));
        assert_eq!(created[1].node, NodeId(1));
        assert_eq!(objects.len(), 2);

        let flows = stack.flows();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].id, FlowId(1));
        assert_eq!(flows[0].tuple.source, Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(flows[0].tuple.source_port, 49153);
        assert_eq!(flows[0].tuple.destination_port, 9);
        assert_eq!(flows[1].tuple.source, Ipv4Addr::new(10, 1, 2, 1));
        assert!(flows[0].counters.rx_bytes > 0);
        assert!(flows[1].counters.rx_packets > 0);
        assert!(flows[0].counters.rx_packets <= flows[0].counters.tx_packets);
        assert_eq!(apps[0].total_rx(), flows[0].counters.rx_bytes);

        let client = created[0];
        assert!(events.iter().any(|e| matches!(
            e,
            StackEvent::Trace { object, event: TraceEvent::WindowChange { window: WindowKind::Congestion, .. } }
                if *object == client
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            StackEvent::Trace { object, event: TraceEvent::RttChange { .. } } if *object == client
        )));
    }

    #[test]
    fn first_packets_use_long_header() {
        let (topo, routing) = single_link(link(10_000_000, 5));
        let mut apps: Vec<Box<dyn TrafficGenerator>> =
            vec![Box::new(BulkSend::new("bulk", NodeId(0), NodeId(1), 9))];
        apps[0].start(SimTime::ZERO);
        let mut objects = ObjectRegistry::new();
        let mut stack = FluidStack::new(FluidConfig::default(), 1);
        let events = drive(&mut stack, &topo, &routing, &mut apps, &mut objects, 200);

        let server = ObjectPath {
            node: NodeId(1),
            layer: Layer::TransportL4,
            instance: 0,
        };
        let headers: Vec<HeaderForm> = events
            .iter()
            .filter_map(|e| match e {
                StackEvent::Trace {
                    object,
                    event: TraceEvent::PacketReceived { header, .. },
                } if *object == server => Some(*header),
                _ => None,
            })
            .collect();
        assert!(headers.len() > 2);
        assert_eq!(&headers[..2], &[HeaderForm::Long, HeaderForm::Long]);
        assert!(headers[2..].iter().all(|h| matches!(h, HeaderForm::Short { .. })));
    }

    #[test]
    fn lossy_link_reports_phy_drops_and_backs_off() {
        let attrs = LinkAttributes {
            loss: Some(LossModel::Rate { probability: 1.0 }),
            ..link(10_000_000, 10)
        };
        let (topo, routing) = single_link(attrs);
        let mut apps: Vec<Box<dyn TrafficGenerator>> =
            vec![Box::new(BulkSend::new("bulk", NodeId(0), NodeId(1), 9))];
        apps[0].start(SimTime::ZERO);
        let mut objects = ObjectRegistry::new();
        let mut stack = FluidStack::new(FluidConfig::default(), 7);
        let events = drive(&mut stack, &topo, &routing, &mut apps, &mut objects, 500);

        assert!(events.iter().any(|e| matches!(e, StackEvent::PhyDrop { .. })));
        let data = stack.flows()[0];
        assert_eq!(data.counters.rx_packets, 0);
        assert_eq!(data.counters.lost_packets, data.counters.tx_packets);
        assert!(events.iter().any(|e| matches!(
            e,
            StackEvent::Trace { event: TraceEvent::WindowChange { window: WindowKind::Congestion, old, new }, .. }
                if new < old
        )));
    }

    #[test]
    fn no_route_means_no_stream_traffic() {
        let (mut topo, _) = single_link(link(10_000_000, 10));
        topo.set_link_state(LinkId(0), false, SimTime::ZERO).unwrap();
        let mut routing = GlobalRouting::new();
        routing.recompute(&topo);
        let mut apps: Vec<Box<dyn TrafficGenerator>> =
            vec![Box::new(BulkSend::new("bulk", NodeId(0), NodeId(1), 9))];
        apps[0].start(SimTime::ZERO);
        let mut objects = ObjectRegistry::new();
        let mut stack = FluidStack::new(FluidConfig::default(), 1);
        drive(&mut stack, &topo, &routing, &mut apps, &mut objects, 50);
        assert_eq!(stack.flows()[0].counters.tx_packets, 0);
        assert_eq!(apps[0].total_tx(), 0);
    }

    // ─── Datagram ───────────────────────────────────────────────────────

    #[test]
    fn datagrams_account_every_packet() {
        let (topo, routing) = single_link(link(10_000_000, 20));
        let mut apps: Vec<Box<dyn TrafficGenerator>> = vec![Box::new(OnOffApp::new(
            "cbr",
            NodeId(0),
            NodeId(1),
            50_000,
            1_000_000,
            1000,
            SimDuration::from_secs(1),
            SimDuration::ZERO,
        ))];
        apps[0].start(SimTime::ZERO);
        let mut objects = ObjectRegistry::new();
        let mut stack = FluidStack::new(FluidConfig::default(), 1);
        drive(&mut stack, &topo, &routing, &mut apps, &mut objects, 1_000);

        let flows = stack.flows();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].counters.tx_packets, 125);
        assert!(flows[0].counters.rx_packets > 100);
        assert!(stack.in_flight() > 0);

        stack.finalize(SimTime::from_millis(1_000));
        let c = stack.flows()[0].counters;
        assert_eq!(c.rx_packets + c.lost_packets, c.tx_packets);
        assert_eq!(stack.in_flight(), 0);
        // Constant delay on an uncongested link: no jitter.
        assert_eq!(c.jitter_sum, SimDuration::ZERO);
        assert_eq!(objects.len(), 1);
    }
}
