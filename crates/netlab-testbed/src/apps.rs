//! Traffic generators: a bulk sender over a stream transport and an on/off
//! constant-bit-rate source over datagrams, each paired with a packet sink
//! that counts what the far end received.

use netlab_core::collab::{TrafficGenerator, TransportKind};
use netlab_core::config::{AppKind, AppSpec, ExperimentConfig};
use netlab_core::error::ConfigError;
use netlab_core::topology::NodeId;
use netlab_core::{SimDuration, SimTime};

/// Offered load of an unlimited bulk sender per call. The stack clamps it
/// to what the congestion window allows.
const UNLIMITED_OFFER: u64 = 1 << 40;

// ─── Sink ───────────────────────────────────────────────────────────────────

/// Receive-side byte and packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketSink {
    bytes: u64,
    packets: u64,
}

impl PacketSink {
    pub fn record(&mut self, bytes: u64, packets: u64) {
        self.bytes += bytes;
        self.packets += packets;
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn total_packets(&self) -> u64 {
        self.packets
    }
}

// ─── Lifetime ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Lifetime {
    started: Option<SimTime>,
    stopped: Option<SimTime>,
}

impl Lifetime {
    fn is_active(&self, now: SimTime) -> bool {
        self.started.is_some_and(|s| s <= now) && self.stopped.is_none_or(|s| now < s)
    }
}

// ─── Bulk Send ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BulkSend {
    name: String,
    source: NodeId,
    sink: NodeId,
    port: u16,
    send_size: u32,
    /// 0 means unlimited.
    max_bytes: u64,
    life: Lifetime,
    tx: u64,
    rx: PacketSink,
}

impl BulkSend {
    pub fn new(name: impl Into<String>, source: NodeId, sink: NodeId, port: u16) -> Self {
        Self {
            name: name.into(),
            source,
            sink,
            port,
            send_size: 1400,
            max_bytes: 0,
            life: Lifetime::default(),
            tx: 0,
            rx: PacketSink::default(),
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_send_size(mut self, send_size: u32) -> Self {
        self.send_size = send_size.max(1);
        self
    }

    pub fn is_finished(&self) -> bool {
        self.max_bytes != 0 && self.tx >= self.max_bytes
    }
}

impl TrafficGenerator for BulkSend {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> NodeId {
        self.source
    }

    fn sink(&self) -> NodeId {
        self.sink
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn packet_size(&self) -> u32 {
        self.send_size
    }

    fn start(&mut self, now: SimTime) {
        self.life.started = Some(now);
        tracing::debug!(app = %self.name, %now, "bulk send started");
    }

    fn stop(&mut self, now: SimTime) {
        self.life.stopped = Some(now);
        tracing::debug!(app = %self.name, %now, tx = self.tx, "bulk send stopped");
    }

    fn is_active(&self, now: SimTime) -> bool {
        self.life.is_active(now)
    }

    fn offered_bytes(&mut self, now: SimTime, _dt: SimDuration) -> u64 {
        if !self.is_active(now) {
            return 0;
        }
        if self.max_bytes == 0 {
            UNLIMITED_OFFER
        } else {
            self.max_bytes.saturating_sub(self.tx)
        }
    }

    fn on_sent(&mut self, bytes: u64) {
        self.tx += bytes;
    }

    fn on_delivered(&mut self, bytes: u64) {
        self.rx.record(bytes, bytes.div_ceil(self.send_size as u64));
    }

    fn total_tx(&self) -> u64 {
        self.tx
    }

    fn total_rx(&self) -> u64 {
        self.rx.total_bytes()
    }
}

// ─── On/Off ─────────────────────────────────────────────────────────────────

/// Constant bit rate during on periods, nothing during off periods. The
/// cycle starts with an on period at the start time. Only whole packets are
/// emitted; the remainder carries over to the next call.
#[derive(Debug)]
pub struct OnOffApp {
    name: String,
    source: NodeId,
    sink: NodeId,
    port: u16,
    rate_bps: u64,
    packet_size: u32,
    on: SimDuration,
    off: SimDuration,
    life: Lifetime,
    /// Accumulated bit-nanoseconds not yet emitted as a packet.
    carry: u128,
    tx: u64,
    rx: PacketSink,
}

impl OnOffApp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        source: NodeId,
        sink: NodeId,
        port: u16,
        rate_bps: u64,
        packet_size: u32,
        on: SimDuration,
        off: SimDuration,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            sink,
            port,
            rate_bps,
            packet_size: packet_size.max(1),
            on,
            off,
            life: Lifetime::default(),
            carry: 0,
            tx: 0,
            rx: PacketSink::default(),
        }
    }

    /// Whether `now` falls in an on period.
    pub fn is_on(&self, now: SimTime) -> bool {
        let Some(start) = self.life.started else {
            return false;
        };
        if !self.off.is_positive() {
            return true;
        }
        let cycle = (self.on + self.off).as_nanos();
        let phase = (now - start).as_nanos().rem_euclid(cycle.max(1));
        phase < self.on.as_nanos()
    }

    pub fn received_packets(&self) -> u64 {
        self.rx.total_packets()
    }
}

impl TrafficGenerator for OnOffApp {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> NodeId {
        self.source
    }

    fn sink(&self) -> NodeId {
        self.sink
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn packet_size(&self) -> u32 {
        self.packet_size
    }

    fn start(&mut self, now: SimTime) {
        self.life.started = Some(now);
        self.carry = 0;
    }

    fn stop(&mut self, now: SimTime) {
        self.life.stopped = Some(now);
    }

    fn is_active(&self, now: SimTime) -> bool {
        self.life.is_active(now)
    }

    fn offered_bytes(&mut self, now: SimTime, dt: SimDuration) -> u64 {
        if !self.is_active(now) || !self.is_on(now) || !dt.is_positive() {
            return 0;
        }
        self.carry += self.rate_bps as u128 * dt.as_nanos() as u128;
        let per_packet = self.packet_size as u128 * 8 * 1_000_000_000;
        let packets = self.carry / per_packet;
        self.carry %= per_packet;
        packets as u64 * self.packet_size as u64
    }

    fn on_sent(&mut self, bytes: u64) {
        self.tx += bytes;
    }

    fn on_delivered(&mut self, bytes: u64) {
        self.rx.record(bytes, bytes / self.packet_size as u64);
    }

    fn total_tx(&self) -> u64 {
        self.tx
    }

    fn total_rx(&self) -> u64 {
        self.rx.total_bytes()
    }
}

// ─── Construction ───────────────────────────────────────────────────────────

fn node_index(config: &ExperimentConfig, name: &str) -> Result<NodeId, ConfigError> {
    config
        .nodes
        .iter()
        .position(|n| n == name)
        .map(|i| NodeId(i as u32))
        .ok_or_else(|| ConfigError::UnknownNode(name.to_string()))
}

pub fn build_app(config: &ExperimentConfig, spec: &AppSpec) -> Result<Box<dyn TrafficGenerator>, ConfigError> {
    let source = node_index(config, &spec.source)?;
    let sink = node_index(config, &spec.sink)?;
    Ok(match spec.kind {
        AppKind::Bulk {
            max_bytes,
            send_size,
        } => Box::new(
            BulkSend::new(&spec.name, source, sink, spec.port)
                .with_max_bytes(max_bytes)
                .with_send_size(send_size),
        ),
        AppKind::OnOff {
            rate_bps,
            packet_size,
            on,
            off,
        } => Box::new(OnOffApp::new(
            &spec.name,
            source,
            sink,
            spec.port,
            rate_bps,
            packet_size,
            on,
            off,
        )),
    })
}

/// One generator per configured application, in configuration order.
pub fn build_apps(config: &ExperimentConfig) -> Result<Vec<Box<dyn TrafficGenerator>>, ConfigError> {
    config.apps.iter().map(|spec| build_app(config, spec)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: SimDuration = SimDuration::from_millis(1);

    #[test]
    fn bulk_offers_remaining_bytes_while_active() {
        let mut app = BulkSend::new("bulk", NodeId(0), NodeId(3), 9).with_max_bytes(10_000);
        assert_eq!(app.offered_bytes(SimTime::ZERO, MS), 0);

        app.start(SimTime::from_millis(5));
        assert_eq!(app.offered_bytes(SimTime::from_millis(4), MS), 0);
        assert_eq!(app.offered_bytes(SimTime::from_millis(5), MS), 10_000);

        app.on_sent(4_000);
        assert_eq!(app.offered_bytes(SimTime::from_millis(6), MS), 6_000);
        app.on_sent(6_000);
        assert!(app.is_finished());
        assert_eq!(app.offered_bytes(SimTime::from_millis(7), MS), 0);
    }

    #[test]
    fn bulk_stops_offering_after_stop() {
        let mut app = BulkSend::new("bulk", NodeId(0), NodeId(1), 9);
        app.start(SimTime::ZERO);
        assert_eq!(app.offered_bytes(SimTime::from_millis(1), MS), UNLIMITED_OFFER);
        app.stop(SimTime::from_millis(10));
        assert!(app.is_active(SimTime::from_millis(9)));
        assert!(!app.is_active(SimTime::from_millis(10)));
        assert_eq!(app.offered_bytes(SimTime::from_millis(10), MS), 0);
    }

    #[test]
    fn onoff_emits_whole_packets_at_rate() {
        // 1 Mbit/s of 1000-byte packets: 125 packets per second.
        let mut app = OnOffApp::new(
            "cbr",
            NodeId(0),
            NodeId(1),
            50_000,
            1_000_000,
            1000,
            SimDuration::from_secs(1),
            SimDuration::ZERO,
        );
        app.start(SimTime::ZERO);
        let mut total = 0;
        for i in 1..=1000 {
            let bytes = app.offered_bytes(SimTime::from_millis(i), MS);
            assert_eq!(bytes % 1000, 0);
            total += bytes;
        }
        assert_eq!(total, 125_000);
    }

    #[test]
    fn onoff_is_silent_during_off_periods() {
        let mut app = OnOffApp::new(
            "cbr",
            NodeId(0),
            NodeId(1),
            50_000,
            8_000_000,
            1000,
            SimDuration::from_millis(100),
            SimDuration::from_millis(100),
        );
        app.start(SimTime::from_secs_f64(1.0));
        assert!(app.is_on(SimTime::from_millis(1_050)));
        assert!(!app.is_on(SimTime::from_millis(1_150)));
        assert!(app.is_on(SimTime::from_millis(1_200)));
        assert_eq!(app.offered_bytes(SimTime::from_millis(1_150), MS), 0);
        assert_eq!(app.offered_bytes(SimTime::from_millis(1_210), MS), 1000);
    }

    #[test]
    fn sink_counts_delivered_bytes() {
        let mut app = BulkSend::new("bulk", NodeId(0), NodeId(1), 9).with_send_size(500);
        app.on_delivered(1200);
        assert_eq!(app.total_rx(), 1200);
        assert_eq!(app.rx.total_packets(), 3);
    }
}
