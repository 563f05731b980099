//! # Flow Statistics
//!
//! Periodic sampling of cumulative per-flow counters into derived metrics,
//! the application throughput probe, and the final per-flow aggregate.
//!
//! Ratios with a zero denominator are never computed: the affected metric is
//! omitted for that tick (`None`), or marked [`LossRatio::Undefined`].

use crate::flow::{FiveTuple, FlowCounters, FlowFilter, FlowId, FlowSnapshot};
use crate::time::{SimDuration, SimTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

// ─── Loss Ratio ─────────────────────────────────────────────────────────────

/// Fraction of transmitted packets that were not received.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossRatio {
    Defined(f64),
    /// Nothing was transmitted yet.
    Undefined,
}

impl LossRatio {
    /// `(tx − rx) / tx`, saturating at zero when a snapshot shows more
    /// received than transmitted packets.
    pub fn from_packets(tx_packets: u64, rx_packets: u64) -> Self {
        if tx_packets == 0 {
            return LossRatio::Undefined;
        }
        let missing = tx_packets.saturating_sub(rx_packets);
        LossRatio::Defined(missing as f64 / tx_packets as f64)
    }

    pub fn value(self) -> Option<f64> {
        match self {
            LossRatio::Defined(v) => Some(v),
            LossRatio::Undefined => None,
        }
    }
}

// ─── Samples ────────────────────────────────────────────────────────────────

/// Derived metrics of one flow at one sampling tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStatsSample {
    pub flow_id: FlowId,
    pub time: SimTime,
    /// Bits per second received since the previous tick.
    pub interval_throughput_bps: f64,
    /// Bits per second received since experiment start.
    pub mean_throughput_bps: Option<f64>,
    /// Seconds.
    pub mean_delay: Option<f64>,
    /// Seconds.
    pub mean_jitter: Option<f64>,
    pub loss_ratio: LossRatio,
    /// A cumulative counter went backwards since the previous tick; the
    /// current counters were taken as a fresh baseline.
    pub counter_reset: bool,
}

impl FlowStatsSample {
    /// `(metric, value)` pairs for every defined metric, in row order.
    pub fn metrics(&self) -> Vec<(&'static str, f64)> {
        let mut out = vec![("throughput", self.interval_throughput_bps)];
        if let Some(v) = self.mean_throughput_bps {
            out.push(("mean-throughput", v));
        }
        if let Some(v) = self.mean_delay {
            out.push(("mean-delay", v));
        }
        if let Some(v) = self.mean_jitter {
            out.push(("mean-jitter", v));
        }
        if let Some(v) = self.loss_ratio.value() {
            out.push(("loss-ratio", v));
        }
        out
    }
}

/// Mean of a summed duration over `count` packets, `None` when `count == 0`.
fn per_packet(sum: SimDuration, count: u64) -> Option<f64> {
    if count == 0 {
        None
    } else {
        Some(sum.as_secs_f64() / count as f64)
    }
}

/// Bits per second over `elapsed`, `None` when `elapsed` is not positive.
fn bits_per_sec(bytes: u64, elapsed: SimDuration) -> Option<f64> {
    if elapsed.is_positive() {
        Some(bytes as f64 * 8.0 / elapsed.as_secs_f64())
    } else {
        None
    }
}

// ─── Flow Statistics Engine ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct FlowStatsEngine {
    start: SimTime,
    filter: FlowFilter,
    /// Counters at the previous tick, per flow.
    baselines: HashMap<FlowId, FlowCounters>,
    samples: BTreeMap<FlowId, Vec<FlowStatsSample>>,
    ticks: u64,
    last_tick: Option<SimTime>,
}

/// Any cumulative counter lower than at the previous tick.
fn went_backwards(now: &FlowCounters, before: &FlowCounters) -> bool {
    now.tx_bytes < before.tx_bytes
        || now.rx_bytes < before.rx_bytes
        || now.tx_packets < before.tx_packets
        || now.rx_packets < before.rx_packets
        || now.lost_packets < before.lost_packets
        || now.delay_sum < before.delay_sum
        || now.jitter_sum < before.jitter_sum
}

impl FlowStatsEngine {
    /// `start` is the instant cumulative means are measured from.
    pub fn new(start: SimTime, filter: FlowFilter) -> Self {
        FlowStatsEngine {
            start,
            filter,
            baselines: HashMap::new(),
            samples: BTreeMap::new(),
            ticks: 0,
            last_tick: None,
        }
    }

    pub fn filter(&self) -> &FlowFilter {
        &self.filter
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Time of the most recent [`sample`](Self::sample) call.
    pub fn last_tick(&self) -> Option<SimTime> {
        self.last_tick
    }

    /// Samples every non-excluded flow in `snapshot` at `now`. `interval` is
    /// the sampling period the interval throughput is averaged over.
    pub fn sample(
        &mut self,
        snapshot: &[FlowSnapshot],
        now: SimTime,
        interval: SimDuration,
    ) -> Vec<FlowStatsSample> {
        self.ticks += 1;
        self.last_tick = Some(now);
        if !interval.is_positive() {
            tracing::warn!(%interval, "non-positive sampling interval, interval throughput reported as 0");
        }

        let elapsed = now - self.start;
        let mut out = Vec::with_capacity(snapshot.len());

        for flow in snapshot {
            if self.filter.is_excluded(flow) {
                continue;
            }
            let c = &flow.counters;

            let baseline = self.baselines.insert(flow.id, *c).unwrap_or_default();
            let counter_reset = went_backwards(c, &baseline);
            if counter_reset {
                tracing::debug!(
                    flow = %flow.id,
                    rx_bytes = c.rx_bytes,
                    tx_packets = c.tx_packets,
                    "flow counters reset"
                );
            }
            let delta = if counter_reset {
                c.rx_bytes
            } else {
                c.rx_bytes - baseline.rx_bytes
            };

            let sample = FlowStatsSample {
                flow_id: flow.id,
                time: now,
                interval_throughput_bps: bits_per_sec(delta, interval).unwrap_or(0.0),
                mean_throughput_bps: bits_per_sec(c.rx_bytes, elapsed),
                mean_delay: per_packet(c.delay_sum, c.rx_packets),
                mean_jitter: per_packet(c.jitter_sum, c.rx_packets),
                loss_ratio: LossRatio::from_packets(c.tx_packets, c.rx_packets),
                counter_reset,
            };
            self.samples.entry(flow.id).or_default().push(sample.clone());
            out.push(sample);
        }

        out
    }

    pub fn samples(&self) -> &BTreeMap<FlowId, Vec<FlowStatsSample>> {
        &self.samples
    }

    pub fn into_samples(self) -> BTreeMap<FlowId, Vec<FlowStatsSample>> {
        self.samples
    }
}

// ─── Row Rendering ──────────────────────────────────────────────────────────

/// Sink name for one (flow, metric) pair.
pub fn flow_metric_sink_name(flow: FlowId, metric: &str, suffix: &str) -> String {
    format!("flow{flow}-{metric}{suffix}")
}

/// `time\tmetric\tvalue`
pub fn metric_row(time: SimTime, metric: &str, value: f64) -> String {
    format!("{time}\t{metric}\t{value}")
}

/// Human-readable block for one flow at one tick, appended to the netstats
/// log. Undefined metrics are left out.
pub fn render_netstats_block(flow: &FlowSnapshot, sample: &FlowStatsSample) -> String {
    NetstatsBlock { flow, sample }.to_string()
}

struct NetstatsBlock<'a> {
    flow: &'a FlowSnapshot,
    sample: &'a FlowStatsSample,
}

impl fmt::Display for NetstatsBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.flow.counters;
        let sample = self.sample;
        writeln!(f, "FlowID: {} ({})", self.flow.id, self.flow.tuple)?;
        writeln!(f, "  Tx Bytes: {}", c.tx_bytes)?;
        writeln!(f, "  Rx Bytes: {}", c.rx_bytes)?;
        writeln!(f, "  Tx Packets: {}", c.tx_packets)?;
        writeln!(f, "  Rx Packets: {}", c.rx_packets)?;
        writeln!(f, "  Lost Packets: {}", c.lost_packets)?;
        if let Some(v) = sample.loss_ratio.value() {
            writeln!(f, "  Pkt Lost Ratio: {v}")?;
        }
        writeln!(f, "  Throughput: {}", sample.interval_throughput_bps / 1_000_000.0)?;
        if let Some(v) = sample.mean_throughput_bps {
            writeln!(f, "  Mean{{Throughput}}: {}", v / 1_000_000.0)?;
        }
        if let Some(v) = sample.mean_delay {
            writeln!(f, "  Mean{{Delay}}: {v}")?;
        }
        if let Some(v) = sample.mean_jitter {
            writeln!(f, "  Mean{{Jitter}}: {v}")?;
        }
        Ok(())
    }
}

// ─── Application Throughput Probe ───────────────────────────────────────────

/// Tracks a traffic generator's cumulative received bytes and reports the
/// rate since the previous probe in kbit/s (1 kbit = 1024 bit).
#[derive(Debug, Clone, Default)]
pub struct AppThroughputProbe {
    last_total: Option<u64>,
}

impl AppThroughputProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` for a non-positive interval. A counter that went
    /// backwards is treated as restarted from zero.
    pub fn sample(&mut self, total_rx: u64, interval: SimDuration) -> Option<f64> {
        let previous = self.last_total.replace(total_rx).unwrap_or(0);
        if !interval.is_positive() {
            return None;
        }
        let delta = if total_rx < previous {
            total_rx
        } else {
            total_rx - previous
        };
        Some(delta as f64 * 8.0 / interval.as_secs_f64() / 1024.0)
    }
}

// ─── Final Aggregate ────────────────────────────────────────────────────────

/// Per-flow totals enumerated at teardown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowReport {
    pub flow_id: FlowId,
    pub tuple: FiveTuple,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub lost_packets: u64,
    pub loss_ratio: LossRatio,
    /// Bits per second over the whole experiment.
    pub mean_throughput_bps: Option<f64>,
    pub mean_delay: Option<f64>,
    pub mean_jitter: Option<f64>,
}

impl FlowReport {
    pub fn from_snapshot(flow: &FlowSnapshot, elapsed: SimDuration) -> Self {
        let c = &flow.counters;
        FlowReport {
            flow_id: flow.id,
            tuple: flow.tuple,
            tx_bytes: c.tx_bytes,
            rx_bytes: c.rx_bytes,
            tx_packets: c.tx_packets,
            rx_packets: c.rx_packets,
            lost_packets: c.lost_packets,
            loss_ratio: LossRatio::from_packets(c.tx_packets, c.rx_packets),
            mean_throughput_bps: bits_per_sec(c.rx_bytes, elapsed),
            mean_delay: per_packet(c.delay_sum, c.rx_packets),
            mean_jitter: per_packet(c.jitter_sum, c.rx_packets),
        }
    }

    /// Final reports for every flow the filter keeps, in flow id order.
    pub fn collect(snapshot: &[FlowSnapshot], filter: &FlowFilter, elapsed: SimDuration) -> Vec<Self> {
        let mut reports: Vec<_> = snapshot
            .iter()
            .filter(|f| !filter.is_excluded(f))
            .map(|f| FlowReport::from_snapshot(f, elapsed))
            .collect();
        reports.sort_by_key(|r| r.flow_id);
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowCounters, Protocol};
    use std::net::Ipv4Addr;

    fn snapshot(id: u32, counters: FlowCounters) -> FlowSnapshot {
        FlowSnapshot {
            id: FlowId(id),
            tuple: FiveTuple {
                protocol: Protocol::Udp,
                source: Ipv4Addr::new(10, 1, 1, 1),
                source_port: 49153,
                destination: Ipv4Addr::new(10, 1, 2, 2),
                destination_port: 50000,
            },
            counters,
        }
    }

    fn half_second() -> SimDuration {
        SimDuration::from_millis(500)
    }

    // ─── Throughput ─────────────────────────────────────────────────────

    #[test]
    fn interval_throughput_and_loss_from_counters() {
        let mut engine = FlowStatsEngine::new(SimTime::ZERO, FlowFilter::new());
        let first = FlowCounters {
            tx_packets: 50,
            rx_packets: 45,
            rx_bytes: 40_000,
            ..Default::default()
        };
        engine.sample(&[snapshot(1, first)], SimTime::from_millis(1000), half_second());

        let second = FlowCounters {
            tx_packets: 100,
            rx_packets: 90,
            rx_bytes: 90_000,
            ..Default::default()
        };
        let out = engine.sample(&[snapshot(1, second)], SimTime::from_millis(1500), half_second());

        assert_eq!(out.len(), 1);
        assert!((out[0].interval_throughput_bps - 800_000.0).abs() < 1e-6);
        assert_eq!(out[0].loss_ratio, LossRatio::Defined(0.10));
        assert!(!out[0].counter_reset);
    }

    #[test]
    fn first_sample_uses_zero_baseline() {
        let mut engine = FlowStatsEngine::new(SimTime::ZERO, FlowFilter::new());
        let counters = FlowCounters {
            rx_bytes: 50_000,
            ..Default::default()
        };
        let out = engine.sample(&[snapshot(1, counters)], SimTime::from_millis(500), half_second());
        assert!((out[0].interval_throughput_bps - 800_000.0).abs() < 1e-6);
    }

    #[test]
    fn counter_reset_is_new_baseline_not_negative() {
        let mut engine = FlowStatsEngine::new(SimTime::ZERO, FlowFilter::new());
        let big = FlowCounters {
            rx_bytes: 1_000_000,
            ..Default::default()
        };
        engine.sample(&[snapshot(1, big)], SimTime::from_millis(500), half_second());

        let reset = FlowCounters {
            rx_bytes: 10_000,
            ..Default::default()
        };
        let out = engine.sample(&[snapshot(1, reset)], SimTime::from_millis(1000), half_second());
        assert!(out[0].counter_reset);
        assert!(out[0].interval_throughput_bps >= 0.0);
        assert!((out[0].interval_throughput_bps - 160_000.0).abs() < 1e-6);
    }

    #[test]
    fn packet_counter_reset_is_detected_while_bytes_grow() {
        let mut engine = FlowStatsEngine::new(SimTime::ZERO, FlowFilter::new());
        let before = FlowCounters {
            rx_bytes: 100_000,
            tx_packets: 200,
            rx_packets: 150,
            lost_packets: 50,
            ..Default::default()
        };
        engine.sample(&[snapshot(1, before)], SimTime::from_millis(500), half_second());

        let after = FlowCounters {
            rx_bytes: 150_000,
            tx_packets: 20,
            rx_packets: 15,
            lost_packets: 5,
            ..Default::default()
        };
        let out = engine.sample(&[snapshot(1, after)], SimTime::from_millis(1000), half_second());
        assert!(out[0].counter_reset);
        // Everything since the reset counts towards this interval.
        assert!((out[0].interval_throughput_bps - 2_400_000.0).abs() < 1e-6);
        assert_eq!(engine.last_tick(), Some(SimTime::from_millis(1000)));
    }

    #[test]
    fn zero_elapsed_skips_mean_throughput() {
        let mut engine = FlowStatsEngine::new(SimTime::ZERO, FlowFilter::new());
        let counters = FlowCounters {
            rx_bytes: 1_000,
            tx_packets: 1,
            rx_packets: 1,
            ..Default::default()
        };
        let out = engine.sample(&[snapshot(1, counters)], SimTime::ZERO, half_second());
        assert_eq!(out[0].mean_throughput_bps, None);
        assert!(out[0].metrics().iter().all(|(m, _)| *m != "mean-throughput"));
    }

    #[test]
    fn mean_throughput_since_start() {
        let mut engine = FlowStatsEngine::new(SimTime::from_millis(1000), FlowFilter::new());
        let counters = FlowCounters {
            rx_bytes: 125_000,
            ..Default::default()
        };
        let out = engine.sample(&[snapshot(1, counters)], SimTime::from_millis(2000), half_second());
        assert_eq!(out[0].mean_throughput_bps, Some(1_000_000.0));
    }

    // ─── Zero Denominators ──────────────────────────────────────────────

    #[test]
    fn no_tx_packets_gives_undefined_loss() {
        let mut engine = FlowStatsEngine::new(SimTime::ZERO, FlowFilter::new());
        let out = engine.sample(
            &[snapshot(1, FlowCounters::default())],
            SimTime::from_millis(100),
            half_second(),
        );
        assert_eq!(out[0].loss_ratio, LossRatio::Undefined);
        assert_eq!(out[0].mean_delay, None);
        assert_eq!(out[0].mean_jitter, None);
        assert!(out[0].metrics().iter().all(|(_, v)| v.is_finite()));
    }

    #[test]
    fn more_rx_than_tx_does_not_go_negative() {
        assert_eq!(LossRatio::from_packets(10, 12), LossRatio::Defined(0.0));
    }

    #[test]
    fn mean_delay_and_jitter_per_packet() {
        let mut engine = FlowStatsEngine::new(SimTime::ZERO, FlowFilter::new());
        let counters = FlowCounters {
            tx_packets: 4,
            rx_packets: 4,
            delay_sum: SimDuration::from_millis(200),
            jitter_sum: SimDuration::from_millis(8),
            ..Default::default()
        };
        let out = engine.sample(&[snapshot(1, counters)], SimTime::from_millis(100), half_second());
        assert!((out[0].mean_delay.unwrap() - 0.05).abs() < 1e-12);
        assert!((out[0].mean_jitter.unwrap() - 0.002).abs() < 1e-12);
    }

    // ─── Exclusion and Retention ────────────────────────────────────────

    #[test]
    fn excluded_flows_are_skipped_entirely() {
        let filter = FlowFilter::new().exclude_flow(FlowId(2));
        let mut engine = FlowStatsEngine::new(SimTime::ZERO, filter);
        let flows = [
            snapshot(1, FlowCounters::default()),
            snapshot(2, FlowCounters::default()),
        ];
        let out = engine.sample(&flows, SimTime::from_millis(100), half_second());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].flow_id, FlowId(1));
        assert!(!engine.samples().contains_key(&FlowId(2)));
    }

    #[test]
    fn samples_accumulate_per_flow() {
        let mut engine = FlowStatsEngine::new(SimTime::ZERO, FlowFilter::new());
        for i in 1..=3 {
            engine.sample(
                &[snapshot(1, FlowCounters::default())],
                SimTime::from_millis(100 * i),
                SimDuration::from_millis(100),
            );
        }
        assert_eq!(engine.ticks(), 3);
        assert_eq!(engine.samples()[&FlowId(1)].len(), 3);
    }

    // ─── Rendering ──────────────────────────────────────────────────────

    #[test]
    fn netstats_block_omits_undefined_metrics() {
        let flow = snapshot(1, FlowCounters::default());
        let sample = FlowStatsSample {
            flow_id: FlowId(1),
            time: SimTime::from_millis(100),
            interval_throughput_bps: 0.0,
            mean_throughput_bps: None,
            mean_delay: None,
            mean_jitter: None,
            loss_ratio: LossRatio::Undefined,
            counter_reset: false,
        };
        let block = render_netstats_block(&flow, &sample);
        assert!(block.starts_with("FlowID: 1 (UDP 10.1.1.1 / 49153 --> 10.1.2.2 / 50000)"));
        assert!(!block.contains("Lost Ratio"));
        assert!(!block.contains("NaN"));
    }

    #[test]
    fn metric_row_format() {
        assert_eq!(
            metric_row(SimTime::from_millis(1500), "throughput", 800000.0),
            "1.5\tthroughput\t800000"
        );
        assert_eq!(
            flow_metric_sink_name(FlowId(3), "loss-ratio", ".txt"),
            "flow3-loss-ratio.txt"
        );
    }

    // ─── Probe and Report ───────────────────────────────────────────────

    #[test]
    fn app_throughput_reports_kbps_between_samples() {
        let mut probe = AppThroughputProbe::new();
        let interval = SimDuration::from_millis(100);
        let kbps = probe.sample(12_800, interval).unwrap();
        assert!((kbps - 1000.0).abs() < 1e-6, "got {kbps}");
        assert_eq!(probe.sample(12_800, interval), Some(0.0));
        assert_eq!(probe.sample(0, SimDuration::ZERO), None);
    }

    #[test]
    fn report_collects_kept_flows_sorted() {
        let filter = FlowFilter::new().exclude_source(Ipv4Addr::new(10, 1, 1, 2));
        let mut other = snapshot(2, FlowCounters::default());
        other.tuple.source = Ipv4Addr::new(10, 1, 1, 2);
        let flows = [
            snapshot(
                3,
                FlowCounters {
                    tx_packets: 10,
                    rx_packets: 10,
                    rx_bytes: 1000,
                    ..Default::default()
                },
            ),
            other,
            snapshot(1, FlowCounters::default()),
        ];
        let reports = FlowReport::collect(&flows, &filter, SimDuration::from_secs(1));
        let ids: Vec<_> = reports.iter().map(|r| r.flow_id.0).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(reports[1].mean_throughput_bps, Some(8000.0));
        assert_eq!(reports[0].loss_ratio, LossRatio::Undefined);
    }
}
