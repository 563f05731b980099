//! # Experiment Report
//!
//! Everything an experiment produced besides its sink files: final per-flow
//! totals, the retained statistics samples, the link-state timeline, the
//! trace summary and the per-application byte counts.

use crate::flow::FlowId;
use crate::stats::{FlowReport, FlowStatsSample};
use crate::topology::LinkStateChange;
use crate::trace::TraceSummary;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct FlowSeries {
    pub flow_id: FlowId,
    pub samples: Vec<FlowStatsSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppReport {
    pub name: String,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// One application throughput probe row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbePoint {
    /// Seconds.
    pub time: f64,
    pub kbps: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeSeries {
    pub app: String,
    pub points: Vec<ProbePoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub name: String,
    pub run: u32,
    pub seed: u64,
    /// Simulated seconds covered by the run.
    pub elapsed_s: f64,
    pub events_dispatched: u64,
    pub flows: Vec<FlowReport>,
    pub samples: Vec<FlowSeries>,
    pub link_changes: Vec<LinkStateChange>,
    pub traces: TraceSummary,
    pub apps: Vec<AppReport>,
    pub probes: Vec<ProbeSeries>,
    /// Sinks written during the run, in lexical order.
    pub sinks: Vec<String>,
}

impl ExperimentReport {
    pub fn flow(&self, id: FlowId) -> Option<&FlowReport> {
        self.flows.iter().find(|f| f.flow_id == id)
    }

    pub fn samples_for(&self, id: FlowId) -> &[FlowStatsSample] {
        self.samples
            .iter()
            .find(|s| s.flow_id == id)
            .map_or(&[], |s| s.samples.as_slice())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text per-flow summary, the [`Display`](fmt::Display) form.
    pub fn render_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ExperimentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Experiment {} (run {}, seed {})", self.name, self.run, self.seed)?;
        writeln!(
            f,
            "  {} events over {}s, {} link changes, {} PHY drops",
            self.events_dispatched,
            self.elapsed_s,
            self.link_changes.len(),
            self.traces.phy_drops
        )?;

        for flow in &self.flows {
            writeln!(
                f,
                "Flow {} ({} -> {})",
                flow.flow_id, flow.tuple.source, flow.tuple.destination
            )?;
            writeln!(f, "  Tx Packets: {}", flow.tx_packets)?;
            writeln!(f, "  Tx Bytes:   {}", flow.tx_bytes)?;
            if self.elapsed_s > 0.0 {
                writeln!(
                    f,
                    "  TxOffered:  {:.6} Mbps",
                    flow.tx_bytes as f64 * 8.0 / self.elapsed_s / 1_000_000.0
                )?;
            }
            writeln!(f, "  Rx Packets: {}", flow.rx_packets)?;
            writeln!(f, "  Rx Bytes:   {}", flow.rx_bytes)?;
            if let Some(bps) = flow.mean_throughput_bps {
                writeln!(f, "  Throughput: {:.6} Mbps", bps / 1_000_000.0)?;
            }
            writeln!(f, "  Lost Packets: {}", flow.lost_packets)?;
            match flow.loss_ratio.value() {
                Some(v) => writeln!(f, "  Loss Ratio: {v:.4}")?,
                None => writeln!(f, "  Loss Ratio: n/a")?,
            }
            if let Some(d) = flow.mean_delay {
                writeln!(f, "  Mean Delay: {d:.6} s")?;
            }
            if let Some(j) = flow.mean_jitter {
                writeln!(f, "  Mean Jitter: {j:.6} s")?;
            }
        }

        for app in &self.apps {
            writeln!(f, "App {}: tx {} bytes, rx {} bytes", app.name, app.tx_bytes, app.rx_bytes)?;
        }
        if !self.traces.unmatched_patterns.is_empty() {
            writeln!(
                f,
                "Unmatched trace patterns: {}",
                self.traces.unmatched_patterns.join(", ")
            )?;
        }
        Ok(())
    }
}
