//! State shared by every scheduled callback of one experiment.
//!
//! The context owns the topology, the collaborators and all measurement
//! state. Callbacks get `&mut ExperimentContext`, so nothing needs locks or
//! interior mutability.

use crate::collab::{RoutingCollaborator, StackEnv, StackEvent, TrafficGenerator, TransportStack};
use crate::error::{NetlabError, SinkError, TopologyError};
use crate::flow::FlowSnapshot;
use crate::report::ProbeSeries;
use crate::sink::SinkRegistry;
use crate::stats::{flow_metric_sink_name, metric_row, render_netstats_block, FlowStatsEngine};
use crate::time::{SimDuration, SimTime};
use crate::topology::{LinkId, LinkStateChange, LinkStateHistory, NodeId, Topology};
use crate::trace::{ObjectRegistry, TraceMux};

pub struct ExperimentContext {
    pub topology: Topology,
    pub routing: Box<dyn RoutingCollaborator>,
    pub stack: Box<dyn TransportStack>,
    pub apps: Vec<Box<dyn TrafficGenerator>>,
    pub objects: ObjectRegistry,
    pub traces: TraceMux,
    pub stats: FlowStatsEngine,
    pub sinks: SinkRegistry,
    pub history: LinkStateHistory,
    /// Appended to flow metric sink names.
    pub suffix: String,
    /// Netstats log sink, if enabled.
    pub netstats_sink: Option<String>,
    /// Application throughput probe output, one series per probe.
    pub probes: Vec<ProbeSeries>,
    events: Vec<StackEvent>,
    fatal: Option<NetlabError>,
}

impl ExperimentContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topology: Topology,
        routing: Box<dyn RoutingCollaborator>,
        stack: Box<dyn TransportStack>,
        apps: Vec<Box<dyn TrafficGenerator>>,
        traces: TraceMux,
        stats: FlowStatsEngine,
        sinks: SinkRegistry,
        suffix: String,
    ) -> Self {
        let history = LinkStateHistory::new(&topology);
        ExperimentContext {
            topology,
            routing,
            stack,
            apps,
            objects: ObjectRegistry::new(),
            traces,
            stats,
            sinks,
            history,
            suffix,
            netstats_sink: None,
            probes: Vec::new(),
            events: Vec::new(),
            fatal: None,
        }
    }

    // ─── Link State ─────────────────────────────────────────────────────

    /// Applies a link-state change, recomputes routes before returning, and
    /// records the change in the history.
    pub fn set_link_state(
        &mut self,
        link: LinkId,
        up: bool,
        now: SimTime,
    ) -> Result<LinkStateChange, TopologyError> {
        let change = self.topology.set_link_state(link, up, now)?;
        self.after_change(change);
        Ok(change)
    }

    pub fn set_interface_state(
        &mut self,
        node: NodeId,
        index: u32,
        up: bool,
        now: SimTime,
    ) -> Result<LinkStateChange, TopologyError> {
        let change = self.topology.set_interface_state(node, index, up, now)?;
        self.after_change(change);
        Ok(change)
    }

    fn after_change(&mut self, change: LinkStateChange) {
        if change.changed() {
            tracing::info!(
                link = %change.link,
                up = change.up,
                t = %change.at,
                "link state changed"
            );
        } else {
            tracing::debug!(link = %change.link, up = change.up, "link state unchanged");
        }
        self.routing.recompute(&self.topology);
        self.history.record(change);
    }

    // ─── Stack ──────────────────────────────────────────────────────────

    /// Advances the transport stack to `now` and routes what it emitted.
    pub fn advance_stack(&mut self, now: SimTime) -> Result<(), SinkError> {
        let mut events = std::mem::take(&mut self.events);
        self.stack.advance(
            StackEnv {
                now,
                topology: &self.topology,
                routing: self.routing.as_ref(),
                apps: &mut self.apps,
                objects: &mut self.objects,
            },
            &mut events,
        );

        let mut result = Ok(());
        for event in events.drain(..) {
            let step = match event {
                StackEvent::ObjectCreated { path } => {
                    tracing::debug!(%path, "protocol object created");
                    Ok(())
                }
                StackEvent::Trace { object, event } => self
                    .traces
                    .dispatch(now, object, &event, &mut self.sinks)
                    .map(|_| ()),
                StackEvent::PhyDrop { link } => self.traces.record_drop(now, link, &mut self.sinks),
            };
            if let Err(e) = step {
                result = Err(e);
                break;
            }
        }
        events.clear();
        self.events = events;
        result
    }

    pub fn flows(&self) -> Vec<FlowSnapshot> {
        self.stack.flows()
    }

    // ─── Statistics ─────────────────────────────────────────────────────

    /// One statistics tick: sample, then write per-metric rows and the
    /// netstats block.
    pub fn sample_flows(&mut self, now: SimTime, interval: SimDuration) -> Result<usize, SinkError> {
        let snapshot = self.stack.flows();
        let samples = self.stats.sample(&snapshot, now, interval);

        for sample in &samples {
            for (metric, value) in sample.metrics() {
                let name = flow_metric_sink_name(sample.flow_id, metric, &self.suffix);
                self.sinks.write_named(&name, &metric_row(sample.time, metric, value))?;
            }
        }
        if let Some(netstats) = &self.netstats_sink {
            self.sinks.write_named(netstats, &format!("Time: {now}"))?;
            for sample in &samples {
                let Some(flow) = snapshot.iter().find(|f| f.id == sample.flow_id) else {
                    continue;
                };
                for line in render_netstats_block(flow, sample).lines() {
                    self.sinks.write_named(netstats, line)?;
                }
            }
        }
        tracing::debug!(t = %now, flows = samples.len(), "flow statistics sampled");
        Ok(samples.len())
    }

    // ─── Fatal Errors ───────────────────────────────────────────────────

    /// Stores the first setup error raised inside a callback. The caller
    /// stops the scheduler.
    pub fn fail(&mut self, err: impl Into<NetlabError>) {
        let err = err.into();
        tracing::error!(error = %err, "experiment aborted");
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    pub fn has_failed(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn take_error(&mut self) -> Option<NetlabError> {
        self.fatal.take()
    }
}

impl std::fmt::Debug for ExperimentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentContext")
            .field("topology", &self.topology)
            .field("apps", &self.apps.len())
            .field("objects", &self.objects.len())
            .field("sinks", &self.sinks)
            .field("failed", &self.fatal.is_some())
            .finish_non_exhaustive()
    }
}
