//! # Experiment Driver
//!
//! Turns an [`ExperimentConfig`] plus a set of [`Collaborators`] into a
//! scheduled timeline and runs it:
//!
//! 1. install the topology and compute initial routes
//! 2. schedule application start/stop
//! 3. schedule link-state changes (explicit events, then expanded plans)
//! 4. start the transport stack's advance task
//! 5. start the statistics task
//! 6. start application throughput probes
//! 7. schedule trace activations
//! 8. run to the stop time
//! 9. cancel repeating tasks, finalize the stack, collect flow reports
//! 10. flush sinks and return the report
//!
//! Link events are scheduled before any repeating task is armed, so at equal
//! timestamps the topology settles before traffic moves.
//!
//! A setup error raised inside a callback (unknown interface, missing
//! mandatory trace property, sink I/O failure) is parked in the context, the
//! scheduler is stopped, and [`Experiment::run`] returns it.

use crate::collab::{Collaborators, TrafficGenerator};
use crate::config::{AppSpec, ExperimentConfig};
use crate::context::ExperimentContext;
use crate::error::{ConfigError, NetlabError};
use crate::flow::FlowFilter;
use crate::report::{AppReport, ExperimentReport, FlowSeries, ProbePoint, ProbeSeries};
use crate::scenario::{expand_plans, stream_seed, LinkEventSpec, LinkTarget};
use crate::scheduler::{RepeatingHandle, Scheduler};
use crate::sink::{SinkBackend, SinkRegistry};
use crate::stats::{AppThroughputProbe, FlowReport, FlowStatsEngine};
use crate::time::{SimDuration, SimTime};
use crate::topology::{NodeId, Topology};
use crate::trace::{SinkNamer, TraceMux};

/// RNG stream used to expand random link plans.
const PLAN_STREAM: u64 = 1;

pub struct Experiment {
    config: ExperimentConfig,
    collaborators: Collaborators,
    backend: SinkBackend,
}

impl Experiment {
    /// Sinks are kept in memory unless [`with_sinks`](Self::with_sinks)
    /// selects a directory.
    pub fn new(config: ExperimentConfig, collaborators: Collaborators) -> Self {
        Experiment {
            config,
            collaborators,
            backend: SinkBackend::Memory,
        }
    }

    pub fn with_sinks(mut self, backend: SinkBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Runs the experiment and consumes it. Memory sinks are returned with
    /// the report so callers can inspect rows.
    pub fn run(self) -> Result<ExperimentReport, NetlabError> {
        self.run_with_sinks().map(|(report, _)| report)
    }

    pub fn run_with_sinks(self) -> Result<(ExperimentReport, SinkRegistry), NetlabError> {
        let Experiment {
            config,
            collaborators,
            backend,
        } = self;
        let Collaborators {
            mut routing,
            stack,
            apps,
        } = collaborators;

        tracing::info!(
            name = %config.name,
            run = config.run,
            seed = config.seed,
            stop_time = %config.stop_time,
            "starting experiment"
        );

        // 1. Topology
        let topology = build_topology(&config)?;
        routing.recompute(&topology);
        check_apps(&config.apps, &apps)?;

        let mut filter = FlowFilter::new();
        for id in &config.sampling.exclude_flows {
            filter = filter.exclude_flow(*id);
        }
        for addr in &config.sampling.exclude_sources {
            filter = filter.exclude_source(*addr);
        }

        let mut sinks = SinkRegistry::new(backend);
        sinks.open(&config.drop_sink())?;

        let mut ctx = ExperimentContext::new(
            topology,
            routing,
            stack,
            apps,
            TraceMux::new(config.drop_sink()),
            FlowStatsEngine::new(SimTime::ZERO, filter),
            sinks,
            config.suffix.clone(),
        );
        if config.sampling.enabled && config.sampling.netstats {
            ctx.netstats_sink = Some(config.netstats_sink());
        }

        let mut sched: Scheduler<ExperimentContext> = Scheduler::new();
        let mut repeating: Vec<RepeatingHandle> = Vec::new();

        // 2. Applications
        for (idx, app) in config.apps.iter().enumerate() {
            let name = app.name.clone();
            sched.schedule_at(app.start, move |s, ctx| {
                tracing::info!(app = %name, t = %s.now(), "application started");
                ctx.apps[idx].start(s.now());
            })?;
            let name = app.name.clone();
            sched.schedule_at(app.stop, move |s, ctx| {
                tracing::info!(app = %name, t = %s.now(), "application stopped");
                ctx.apps[idx].stop(s.now());
            })?;
        }

        // 3. Link-state changes
        let mut link_events = config.link_events.clone();
        link_events.extend(expand_plans(
            &config.plans,
            stream_seed(config.seed, config.run, PLAN_STREAM),
        ));
        link_events.sort_by_key(|e| e.at);
        for event in &link_events {
            schedule_link_event(&mut sched, &ctx.topology, event)?;
        }
        tracing::info!(count = link_events.len(), "link events scheduled");

        // 4. Transport stack
        let tick = ctx.stack.tick();
        if !tick.is_positive() {
            return Err(ConfigError::invalid("stack.tick", "must be positive").into());
        }
        repeating.push(sched.schedule_repeating(
            SimDuration::ZERO,
            tick,
            |s, ctx| {
                if let Err(e) = ctx.advance_stack(s.now()) {
                    ctx.fail(e);
                    s.stop();
                }
            },
        )?);

        // 5. Flow statistics
        if config.sampling.enabled {
            let interval = config.sampling.interval;
            repeating.push(sched.schedule_repeating(
                config.sampling.first_at - SimTime::ZERO,
                interval,
                move |s, ctx| {
                    if let Err(e) = ctx.sample_flows(s.now(), interval) {
                        ctx.fail(e);
                        s.stop();
                    }
                },
            )?);
        }

        // 6. Application throughput probes
        for probe in &config.probes {
            let idx = config
                .apps
                .iter()
                .position(|a| a.name == probe.app)
                .ok_or_else(|| ConfigError::UnknownApp(probe.app.clone()))?;
            let series = ctx.probes.len();
            ctx.probes.push(ProbeSeries {
                app: probe.app.clone(),
                points: Vec::new(),
            });
            let sink = format!("app-{}-throughput{}", probe.app, config.suffix);
            let interval = probe.interval;
            let mut state = AppThroughputProbe::new();
            repeating.push(sched.schedule_repeating(
                probe.first_at - SimTime::ZERO,
                interval,
                move |s, ctx| {
                    let total = ctx.apps[idx].total_rx();
                    let Some(kbps) = state.sample(total, interval) else {
                        return;
                    };
                    let now = s.now();
                    ctx.probes[series].points.push(ProbePoint {
                        time: now.as_secs_f64(),
                        kbps,
                    });
                    if let Err(e) = ctx.sinks.write_named(&sink, &format!("{now}\t{kbps}")) {
                        ctx.fail(e);
                        s.stop();
                    }
                },
            )?);
        }

        // 7. Trace activations
        for trace in &config.traces {
            let node = node_id(&ctx.topology, &trace.node)?;
            let namer = SinkNamer::new(trace.role, node, config.suffix.clone());
            let requests = trace.requests.clone();
            sched.schedule_at(trace.at, move |s, ctx| {
                let now = s.now();
                match ctx
                    .traces
                    .activate(&requests, &namer, &ctx.objects, &mut ctx.sinks, now)
                {
                    Ok(activation) => tracing::info!(
                        node = %namer.node,
                        role = %namer.role,
                        bound = activation.bindings.len(),
                        unmatched = activation.unmatched.len(),
                        skipped = activation.skipped_optional.len(),
                        "traces activated"
                    ),
                    Err(e) => {
                        ctx.fail(e);
                        s.stop();
                    }
                }
            })?;
        }

        // 8. Run
        let summary = sched.run_until(config.stop_time, &mut ctx);
        if let Some(err) = ctx.take_error() {
            return Err(err);
        }
        tracing::info!(
            dispatched = summary.dispatched,
            ended_at = %summary.ended_at,
            "run complete"
        );

        // 9. Teardown
        for handle in &repeating {
            handle.cancel(&mut sched);
        }
        let end = summary.ended_at;
        ctx.stack.finalize(end);
        if config.sampling.enabled
            && end >= config.sampling.first_at
            && ctx.stats.last_tick() != Some(end)
        {
            // Partial interval closing the series at the stop time.
            let partial = ctx
                .stats
                .last_tick()
                .map_or(config.sampling.interval, |t| end - t);
            ctx.sample_flows(end, partial)?;
        }
        let elapsed = end - SimTime::ZERO;
        let snapshot = ctx.flows();
        let flows = FlowReport::collect(&snapshot, ctx.stats.filter(), elapsed);
        for flow in &flows {
            tracing::info!(
                flow = %flow.flow_id,
                tuple = %flow.tuple,
                rx_bytes = flow.rx_bytes,
                lost = flow.lost_packets,
                "final flow"
            );
        }

        // 10. Report
        ctx.sinks.flush_all()?;
        let report = ExperimentReport {
            name: config.name.clone(),
            run: config.run,
            seed: config.seed,
            elapsed_s: elapsed.as_secs_f64(),
            events_dispatched: summary.dispatched,
            flows,
            samples: ctx
                .stats
                .samples()
                .iter()
                .map(|(id, samples)| FlowSeries {
                    flow_id: *id,
                    samples: samples.clone(),
                })
                .collect(),
            link_changes: ctx.history.changes().to_vec(),
            traces: ctx.traces.summary(),
            apps: ctx
                .apps
                .iter()
                .map(|a| AppReport {
                    name: a.name().to_string(),
                    tx_bytes: a.total_tx(),
                    rx_bytes: a.total_rx(),
                })
                .collect(),
            probes: std::mem::take(&mut ctx.probes),
            sinks: ctx.sinks.names().map(str::to_string).collect(),
        };
        let ExperimentContext { sinks, .. } = ctx;
        Ok((report, sinks))
    }
}

fn node_id(topology: &Topology, name: &str) -> Result<NodeId, ConfigError> {
    topology
        .node_by_name(name)
        .ok_or_else(|| ConfigError::UnknownNode(name.to_string()))
}

/// Nodes and links in configuration order, then the initial link states.
fn build_topology(config: &ExperimentConfig) -> Result<Topology, NetlabError> {
    let mut topology = Topology::new();
    for name in &config.nodes {
        topology.add_node(name)?;
    }
    for link in &config.links {
        let a = node_id(&topology, &link.a)?;
        let b = node_id(&topology, &link.b)?;
        let id = topology.add_link(&link.name, a, b, link.attributes.clone())?;
        if !link.up {
            topology.set_link_state(id, false, SimTime::ZERO)?;
        }
        tracing::debug!(
            link = %link.name,
            a = %link.a,
            b = %link.b,
            rate_bps = link.attributes.data_rate_bps,
            delay = %link.attributes.delay,
            queue = link.attributes.queue.name(),
            up = link.up,
            "link installed"
        );
    }
    Ok(topology)
}

/// Collaborator apps must line up one-to-one with the configured apps.
fn check_apps(
    specs: &[AppSpec],
    apps: &[Box<dyn TrafficGenerator>],
) -> Result<(), ConfigError> {
    if specs.len() != apps.len() {
        return Err(ConfigError::invalid(
            "apps",
            format!("{} configured but {} installed", specs.len(), apps.len()),
        ));
    }
    for (spec, app) in specs.iter().zip(apps) {
        if spec.name != app.name() {
            return Err(ConfigError::UnknownApp(app.name().to_string()));
        }
    }
    Ok(())
}

/// Resolves the target now, so unknown links fail before the run starts.
fn schedule_link_event(
    sched: &mut Scheduler<ExperimentContext>,
    topology: &Topology,
    event: &LinkEventSpec,
) -> Result<(), NetlabError> {
    let up = event.up;
    match &event.target {
        LinkTarget::Link(name) => {
            let link = topology
                .link_by_name(name)
                .ok_or_else(|| ConfigError::UnknownLink(name.clone()))?;
            sched.schedule_at(event.at, move |s, ctx| {
                if let Err(e) = ctx.set_link_state(link, up, s.now()) {
                    ctx.fail(e);
                    s.stop();
                }
            })?;
        }
        LinkTarget::Interface { node, index } => {
            let node = node_id(topology, node)?;
            let index = *index;
            topology.interface_link(node, index)?;
            sched.schedule_at(event.at, move |s, ctx| {
                if let Err(e) = ctx.set_interface_state(node, index, up, s.now()) {
                    ctx.fail(e);
                    s.stop();
                }
            })?;
        }
    }
    Ok(())
}
