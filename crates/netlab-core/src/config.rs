//! # Experiment Configuration
//!
//! TOML is deserialized into permissive `*Input` structs (every field
//! optional, `#[serde(default)]`), then [`ExperimentConfigInput::resolve`]
//! validates cross references and fills defaults into the typed
//! [`ExperimentConfig`].
//!
//! Data rates accept `"100Mbps"`, `"1.5Mbps"`, `"500kbps"`; durations accept
//! `"33ms"`, `"2s"`, `"250us"` or a bare number of seconds.

use crate::error::ConfigError;
use crate::flow::FlowId;
use crate::scenario::{LinkEventSpec, LinkPlan, LinkTarget};
use crate::time::{SimDuration, SimTime};
use crate::topology::{LinkAttributes, LossModel, QueueDisc};
use crate::trace::{InstanceSelector, Layer, Property, Requirement, Role, TraceRequest};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;

pub const DEFAULT_STOP_TIME: SimDuration = SimDuration::from_secs(10);
pub const DEFAULT_SAMPLE_INTERVAL: SimDuration = SimDuration::from_millis(100);
/// Gap between an application's start and a trace activation that follows it
/// without an explicit `at`.
pub const TRACE_AFTER_APP_DELAY: SimDuration = SimDuration::from_micros(1);
const DEFAULT_SEED: u64 = 1;
const DEFAULT_PORT: u16 = 9;

// ─── Inputs ─────────────────────────────────────────────────────────────────

/// Seconds as a number, or a string with a unit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TimeInput {
    Seconds(f64),
    Text(String),
}

impl TimeInput {
    fn duration(&self, field: &str) -> Result<SimDuration, ConfigError> {
        match self {
            TimeInput::Seconds(s) if s.is_finite() => Ok(SimDuration::from_secs_f64(*s)),
            TimeInput::Seconds(s) => Err(ConfigError::invalid(field, format!("{s} is not finite"))),
            TimeInput::Text(t) => parse_duration(t).map_err(|reason| ConfigError::invalid(field, reason)),
        }
    }

    fn instant(&self, field: &str) -> Result<SimTime, ConfigError> {
        let d = self.duration(field)?;
        if d.is_negative() {
            return Err(ConfigError::invalid(field, "must not be negative"));
        }
        Ok(SimTime::ZERO + d)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExperimentConfigInput {
    pub name: Option<String>,
    pub run: u32,
    pub seed: Option<u64>,
    pub stop_time: Option<TimeInput>,
    /// Appended to every sink name. Defaults to `-run{run}.txt`.
    pub suffix: Option<String>,
    pub nodes: Vec<String>,
    pub links: Vec<LinkInput>,
    pub apps: Vec<AppInput>,
    pub link_events: Vec<LinkEventInput>,
    pub plans: Vec<PlanInput>,
    pub sampling: SamplingInput,
    pub traces: Vec<TraceInput>,
    pub probes: Vec<ProbeInput>,
    /// Passed through untouched to the transport stack.
    pub stack: toml::Table,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkInput {
    pub name: String,
    pub a: String,
    pub b: String,
    pub rate: Option<String>,
    pub delay: Option<TimeInput>,
    pub loss: Option<LossInput>,
    pub queue: Option<QueueInput>,
    pub up: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LossInput {
    Rate {
        probability: f64,
    },
    GilbertElliott {
        p: f64,
        r: f64,
        #[serde(default)]
        loss_good: f64,
        #[serde(default = "one")]
        loss_bad: f64,
    },
}

fn one() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind")]
pub enum QueueInput {
    #[serde(rename = "pfifo_fast")]
    PfifoFast { limit_packets: Option<u32> },
    #[serde(rename = "codel")]
    CoDel { limit_bytes: Option<u64> },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppInput {
    pub name: String,
    /// `bulk` or `onoff`.
    pub kind: String,
    pub source: String,
    pub sink: String,
    pub port: Option<u16>,
    pub start: Option<TimeInput>,
    pub stop: Option<TimeInput>,
    pub max_bytes: Option<u64>,
    pub send_size: Option<u32>,
    pub rate: Option<String>,
    pub packet_size: Option<u32>,
    pub on: Option<TimeInput>,
    pub off: Option<TimeInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkEventInput {
    pub at: Option<TimeInput>,
    pub link: Option<String>,
    pub node: Option<String>,
    pub interface: Option<u32>,
    pub up: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanInput {
    MakeBeforeBreak {
        from: String,
        to: String,
        at: TimeInput,
        overlap: Option<TimeInput>,
    },
    BreakBeforeMake {
        from: String,
        to: String,
        at: TimeInput,
        gap: Option<TimeInput>,
    },
    Outage {
        link: String,
        at: TimeInput,
        duration: TimeInput,
    },
    Pulse {
        link: String,
        start: TimeInput,
        period: TimeInput,
        down_for: TimeInput,
        until: Option<TimeInput>,
    },
    Flapping {
        link: String,
        start: Option<TimeInput>,
        end: Option<TimeInput>,
        mean_up: TimeInput,
        mean_down: TimeInput,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SamplingInput {
    pub enabled: Option<bool>,
    pub first_at: Option<TimeInput>,
    pub interval: Option<TimeInput>,
    pub exclude_flows: Vec<u32>,
    pub exclude_sources: Vec<String>,
    pub netstats: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TraceInput {
    pub node: String,
    pub role: Option<String>,
    pub at: Option<TimeInput>,
    pub after_app: Option<String>,
    /// Empty selects the standard set.
    pub requests: Vec<TraceRequestInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TraceRequestInput {
    pub property: String,
    pub layer: Option<String>,
    /// `None` matches every instance.
    pub instance: Option<u32>,
    pub optional: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbeInput {
    pub app: String,
    pub first_at: Option<TimeInput>,
    pub interval: Option<TimeInput>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub name: String,
    pub a: String,
    pub b: String,
    pub attributes: LinkAttributes,
    pub up: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppKind {
    /// Sends as fast as the stack allows, up to `max_bytes` (0 = unlimited).
    Bulk { max_bytes: u64, send_size: u32 },
    /// Constant bit rate during on periods, silent during off periods.
    OnOff {
        rate_bps: u64,
        packet_size: u32,
        on: SimDuration,
        off: SimDuration,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppSpec {
    pub name: String,
    pub kind: AppKind,
    pub source: String,
    pub sink: String,
    pub port: u16,
    pub start: SimTime,
    pub stop: SimTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub enabled: bool,
    pub first_at: SimTime,
    pub interval: SimDuration,
    pub exclude_flows: Vec<FlowId>,
    pub exclude_sources: Vec<Ipv4Addr>,
    /// Append a text block per flow and tick to the netstats sink.
    pub netstats: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            first_at: SimTime::ZERO + DEFAULT_SAMPLE_INTERVAL,
            interval: DEFAULT_SAMPLE_INTERVAL,
            exclude_flows: Vec::new(),
            exclude_sources: Vec::new(),
            netstats: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceSpec {
    pub node: String,
    pub role: Role,
    pub at: SimTime,
    pub after_app: Option<String>,
    pub requests: Vec<TraceRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSpec {
    pub app: String,
    pub first_at: SimTime,
    pub interval: SimDuration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub name: String,
    pub run: u32,
    pub seed: u64,
    pub stop_time: SimTime,
    pub suffix: String,
    pub nodes: Vec<String>,
    pub links: Vec<LinkSpec>,
    pub apps: Vec<AppSpec>,
    pub link_events: Vec<LinkEventSpec>,
    pub plans: Vec<LinkPlan>,
    pub sampling: SamplingConfig,
    pub traces: Vec<TraceSpec>,
    pub probes: Vec<ProbeSpec>,
    pub stack: toml::Table,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "experiment".to_string(),
            run: 0,
            seed: DEFAULT_SEED,
            stop_time: SimTime::ZERO + DEFAULT_STOP_TIME,
            suffix: suffix_for_run(0),
            nodes: Vec::new(),
            links: Vec::new(),
            apps: Vec::new(),
            link_events: Vec::new(),
            plans: Vec::new(),
            sampling: SamplingConfig::default(),
            traces: Vec::new(),
            probes: Vec::new(),
            stack: toml::Table::new(),
        }
    }
}

fn suffix_for_run(run: u32) -> String {
    format!("-run{run}.txt")
}

impl ExperimentConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        ExperimentConfigInput::from_toml_str(input)?.resolve()
    }

    /// Name of the always-on physical drop sink.
    pub fn drop_sink(&self) -> String {
        format!("phy-rx-drop{}", self.suffix)
    }

    pub fn netstats_sink(&self) -> String {
        format!("netstats{}", self.suffix)
    }

    pub fn app(&self, name: &str) -> Option<&AppSpec> {
        self.apps.iter().find(|a| a.name == name)
    }

    /// Switches to another run index, keeping an explicit suffix unless it
    /// was the default of the previous run.
    pub fn with_run(mut self, run: u32) -> Self {
        if self.suffix == suffix_for_run(self.run) {
            self.suffix = suffix_for_run(run);
        }
        self.run = run;
        self
    }
}

// ─── Resolve ────────────────────────────────────────────────────────────────

impl ExperimentConfigInput {
    /// Parses without validating, so callers can override fields before
    /// [`resolve`](Self::resolve).
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn resolve(self) -> Result<ExperimentConfig, ConfigError> {
        let defaults = ExperimentConfig::default();

        let stop_time = match &self.stop_time {
            Some(t) => t.instant("stop_time")?,
            None => defaults.stop_time,
        };
        if stop_time == SimTime::ZERO {
            return Err(ConfigError::invalid("stop_time", "must be positive"));
        }

        // Nodes
        let mut node_names = HashSet::new();
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for name in self.nodes {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(ConfigError::invalid("nodes", "empty node name"));
            }
            if !node_names.insert(name.clone()) {
                return Err(ConfigError::invalid("nodes", format!("duplicate node {name:?}")));
            }
            nodes.push(name);
        }
        let known_node = |name: &str| -> Result<(), ConfigError> {
            if node_names.contains(name) {
                Ok(())
            } else {
                Err(ConfigError::UnknownNode(name.to_string()))
            }
        };

        // Links
        let mut link_names = HashSet::new();
        let mut links = Vec::with_capacity(self.links.len());
        for (idx, link) in self.links.into_iter().enumerate() {
            let name = if link.name.trim().is_empty() {
                format!("link{idx}")
            } else {
                link.name.trim().to_string()
            };
            if !link_names.insert(name.clone()) {
                return Err(ConfigError::invalid("links", format!("duplicate link {name:?}")));
            }
            known_node(&link.a)?;
            known_node(&link.b)?;
            let attributes = resolve_link_attributes(&name, &link)?;
            links.push(LinkSpec {
                name,
                a: link.a,
                b: link.b,
                attributes,
                up: link.up.unwrap_or(true),
            });
        }
        let known_link = |name: &str| -> Result<(), ConfigError> {
            if link_names.contains(name) {
                Ok(())
            } else {
                Err(ConfigError::UnknownLink(name.to_string()))
            }
        };

        // Applications
        let mut app_names = HashSet::new();
        let mut apps = Vec::with_capacity(self.apps.len());
        for (idx, app) in self.apps.into_iter().enumerate() {
            let spec = resolve_app(idx, app, stop_time)?;
            known_node(&spec.source)?;
            known_node(&spec.sink)?;
            if !app_names.insert(spec.name.clone()) {
                return Err(ConfigError::invalid("apps", format!("duplicate app {:?}", spec.name)));
            }
            apps.push(spec);
        }

        // Link events
        let mut link_events = Vec::with_capacity(self.link_events.len());
        for event in self.link_events {
            let at = event
                .at
                .as_ref()
                .ok_or_else(|| ConfigError::invalid("link_events.at", "missing"))?
                .instant("link_events.at")?;
            let target = match (event.link, event.node, event.interface) {
                (Some(link), None, None) => {
                    known_link(&link)?;
                    LinkTarget::Link(link)
                }
                (None, Some(node), Some(index)) => {
                    known_node(&node)?;
                    if index == 0 {
                        return Err(ConfigError::invalid(
                            "link_events.interface",
                            "interface 0 is the loopback",
                        ));
                    }
                    LinkTarget::Interface { node, index }
                }
                _ => {
                    return Err(ConfigError::invalid(
                        "link_events",
                        "give either `link` or `node` and `interface`",
                    ));
                }
            };
            link_events.push(LinkEventSpec {
                at,
                target,
                up: event.up,
            });
        }

        // Plans
        let mut plans = Vec::with_capacity(self.plans.len());
        for plan in self.plans {
            let plan = resolve_plan(plan, stop_time)?;
            for link in plan.links() {
                known_link(link)?;
            }
            plans.push(plan);
        }

        let sampling = resolve_sampling(self.sampling)?;

        // Traces
        let mut traces = Vec::with_capacity(self.traces.len());
        for trace in self.traces {
            known_node(&trace.node)?;
            let role = match trace.role.as_deref().map(str::trim) {
                None | Some("server") => Role::Server,
                Some("client") => Role::Client,
                Some(other) => {
                    return Err(ConfigError::invalid("traces.role", format!("unknown role {other:?}")));
                }
            };
            let after = match &trace.after_app {
                Some(app_name) => Some(
                    apps.iter()
                        .find(|a| &a.name == app_name)
                        .ok_or_else(|| ConfigError::UnknownApp(app_name.clone()))?,
                ),
                None => None,
            };
            let at = match (&trace.at, after) {
                (Some(t), _) => t.instant("traces.at")?,
                (None, Some(app)) => app.start + TRACE_AFTER_APP_DELAY,
                (None, None) => {
                    return Err(ConfigError::invalid(
                        "traces.at",
                        "required unless after_app names the application to follow",
                    ));
                }
            };
            if at == SimTime::ZERO {
                return Err(ConfigError::invalid("traces.at", "must be after the experiment start"));
            }
            if let Some(app) = after {
                if at <= app.start {
                    return Err(ConfigError::invalid(
                        "traces.at",
                        format!(
                            "activation at {at}s must come after app {:?} starts at {}s",
                            app.name, app.start
                        ),
                    ));
                }
            }
            let requests = if trace.requests.is_empty() {
                TraceRequest::standard_set()
            } else {
                trace
                    .requests
                    .iter()
                    .map(resolve_trace_request)
                    .collect::<Result<Vec<_>, _>>()?
            };
            traces.push(TraceSpec {
                node: trace.node,
                role,
                at,
                after_app: trace.after_app,
                requests,
            });
        }

        // Probes
        let mut probes = Vec::with_capacity(self.probes.len());
        for probe in self.probes {
            if !app_names.contains(&probe.app) {
                return Err(ConfigError::UnknownApp(probe.app));
            }
            let interval = match &probe.interval {
                Some(t) => t.duration("probes.interval")?,
                None => DEFAULT_SAMPLE_INTERVAL,
            };
            if !interval.is_positive() {
                return Err(ConfigError::invalid("probes.interval", "must be positive"));
            }
            let first_at = match &probe.first_at {
                Some(t) => t.instant("probes.first_at")?,
                None => SimTime::ZERO + interval,
            };
            probes.push(ProbeSpec {
                app: probe.app,
                first_at,
                interval,
            });
        }

        let suffix = self.suffix.unwrap_or_else(|| suffix_for_run(self.run));

        Ok(ExperimentConfig {
            name: self.name.unwrap_or(defaults.name),
            run: self.run,
            seed: self.seed.unwrap_or(DEFAULT_SEED),
            stop_time,
            suffix,
            nodes,
            links,
            apps,
            link_events,
            plans,
            sampling,
            traces,
            probes,
            stack: self.stack,
        })
    }
}

fn resolve_link_attributes(name: &str, link: &LinkInput) -> Result<LinkAttributes, ConfigError> {
    let defaults = LinkAttributes::default();
    let data_rate_bps = match &link.rate {
        Some(rate) => parse_rate(rate).map_err(|r| ConfigError::invalid(format!("links.{name}.rate"), r))?,
        None => defaults.data_rate_bps,
    };
    if data_rate_bps == 0 {
        return Err(ConfigError::invalid(format!("links.{name}.rate"), "must be positive"));
    }
    let delay = match &link.delay {
        Some(d) => d.duration(&format!("links.{name}.delay"))?,
        None => defaults.delay,
    };
    if delay.is_negative() {
        return Err(ConfigError::invalid(format!("links.{name}.delay"), "must not be negative"));
    }

    let loss = match &link.loss {
        None => None,
        Some(LossInput::Rate { probability }) => {
            check_probability(name, "probability", *probability)?;
            Some(LossModel::Rate {
                probability: *probability,
            })
        }
        Some(LossInput::GilbertElliott {
            p,
            r,
            loss_good,
            loss_bad,
        }) => {
            for (field, value) in [("p", *p), ("r", *r), ("loss_good", *loss_good), ("loss_bad", *loss_bad)] {
                check_probability(name, field, value)?;
            }
            Some(LossModel::GilbertElliott {
                p: *p,
                r: *r,
                loss_good: *loss_good,
                loss_bad: *loss_bad,
            })
        }
    };

    let queue = match &link.queue {
        None => QueueDisc::default(),
        Some(QueueInput::PfifoFast { limit_packets }) => QueueDisc::PfifoFast {
            limit_packets: *limit_packets,
        },
        Some(QueueInput::CoDel { limit_bytes }) => QueueDisc::CoDel {
            limit_bytes: *limit_bytes,
        },
    };

    Ok(LinkAttributes {
        data_rate_bps,
        delay,
        loss,
        queue,
    })
}

fn check_probability(link: &str, field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            format!("links.{link}.loss.{field}"),
            format!("{value} is outside 0.0-1.0"),
        ))
    }
}

fn resolve_app(idx: usize, app: AppInput, stop_time: SimTime) -> Result<AppSpec, ConfigError> {
    let name = if app.name.trim().is_empty() {
        format!("app{idx}")
    } else {
        app.name.trim().to_string()
    };
    let field = |f: &str| format!("apps.{name}.{f}");

    let start = match &app.start {
        Some(t) => t.instant(&field("start"))?,
        None => SimTime::ZERO,
    };
    let stop = match &app.stop {
        Some(t) => t.instant(&field("stop"))?,
        None => stop_time,
    };
    if stop < start {
        return Err(ConfigError::invalid(field("stop"), "must not precede start"));
    }

    let kind = match app.kind.trim() {
        "" | "bulk" => AppKind::Bulk {
            max_bytes: app.max_bytes.unwrap_or(0),
            send_size: app.send_size.unwrap_or(crate::topology::DEFAULT_MTU).max(1),
        },
        "onoff" => {
            let rate = app
                .rate
                .as_deref()
                .ok_or_else(|| ConfigError::invalid(field("rate"), "on/off apps need a rate"))?;
            let rate_bps = parse_rate(rate).map_err(|r| ConfigError::invalid(field("rate"), r))?;
            let on = match &app.on {
                Some(t) => t.duration(&field("on"))?,
                None => SimDuration::from_secs(1),
            };
            let off = match &app.off {
                Some(t) => t.duration(&field("off"))?,
                None => SimDuration::ZERO,
            };
            if !on.is_positive() || off.is_negative() {
                return Err(ConfigError::invalid(field("on"), "on must be positive and off non-negative"));
            }
            AppKind::OnOff {
                rate_bps,
                packet_size: app.packet_size.unwrap_or(512).max(1),
                on,
                off,
            }
        }
        other => {
            return Err(ConfigError::invalid(field("kind"), format!("unknown app kind {other:?}")));
        }
    };

    Ok(AppSpec {
        name: name.clone(),
        kind,
        source: app.source,
        sink: app.sink,
        port: app.port.unwrap_or(DEFAULT_PORT),
        start,
        stop,
    })
}

fn positive(d: SimDuration, field: &str) -> Result<SimDuration, ConfigError> {
    if d.is_positive() {
        Ok(d)
    } else {
        Err(ConfigError::invalid(field, "must be positive"))
    }
}

fn non_negative(d: SimDuration, field: &str) -> Result<SimDuration, ConfigError> {
    if d.is_negative() {
        Err(ConfigError::invalid(field, "must not be negative"))
    } else {
        Ok(d)
    }
}

/// Every plan must expand into a finite, correctly ordered event list.
fn resolve_plan(plan: PlanInput, stop_time: SimTime) -> Result<LinkPlan, ConfigError> {
    let opt = |t: &Option<TimeInput>, field: &str| -> Result<SimDuration, ConfigError> {
        let d = t.as_ref().map_or(Ok(SimDuration::ZERO), |t| t.duration(field))?;
        non_negative(d, field)
    };
    let plan = match plan {
        PlanInput::MakeBeforeBreak {
            from,
            to,
            at,
            overlap,
        } => LinkPlan::MakeBeforeBreak {
            from,
            to,
            at: at.instant("plans.at")?,
            overlap: opt(&overlap, "plans.overlap")?,
        },
        PlanInput::BreakBeforeMake { from, to, at, gap } => LinkPlan::BreakBeforeMake {
            from,
            to,
            at: at.instant("plans.at")?,
            gap: opt(&gap, "plans.gap")?,
        },
        PlanInput::Outage { link, at, duration } => LinkPlan::Outage {
            link,
            at: at.instant("plans.at")?,
            duration: positive(duration.duration("plans.duration")?, "plans.duration")?,
        },
        PlanInput::Pulse {
            link,
            start,
            period,
            down_for,
            until,
        } => {
            let period = positive(period.duration("plans.period")?, "plans.period")?;
            let down_for = non_negative(down_for.duration("plans.down_for")?, "plans.down_for")?;
            if down_for >= period {
                return Err(ConfigError::invalid("plans.down_for", "must be shorter than the period"));
            }
            LinkPlan::Pulse {
                link,
                start: start.instant("plans.start")?,
                period,
                down_for,
                until: match &until {
                    Some(t) => t.instant("plans.until")?,
                    None => stop_time,
                },
            }
        }
        PlanInput::Flapping {
            link,
            start,
            end,
            mean_up,
            mean_down,
        } => {
            let start = match &start {
                Some(t) => t.instant("plans.start")?,
                None => SimTime::ZERO,
            };
            let end = match &end {
                Some(t) => t.instant("plans.end")?,
                None => stop_time,
            };
            if end <= start {
                return Err(ConfigError::invalid("plans.end", "must come after start"));
            }
            LinkPlan::Flapping {
                link,
                start,
                end,
                mean_up: positive(mean_up.duration("plans.mean_up")?, "plans.mean_up")?,
                mean_down: positive(mean_down.duration("plans.mean_down")?, "plans.mean_down")?,
            }
        }
    };
    Ok(plan)
}

fn resolve_sampling(input: SamplingInput) -> Result<SamplingConfig, ConfigError> {
    let defaults = SamplingConfig::default();
    let interval = match &input.interval {
        Some(t) => t.duration("sampling.interval")?,
        None => defaults.interval,
    };
    if !interval.is_positive() {
        return Err(ConfigError::invalid("sampling.interval", "must be positive"));
    }
    let first_at = match &input.first_at {
        Some(t) => t.instant("sampling.first_at")?,
        None => SimTime::ZERO + interval,
    };
    let exclude_sources = input
        .exclude_sources
        .iter()
        .map(|s| {
            s.trim()
                .parse::<Ipv4Addr>()
                .map_err(|e| ConfigError::invalid("sampling.exclude_sources", format!("{s:?}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SamplingConfig {
        enabled: input.enabled.unwrap_or(defaults.enabled),
        first_at,
        interval,
        exclude_flows: input.exclude_flows.into_iter().map(FlowId).collect(),
        exclude_sources,
        netstats: input.netstats.unwrap_or(defaults.netstats),
    })
}

fn resolve_trace_request(input: &TraceRequestInput) -> Result<TraceRequest, ConfigError> {
    let property = Property::parse(&input.property).ok_or_else(|| {
        ConfigError::invalid("traces.requests.property", format!("unknown property {:?}", input.property))
    })?;
    let layer = match input.layer.as_deref().map(str::trim) {
        None | Some("transport") => Layer::TransportL4,
        Some("application") => Layer::Application,
        Some(other) => {
            return Err(ConfigError::invalid("traces.requests.layer", format!("unknown layer {other:?}")));
        }
    };
    Ok(TraceRequest {
        layer,
        instance: input.instance.map_or(InstanceSelector::Any, InstanceSelector::Index),
        property,
        requirement: if input.optional {
            Requirement::Optional
        } else {
            Requirement::Mandatory
        },
    })
}

// ─── Unit Parsing ───────────────────────────────────────────────────────────

fn split_unit(input: &str) -> (&str, &str) {
    let s = input.trim();
    let idx = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(idx);
    (num.trim(), unit.trim())
}

/// Parses a data rate into bits per second (SI multipliers).
pub fn parse_rate(input: &str) -> Result<u64, String> {
    let (num, unit) = split_unit(input);
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid data rate {input:?}"))?;
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "bps" | "b/s" => 1.0,
        "kbps" | "kb/s" => 1e3,
        "mbps" | "mb/s" => 1e6,
        "gbps" | "gb/s" => 1e9,
        _ => return Err(format!("unknown data rate unit in {input:?}")),
    };
    let bps = value * multiplier;
    if !bps.is_finite() || bps < 0.0 {
        return Err(format!("invalid data rate {input:?}"));
    }
    Ok(bps.round() as u64)
}

/// Parses a duration with unit `ns`, `us`, `ms`, `s` or `min`. A bare number
/// is seconds.
pub fn parse_duration(input: &str) -> Result<SimDuration, String> {
    let (num, unit) = split_unit(input);
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;
    let secs = match unit {
        "" | "s" => value,
        "ms" => value / 1e3,
        "us" => value / 1e6,
        "ns" => value / 1e9,
        "min" => value * 60.0,
        _ => return Err(format!("unknown duration unit in {input:?}")),
    };
    if !secs.is_finite() {
        return Err(format!("invalid duration {input:?}"));
    }
    Ok(SimDuration::from_secs_f64(secs))
}
