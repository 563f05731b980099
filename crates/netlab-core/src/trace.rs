//! # Trace Subscription Multiplexer
//!
//! Protocol objects (sockets) only exist once traffic has created them, so
//! traces are bound late: at a scheduled activation time the multiplexer
//! resolves structured patterns against the live [`ObjectRegistry`] and binds
//! each match to a deterministically named sink. From then on typed
//! [`TraceEvent`]s emitted by the stack are routed to those sinks.
//!
//! - Each (object, property, sink) triple is bound at most once, so
//!   activating twice never duplicates rows. The same object may still feed
//!   sinks of different roles.
//! - A pattern that matches nothing is reported, not fatal.
//! - A matched object lacking an *optional* property is skipped; lacking a
//!   *mandatory* one is a setup error.
//! - Physical-layer drops go to an always-on diagnostic sink that needs no
//!   activation.

use crate::error::{SinkError, TraceError};
use crate::sink::{SinkId, SinkRegistry};
use crate::time::{SimDuration, SimTime};
use crate::topology::{LinkId, NodeId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

// ─── Identities ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Transport-protocol sockets.
    TransportL4,
    /// Applications installed on a node.
    Application,
}

/// Trace-worthy property of a protocol object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    CongestionWindow,
    ReceiveWindow,
    Rtt,
    Rx,
    SpinBit,
}

impl Property {
    pub const ALL: [Property; 5] = [
        Property::CongestionWindow,
        Property::ReceiveWindow,
        Property::Rtt,
        Property::Rx,
        Property::SpinBit,
    ];

    /// Metric part of sink names.
    pub fn metric(self) -> &'static str {
        match self {
            Property::CongestionWindow => "cwnd-change",
            Property::ReceiveWindow => "rwnd-change",
            Property::Rtt => "rtt",
            Property::Rx => "rx-data",
            Property::SpinBit => "spin",
        }
    }

    /// Parses the config spelling (`cwnd`, `rwnd`, `rtt`, `rx`, `spin`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cwnd" | "congestion_window" => Some(Property::CongestionWindow),
            "rwnd" | "receive_window" => Some(Property::ReceiveWindow),
            "rtt" => Some(Property::Rtt),
            "rx" => Some(Property::Rx),
            "spin" | "spin_bit" => Some(Property::SpinBit),
            _ => None,
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Property::CongestionWindow => "CongestionWindow",
            Property::ReceiveWindow => "RWND",
            Property::Rtt => "RTT",
            Property::Rx => "Rx",
            Property::SpinBit => "SpinBit",
        };
        f.write_str(name)
    }
}

/// Structured identity of a live protocol object: the `instance`-th object
/// created on `layer` of `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObjectPath {
    pub node: NodeId,
    pub layer: Layer,
    pub instance: u32,
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layer = match self.layer {
            Layer::TransportL4 => "transport",
            Layer::Application => "application",
        };
        write!(f, "{}/{}/{}", self.node, layer, self.instance)
    }
}

// ─── Object Registry ────────────────────────────────────────────────────────

/// Live protocol objects, populated by the stack as it creates them.
#[derive(Debug, Clone, Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<ObjectPath, Vec<Property>>,
    next_instance: HashMap<(NodeId, Layer), u32>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new object and returns its path. Instance indices count
    /// up from 0 per (node, layer).
    pub fn register(&mut self, node: NodeId, layer: Layer, properties: &[Property]) -> ObjectPath {
        let next = self.next_instance.entry((node, layer)).or_insert(0);
        let path = ObjectPath {
            node,
            layer,
            instance: *next,
        };
        *next += 1;
        self.objects.insert(path, properties.to_vec());
        path
    }

    pub fn properties(&self, path: &ObjectPath) -> Option<&[Property]> {
        self.objects.get(path).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects matching the node/layer/instance part of `pattern`, whether or
    /// not they expose the property.
    pub fn lookup(&self, pattern: &TracePattern) -> Vec<ObjectPath> {
        self.objects
            .keys()
            .filter(|p| {
                p.node == pattern.node
                    && p.layer == pattern.layer
                    && pattern.instance.matches(p.instance)
            })
            .copied()
            .collect()
    }
}

// ─── Patterns ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSelector {
    Index(u32),
    Any,
}

impl InstanceSelector {
    pub fn matches(self, instance: u32) -> bool {
        match self {
            InstanceSelector::Index(i) => i == instance,
            InstanceSelector::Any => true,
        }
    }
}

/// node → layer → instance → property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TracePattern {
    pub node: NodeId,
    pub layer: Layer,
    pub instance: InstanceSelector,
    pub property: Property,
}

impl fmt::Display for TracePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instance = match self.instance {
            InstanceSelector::Index(i) => i.to_string(),
            InstanceSelector::Any => "*".to_string(),
        };
        let layer = match self.layer {
            Layer::TransportL4 => "transport",
            Layer::Application => "application",
        };
        write!(f, "{}/{}/{}/{}", self.node, layer, instance, self.property)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    Mandatory,
    Optional,
}

/// One property to trace on a node, relative to the activated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRequest {
    pub layer: Layer,
    pub instance: InstanceSelector,
    pub property: Property,
    pub requirement: Requirement,
}

impl TraceRequest {
    pub fn mandatory(instance: InstanceSelector, property: Property) -> Self {
        TraceRequest {
            layer: Layer::TransportL4,
            instance,
            property,
            requirement: Requirement::Mandatory,
        }
    }

    pub fn optional(instance: InstanceSelector, property: Property) -> Self {
        TraceRequest {
            requirement: Requirement::Optional,
            ..Self::mandatory(instance, property)
        }
    }

    /// The set traced by the transfer scenarios: window and RTT of the first
    /// socket, receive events of every socket, and the optional receive
    /// window and spin bit.
    pub fn standard_set() -> Vec<TraceRequest> {
        use InstanceSelector::{Any, Index};
        vec![
            TraceRequest::mandatory(Any, Property::Rx),
            TraceRequest::mandatory(Index(0), Property::CongestionWindow),
            TraceRequest::mandatory(Index(0), Property::Rtt),
            TraceRequest::optional(Index(0), Property::ReceiveWindow),
            TraceRequest::optional(Any, Property::SpinBit),
        ]
    }

    pub fn pattern(&self, node: NodeId) -> TracePattern {
        TracePattern {
            node,
            layer: self.layer,
            instance: self.instance,
            property: self.property,
        }
    }
}

// ─── Sink Naming ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Builds sink names `{role}-{metric}-{node}{suffix}`, e.g.
/// `server-cwnd-change-5-run0.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkNamer {
    pub role: Role,
    pub node: NodeId,
    pub suffix: String,
}

impl SinkNamer {
    pub fn new(role: Role, node: NodeId, suffix: impl Into<String>) -> Self {
        SinkNamer {
            role,
            node,
            suffix: suffix.into(),
        }
    }

    pub fn name(&self, property: Property) -> String {
        format!("{}-{}-{}{}", self.role, property.metric(), self.node.0, self.suffix)
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Congestion,
    Receive,
}

/// Packet header encoding. Only short headers carry the spin bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderForm {
    Long,
    Short { spin: bool },
}

/// Closed set of events a protocol object can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    WindowChange { window: WindowKind, old: u32, new: u32 },
    RttChange { old: SimDuration, new: SimDuration },
    PacketReceived { size: u32, header: HeaderForm },
}

/// Formats the row `property` records for `event`, or `None` when the
/// binding does not consume this event (including spin-bit bindings seeing a
/// long-header packet).
pub fn format_row(property: Property, now: SimTime, event: &TraceEvent) -> Option<String> {
    match (property, event) {
        (
            Property::CongestionWindow,
            TraceEvent::WindowChange {
                window: WindowKind::Congestion,
                old,
                new,
            },
        )
        | (
            Property::ReceiveWindow,
            TraceEvent::WindowChange {
                window: WindowKind::Receive,
                old,
                new,
            },
        ) => Some(format!("{now}\t{old}\t{new}")),
        (Property::Rtt, TraceEvent::RttChange { old, new }) => Some(format!("{now}\t{old}\t{new}")),
        (Property::Rx, TraceEvent::PacketReceived { size, .. }) => Some(format!("{now}\t{size}")),
        (
            Property::SpinBit,
            TraceEvent::PacketReceived {
                header: HeaderForm::Short { spin },
                ..
            },
        ) => Some(format!("{now}\t{}", u8::from(*spin))),
        _ => None,
    }
}

// ─── Bindings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceBinding {
    pub path: ObjectPath,
    pub property: Property,
    pub sink: String,
    #[serde(skip)]
    sink_id: SinkId,
    pub activated_at: SimTime,
}

/// Outcome of one [`TraceMux::activate`] call.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    /// Bindings created by this call.
    pub bindings: Vec<TraceBinding>,
    /// Patterns matching no live object.
    pub unmatched: Vec<TracePattern>,
    /// (object, optional property) pairs the object does not expose.
    pub skipped_optional: Vec<(ObjectPath, Property)>,
    /// Pairs that were already bound by an earlier activation.
    pub already_bound: usize,
}

/// Summary of tracing activity, part of the final report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceSummary {
    pub bindings: Vec<BindingRecord>,
    pub unmatched_patterns: Vec<String>,
    pub skipped_optional: usize,
    pub phy_drops: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindingRecord {
    pub path: String,
    pub property: Property,
    pub sink: String,
    pub rows: u64,
}

// ─── Multiplexer ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TraceMux {
    bindings: Vec<TraceBinding>,
    rows: Vec<u64>,
    bound: HashSet<(ObjectPath, Property, String)>,
    by_object: HashMap<ObjectPath, Vec<usize>>,
    unmatched: Vec<TracePattern>,
    skipped_optional: usize,
    drop_sink: String,
    drops: u64,
}

impl TraceMux {
    /// `drop_sink` names the always-on physical drop channel.
    pub fn new(drop_sink: impl Into<String>) -> Self {
        TraceMux {
            bindings: Vec::new(),
            rows: Vec::new(),
            bound: HashSet::new(),
            by_object: HashMap::new(),
            unmatched: Vec::new(),
            skipped_optional: 0,
            drop_sink: drop_sink.into(),
            drops: 0,
        }
    }

    pub fn bindings(&self) -> &[TraceBinding] {
        &self.bindings
    }

    pub fn drops(&self) -> u64 {
        self.drops
    }

    /// Resolves `requests` on `namer.node` against the live objects and binds
    /// every new match. Nothing is bound if a mandatory property is missing.
    pub fn activate(
        &mut self,
        requests: &[TraceRequest],
        namer: &SinkNamer,
        registry: &ObjectRegistry,
        sinks: &mut SinkRegistry,
        now: SimTime,
    ) -> Result<Activation, TraceError> {
        let mut activation = Activation::default();
        let mut to_bind = Vec::new();

        for request in requests {
            let pattern = request.pattern(namer.node);
            let matches = registry.lookup(&pattern);
            tracing::info!(%pattern, matches = matches.len(), "trace pattern resolved");

            if matches.is_empty() {
                tracing::warn!(%pattern, "trace pattern matched no live object");
                activation.unmatched.push(pattern);
                continue;
            }

            for path in matches {
                let exposes = registry
                    .properties(&path)
                    .is_some_and(|props| props.contains(&request.property));
                if !exposes {
                    match request.requirement {
                        Requirement::Mandatory => {
                            return Err(TraceError::MissingProperty {
                                path,
                                property: request.property,
                            });
                        }
                        Requirement::Optional => {
                            tracing::debug!(%path, property = %request.property, "optional property not exposed, skipping");
                            activation.skipped_optional.push((path, request.property));
                            continue;
                        }
                    }
                }
                let key = (path, request.property, namer.name(request.property));
                if self.bound.contains(&key) || to_bind.contains(&key) {
                    activation.already_bound += 1;
                    continue;
                }
                to_bind.push(key);
            }
        }

        for (path, property, sink_name) in to_bind {
            let sink_id = sinks.open(&sink_name)?;
            let binding = TraceBinding {
                path,
                property,
                sink: sink_name,
                sink_id,
                activated_at: now,
            };
            tracing::debug!(%path, %property, sink = %binding.sink, "trace bound");

            self.bound.insert((path, property, binding.sink.clone()));
            self.by_object
                .entry(path)
                .or_default()
                .push(self.bindings.len());
            self.bindings.push(binding.clone());
            self.rows.push(0);
            activation.bindings.push(binding);
        }

        self.unmatched.extend(activation.unmatched.iter().copied());
        self.skipped_optional += activation.skipped_optional.len();
        Ok(activation)
    }

    /// Routes one event from `object` to its bindings. Returns the number of
    /// rows written.
    pub fn dispatch(
        &mut self,
        now: SimTime,
        object: ObjectPath,
        event: &TraceEvent,
        sinks: &mut SinkRegistry,
    ) -> Result<usize, SinkError> {
        let Some(indices) = self.by_object.get(&object) else {
            return Ok(0);
        };
        let mut written = 0;
        for &idx in indices {
            let binding = &self.bindings[idx];
            if let Some(row) = format_row(binding.property, now, event) {
                sinks.write_row(binding.sink_id, &row)?;
                self.rows[idx] += 1;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Records a physical-layer receive drop on `link`. Always active.
    pub fn record_drop(
        &mut self,
        now: SimTime,
        link: LinkId,
        sinks: &mut SinkRegistry,
    ) -> Result<(), SinkError> {
        self.drops += 1;
        tracing::debug!(%link, "RxDrop at {now}");
        sinks.write_named(&self.drop_sink, &format!("{now}\t{link}"))
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            bindings: self
                .bindings
                .iter()
                .zip(&self.rows)
                .map(|(b, rows)| BindingRecord {
                    path: b.path.to_string(),
                    property: b.property,
                    sink: b.sink.clone(),
                    rows: *rows,
                })
                .collect(),
            unmatched_patterns: self.unmatched.iter().map(|p| p.to_string()).collect(),
            skipped_optional: self.skipped_optional,
            phy_drops: self.drops,
        }
    }
}
