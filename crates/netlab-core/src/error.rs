//! Error taxonomy.
//!
//! Setup errors abort an experiment before (or, for trace activation, during)
//! the run. Degraded conditions are logged and never surface here, and
//! arithmetic edge cases are encoded in the sample types instead.

use crate::time::SimDuration;
use crate::topology::{LinkId, NodeId};
use crate::trace::{ObjectPath, Property};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("invalid delay {0}s: events cannot be scheduled in the past")]
    InvalidDelay(SimDuration),
    #[error("invalid period {0}s: repeating tasks need a positive period")]
    InvalidPeriod(SimDuration),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("unknown link {0}")]
    UnknownLink(LinkId),
    #[error("node {node} has no interface {index}")]
    UnknownInterface { node: NodeId, index: u32 },
    #[error("name {0:?} is already in use")]
    DuplicateName(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open sink {name:?}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write sink {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("mandatory property {property} is not exposed by {path}")]
    MissingProperty { path: ObjectPath, property: Property },
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("unknown node {0:?}")]
    UnknownNode(String),
    #[error("unknown link {0:?}")]
    UnknownLink(String),
    #[error("unknown application {0:?}")]
    UnknownApp(String),
    #[error("unknown transport variant {0:?}")]
    UnknownProtocol(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Any failure that aborts an experiment.
#[derive(Debug, Error)]
pub enum NetlabError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
