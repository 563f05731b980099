//! Discrete-event experiment orchestration.
//!
//! Schedules timed topology mutations, samples per-flow counters into
//! throughput/loss/delay/jitter statistics, and multiplexes protocol trace
//! events into named sinks. The transport stack, routing and traffic
//! generators are external collaborators behind the traits in [`collab`].

pub mod collab;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod flow;
pub mod report;
pub mod scenario;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod time;
pub mod topology;
pub mod trace;

pub use config::ExperimentConfig;
pub use driver::Experiment;
pub use error::NetlabError;
pub use report::ExperimentReport;
pub use time::{SimDuration, SimTime};
