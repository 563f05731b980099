//! Synthetic collaborators for running netlab experiments end to end:
//! shortest-hop routing, bulk and on/off traffic generators, and a fluid
//! transport stack that produces flow counters and protocol trace events.

pub mod apps;
pub mod fluid;
pub mod routing;

use netlab_core::collab::Collaborators;
use netlab_core::error::ConfigError;
use netlab_core::ExperimentConfig;

pub use apps::{BulkSend, OnOffApp, PacketSink};
pub use fluid::{FluidConfig, FluidStack, Variant};
pub use routing::GlobalRouting;

/// Builds the full collaborator set for `config`.
pub fn collaborators(config: &ExperimentConfig) -> Result<Collaborators, ConfigError> {
    Ok(Collaborators {
        routing: Box::new(GlobalRouting::new()),
        stack: Box::new(FluidStack::for_experiment(config)?),
        apps: apps::build_apps(config)?,
    })
}
