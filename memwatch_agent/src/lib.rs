//! Library interface for memwatch_agent: samplers, aggregator, query facade
//! and HTTP routes. The binary wires them together.

pub mod aggregator;
pub mod api;
pub mod config;
pub mod error;
pub mod fleet;
pub mod history;
pub mod hotspots;
pub mod process;
pub mod query;
pub mod snapshot;
pub mod state;
pub mod system;
pub mod types;

pub use aggregator::{Aggregator, AggregatorConfig, Sources, TickPhase};
pub use error::AgentError;
pub use query::QueryFacade;
pub use snapshot::Snapshot;
