//! Mesh agent state
//!
//! Durable storage for this device's network memberships (interfaces), their
//! peer snapshots, and the reconciliation log recording attempts to apply
//! them to the tunnel layer.

pub mod config;
pub mod model;
pub mod store;

pub use config::AgentConfig;
pub use model::{Interface, InterfaceLog, InterfaceWithLog, Operation, State};
pub use store::{Store, StoreTx};
