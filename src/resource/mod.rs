//! Typed state machines layered on a node's consumer.

pub mod registry;
pub mod state_log;

pub use registry::{Catalog, OperationKind, OperationTable};
pub use state_log::{StateLog, StateLogClient};
