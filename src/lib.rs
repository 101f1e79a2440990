pub mod cluster;
pub mod config;
pub mod error;
pub mod log;
pub mod protocol;
pub mod raft;
pub mod resource;
pub mod shutdown;
pub mod transport;

/// Identifier of a cluster member.
pub type MemberId = u64;

pub use cluster::LocalCluster;
pub use config::NodeConfig;
pub use error::{ConsensusError, Result, TransportError};
pub use log::{Log, LogEntry, MemoryLog};
pub use protocol::Consistency;
pub use raft::{NodeHandle, NodeStatus, RaftNode, RaftRole};
pub use transport::{LocalNetwork, Transport};
