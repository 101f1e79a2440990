use thiserror::Error;

use crate::MemberId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<MemberId>),

    #[error("Failed to obtain quorum")]
    QuorumUnreachable,

    #[error("Replica {0} is not consistent with the leader log")]
    ConsistencyGap(MemberId),

    #[error("Application error: {0}")]
    Application(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Log error: {0}")]
    Log(String),

    #[error("Node is not open")]
    NotOpen,

    #[error("Node is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Delivery failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Member {0} is unreachable")]
    Unreachable(MemberId),

    #[error("Network partition between {from} and {to}")]
    Partitioned { from: MemberId, to: MemberId },

    #[error("Member {0} closed the connection")]
    Closed(MemberId),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
