use crate::demand::ZoneId;
use crate::{EdgeId, NodeId};
use thiserror::Error;

/// A malformed road graph, rejected at ingestion.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("edge would connect node {0:?} to itself")]
    SelfLoop(NodeId),

    #[error("edge references unknown node {0:?}")]
    DanglingNode(NodeId),

    #[error("node {0:?} has no incident edges")]
    IsolatedNode(NodeId),

    #[error("edge length must be positive and finite, got {0}")]
    InvalidLength(f64),

    #[error("edge must have at least one lane")]
    NoLanes,

    #[error("free-flow speed must be positive and finite, got {0}")]
    InvalidSpeed(f64),

    #[error("unknown edge {0:?}")]
    UnknownEdge(EdgeId),

    #[error("zone {zone:?} is bound to unknown node {node:?}")]
    UnknownZoneNode { zone: ZoneId, node: NodeId },
}

/// An invalid configuration value.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the traffic engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("assignment worker is no longer running")]
    WorkerDisconnected,

    #[error("failed to start assignment worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
