pub use cgmath;
pub use assignment::{AssignmentEngine, AssignmentResult, UnroutedDemand, UnroutedReason};
pub use config::EngineConfig;
pub use cost::{bpr, edge_cost, EdgeCost, EdgeState, LevelOfService};
pub use demand::{OdDemand, ZoneId};
pub use error::{ConfigError, Error, Result, TopologyError};
pub use lod::{LodController, SimplifiedState, SimulationTier, TierTransition};
pub use micro::{AgentMicroModel, FoldBack, VehicleAgent};
pub use network::{
    Edge, EdgeAttributes, EdgeModification, GraphEdit, IntersectionControl, Node, NodeAttributes,
    RoadClass, RoadGraph,
};
pub use propagator::{CongestionCell, CongestionPropagator};
pub use simulation::{EdgeOverlay, Simulation, SimulationStats, VehicleRender};
pub use slotmap::{Key, KeyData};
pub use snapshot::{SnapshotHandle, TrafficSnapshot, TrafficVolume};
pub use util::Interval;

pub mod assignment;
pub mod config;
pub mod cost;
pub mod demand;
mod error;
pub mod lod;
pub mod math;
pub mod micro;
pub mod network;
pub mod propagator;
mod simulation;
pub mod snapshot;
mod util;
mod worker;

use slotmap::{new_key_type, SecondaryMap, SlotMap};

new_key_type! {
    /// Unique ID of an intersection [Node].
    pub struct NodeId;
    /// Unique ID of a directed road [Edge].
    pub struct EdgeId;
    /// Unique ID of a [VehicleAgent].
    pub struct VehicleId;
}

type NodeSet = SlotMap<NodeId, Node>;
type EdgeSet = SlotMap<EdgeId, Edge>;

/// Per-edge derived state, keyed by the edge arena.
pub type EdgeMap<T> = SecondaryMap<EdgeId, T>;
