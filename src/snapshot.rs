//! Published assignment results.
//!
//! A [TrafficSnapshot] is immutable once published. The orchestrator swaps in
//! a new one whenever the background assignment finishes, and routing callers
//! holding a [SnapshotHandle] always observe a complete snapshot.

use crate::assignment::{AssignmentResult, PathTree, Route, UnroutedDemand};
use crate::cost::{edge_cost, EdgeCost, EdgeState, LevelOfService};
use crate::{EdgeId, EdgeMap, NodeId, RoadGraph};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// The published traffic state of one edge.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrafficVolume {
    /// Smoothed flow in veh/h.
    pub volume: f64,
    /// Volume-to-capacity ratio.
    pub vc_ratio: f64,
    pub los: LevelOfService,
    /// Travel time relative to free flow.
    pub cost_multiplier: f64,
    /// Travel time in s.
    pub cost: f64,
}

/// An immutable, versioned set of edge volumes and costs.
#[derive(Clone, Debug, Default)]
pub struct TrafficSnapshot {
    /// Publication sequence number; zero before the first assignment.
    seq: u64,
    /// The graph version the volumes were assigned on.
    graph_version: u64,
    /// Simulated time of publication, in s.
    published_at: f64,
    volumes: EdgeMap<TrafficVolume>,
    converged: bool,
    relative_gap: f64,
    unrouted: Vec<UnroutedDemand>,
}

impl TrafficVolume {
    fn new(volume: f64, cost: EdgeCost) -> Self {
        Self {
            volume,
            vc_ratio: cost.vc_ratio,
            los: cost.los,
            cost_multiplier: cost.multiplier,
            cost: cost.cost,
        }
    }
}

impl TrafficSnapshot {
    /// A free-flow snapshot of the graph, used before any assignment completes.
    pub fn empty(graph: &RoadGraph) -> Self {
        let volumes = graph
            .edges()
            .map(|edge| {
                let cost = edge_cost(&EdgeState::of(edge, 0.0));
                (edge.id(), TrafficVolume::new(0.0, cost))
            })
            .collect();
        Self {
            graph_version: graph.version(),
            converged: true,
            volumes,
            ..Default::default()
        }
    }

    /// Builds the snapshot to publish from an assignment result.
    ///
    /// Volumes are blended with those of `previous` using `smoothing` as the
    /// weight of the new result, then re-costed against the current graph.
    /// Edges that no longer exist are dropped.
    pub fn from_result(
        seq: u64,
        result: &AssignmentResult,
        previous: Option<&TrafficSnapshot>,
        smoothing: f64,
        published_at: f64,
        graph: &RoadGraph,
    ) -> Self {
        let smoothing = match previous {
            Some(p) if p.seq > 0 => smoothing,
            _ => 1.0,
        };
        let volumes = graph
            .edges()
            .map(|edge| {
                let assigned = result.volume(edge.id());
                let volume = match previous.and_then(|p| p.volumes.get(edge.id())) {
                    Some(prev) => smoothing * assigned + (1.0 - smoothing) * prev.volume,
                    None => assigned,
                };
                let cost = edge_cost(&EdgeState::of(edge, volume));
                (edge.id(), TrafficVolume::new(volume, cost))
            })
            .collect();
        Self {
            seq,
            graph_version: result.graph_version,
            published_at,
            volumes,
            converged: result.converged,
            relative_gap: result.relative_gap,
            unrouted: result.unrouted.clone(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn graph_version(&self) -> u64 {
        self.graph_version
    }

    pub fn published_at(&self) -> f64 {
        self.published_at
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn relative_gap(&self) -> f64 {
        self.relative_gap
    }

    /// Demand the assignment could not route.
    pub fn unrouted(&self) -> &[UnroutedDemand] {
        &self.unrouted
    }

    /// The published state of an edge.
    pub fn get(&self, edge: EdgeId) -> Option<&TrafficVolume> {
        self.volumes.get(edge)
    }

    /// Iterates over every edge's published state.
    pub fn iter(&self) -> impl Iterator<Item = (EdgeId, &TrafficVolume)> {
        self.volumes.iter()
    }

    /// The published volume of an edge in veh/h, zero if unknown.
    pub fn volume(&self, edge: EdgeId) -> f64 {
        self.volumes.get(edge).map_or(0.0, |v| v.volume)
    }

    /// Linearly interpolates volumes from `previous` to this snapshot.
    /// `t` is clamped to [0, 1]; edges unknown to `previous` take this snapshot's volume.
    pub fn interpolate(&self, previous: &TrafficSnapshot, t: f64) -> EdgeMap<f64> {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 1.0 };
        self.volumes
            .iter()
            .map(|(id, current)| {
                let volume = match previous.volumes.get(id) {
                    Some(prev) => prev.volume + t * (current.volume - prev.volume),
                    None => current.volume,
                };
                (id, volume)
            })
            .collect()
    }

    /// Routing costs for every edge of `graph`.
    ///
    /// Edges the snapshot does not know yet are costed at free flow, and edges
    /// that have become impassable since publication are excluded.
    pub fn routing_costs(&self, graph: &RoadGraph) -> EdgeMap<f64> {
        graph
            .edges()
            .map(|edge| {
                let cost = match self.volumes.get(edge.id()) {
                    _ if !edge.is_passable() => f64::INFINITY,
                    Some(v) => v.cost,
                    None => edge_cost(&EdgeState::of(edge, 0.0)).cost,
                };
                (edge.id(), cost)
            })
            .collect()
    }

    /// The least-cost route between two nodes at the published costs.
    pub fn route(&self, graph: &RoadGraph, from: NodeId, to: NodeId) -> Option<Route> {
        let costs = self.routing_costs(graph);
        PathTree::build(graph, from, &costs).route_to(graph, to, &costs)
    }
}

/// Shared read access to the latest published snapshot.
///
/// Cloning the handle is cheap; loads never observe a partially written snapshot.
#[derive(Clone, Debug, Default)]
pub struct SnapshotHandle(Arc<RwLock<Arc<TrafficSnapshot>>>);

impl SnapshotHandle {
    pub fn new(snapshot: TrafficSnapshot) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(snapshot))))
    }

    /// The latest published snapshot.
    pub fn load(&self) -> Arc<TrafficSnapshot> {
        self.0.read().clone()
    }

    /// Publishes a snapshot, returning the one it replaces.
    pub fn store(&self, snapshot: Arc<TrafficSnapshot>) -> Arc<TrafficSnapshot> {
        std::mem::replace(&mut *self.0.write(), snapshot)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::math::Point2d;
    use crate::network::{EdgeAttributes, IntersectionControl, NodeAttributes, RoadClass};
    use assert_approx_eq::assert_approx_eq;

    fn graph() -> (RoadGraph, EdgeId) {
        let mut graph = RoadGraph::new();
        let a = graph.add_node(&NodeAttributes {
            position: Point2d::new(0.0, 0.0),
            control: IntersectionControl::GradeSeparated,
        });
        let b = graph.add_node(&NodeAttributes {
            position: Point2d::new(400.0, 0.0),
            control: IntersectionControl::GradeSeparated,
        });
        let e = graph
            .add_edge(&EdgeAttributes {
                from: a,
                to: b,
                class: RoadClass::Avenue,
                lanes: 2,
                length: None,
                speed: None,
            })
            .unwrap();
        (graph, e)
    }

    fn result(graph: &RoadGraph, edge: EdgeId, volume: f64) -> AssignmentResult {
        let mut volumes = EdgeMap::new();
        volumes.insert(edge, volume);
        AssignmentResult {
            graph_version: graph.version(),
            topology_version: graph.topology_version(),
            volumes,
            costs: EdgeMap::new(),
            converged: true,
            relative_gap: 0.0,
            gap_history: vec![0.0],
            iterations: 1,
            unrouted: vec![],
            total_travel_time: 0.0,
        }
    }

    #[test]
    fn empty_snapshot_is_free_flow() {
        let (graph, e) = graph();
        let snapshot = TrafficSnapshot::empty(&graph);
        let v = snapshot.get(e).unwrap();
        assert_eq!(v.volume, 0.0);
        assert_eq!(v.cost_multiplier, 1.0);
        assert_eq!(v.los, LevelOfService::A);
    }

    #[test]
    fn first_result_is_unsmoothed() {
        let (graph, e) = graph();
        let empty = TrafficSnapshot::empty(&graph);
        let first = result(&graph, e, 900.0);
        let snapshot = TrafficSnapshot::from_result(1, &first, Some(&empty), 0.5, 10.0, &graph);
        assert_eq!(snapshot.volume(e), 900.0);
        assert_approx_eq!(snapshot.get(e).unwrap().vc_ratio, 0.5);

        let second = result(&graph, e, 1500.0);
        let next = TrafficSnapshot::from_result(2, &second, Some(&snapshot), 0.5, 20.0, &graph);
        assert_eq!(next.volume(e), 1200.0);
    }

    #[test]
    fn interpolation_is_linear_and_clamped() {
        let (graph, e) = graph();
        let empty = TrafficSnapshot::empty(&graph);
        let snapshot =
            TrafficSnapshot::from_result(1, &result(&graph, e, 800.0), None, 1.0, 0.0, &graph);
        assert_eq!(snapshot.interpolate(&empty, 0.25)[e], 200.0);
        assert_eq!(snapshot.interpolate(&empty, 3.0)[e], 800.0);
        assert_eq!(snapshot.interpolate(&empty, -1.0)[e], 0.0);
    }

    #[test]
    fn handle_swaps_atomically() {
        let (graph, e) = graph();
        let handle = SnapshotHandle::new(TrafficSnapshot::empty(&graph));
        let reader = handle.clone();
        let assigned = result(&graph, e, 100.0);
        let next = TrafficSnapshot::from_result(1, &assigned, None, 1.0, 0.0, &graph);
        let old = handle.store(Arc::new(next));
        assert_eq!(old.seq(), 0);
        assert_eq!(reader.load().seq(), 1);
        assert_eq!(reader.load().volume(e), 100.0);
    }
}
