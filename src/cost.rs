//! The network cost model: BPR travel time as a function of congestion.

pub use los::LevelOfService;

use crate::network::{Edge, RoadClass};
use crate::{EdgeMap, RoadGraph};

mod los;

/// The inputs to the cost model for a single edge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeState {
    /// Travel time at free flow in s.
    pub free_flow_time: f64,
    /// Current volume in veh/h.
    pub volume: f64,
    /// Effective capacity in veh/h.
    pub capacity: f64,
    /// Selects the BPR calibration.
    pub class: RoadClass,
}

/// The travel cost of an edge and its congestion classification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeCost {
    /// Travel time in s; infinite if the edge is impassable.
    pub cost: f64,
    /// Volume-to-capacity ratio.
    pub vc_ratio: f64,
    pub los: LevelOfService,
    /// `cost` relative to free flow.
    pub multiplier: f64,
    /// Whether routing may use the edge.
    pub passable: bool,
}

impl EdgeState {
    /// Builds the cost model inputs for an edge carrying `volume` veh/h.
    pub fn of(edge: &Edge, volume: f64) -> Self {
        Self {
            free_flow_time: edge.free_flow_time(),
            volume,
            capacity: edge.effective_capacity(),
            class: edge.class(),
        }
    }

    /// Evaluates the cost model.
    pub fn cost(&self) -> EdgeCost {
        edge_cost(self)
    }
}

impl EdgeCost {
    /// The cost of an edge that cannot be traversed.
    pub const IMPASSABLE: EdgeCost = EdgeCost {
        cost: f64::INFINITY,
        vc_ratio: f64::INFINITY,
        los: LevelOfService::F,
        multiplier: f64::INFINITY,
        passable: false,
    };
}

/// The Bureau of Public Roads travel time function.
///
/// `t0 * (1 + alpha * (volume / capacity)^beta)`
pub fn bpr(free_flow_time: f64, volume: f64, capacity: f64, alpha: f64, beta: f64) -> f64 {
    let vc = volume.max(0.0) / capacity;
    free_flow_time * (1.0 + alpha * vc.powf(beta))
}

/// Evaluates the cost of an edge using its road class calibration.
pub fn edge_cost(state: &EdgeState) -> EdgeCost {
    if !(state.capacity > 0.0) {
        return EdgeCost::IMPASSABLE;
    }
    let params = state.class.params();
    let volume = state.volume.max(0.0);
    let vc_ratio = volume / state.capacity;
    let cost = bpr(
        state.free_flow_time,
        volume,
        state.capacity,
        params.alpha,
        params.beta,
    );
    EdgeCost {
        cost,
        vc_ratio,
        los: LevelOfService::from_vc_ratio(vc_ratio),
        multiplier: cost / state.free_flow_time,
        passable: true,
    }
}

/// Evaluates every edge of the graph at the given volumes (missing volumes are zero).
pub(crate) fn graph_costs(graph: &RoadGraph, volumes: &EdgeMap<f64>) -> EdgeMap<f64> {
    graph
        .edges()
        .map(|edge| {
            let volume = volumes.get(edge.id()).copied().unwrap_or(0.0);
            (edge.id(), edge_cost(&EdgeState::of(edge, volume)).cost)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn state(class: RoadClass, volume: f64, capacity: f64) -> EdgeState {
        EdgeState {
            free_flow_time: 60.0,
            volume,
            capacity,
            class,
        }
    }

    #[test]
    fn free_flow_at_zero_volume() {
        let cost = state(RoadClass::Avenue, 0.0, 1800.0).cost();
        assert_eq!(cost.cost, 60.0);
        assert_eq!(cost.multiplier, 1.0);
        assert_eq!(cost.los, LevelOfService::A);
    }

    #[test]
    fn at_capacity_adds_alpha() {
        let cost = state(RoadClass::Highway, 4000.0, 4000.0).cost();
        assert_approx_eq!(cost.cost, 60.0 * 1.15);
        assert_eq!(cost.los, LevelOfService::F);
    }

    #[test]
    fn cost_is_monotone_in_vc() {
        for class in RoadClass::ALL {
            let mut last = 0.0;
            for step in 0..=300 {
                let vc = step as f64 * 0.01;
                let cost = state(class, vc * 1000.0, 1000.0).cost().cost;
                assert!(cost >= last, "{:?} not monotone at v/c {}", class, vc);
                last = cost;
            }
        }
    }

    #[test]
    fn highway_breaks_down_more_sharply() {
        let below = |class| state(class, 700.0, 1000.0).cost().multiplier;
        let above = |class| state(class, 1300.0, 1000.0).cost().multiplier;
        let highway = above(RoadClass::Highway) / below(RoadClass::Highway);
        let local = above(RoadClass::Local) / below(RoadClass::Local);
        assert!(below(RoadClass::Highway) < below(RoadClass::Local));
        assert!(highway > local);
    }

    #[test]
    fn non_positive_capacity_is_impassable() {
        for capacity in [0.0, -10.0, f64::NAN] {
            let cost = state(RoadClass::Local, 100.0, capacity).cost();
            assert!(!cost.passable);
            assert!(cost.cost.is_infinite());
        }
    }
}
