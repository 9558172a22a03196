//! Level of detail control.
//!
//! Every edge runs at exactly one [SimulationTier], chosen from its distance to
//! the viewpoint. Each tier boundary has a hysteresis band: an edge enters the
//! nearer tier only once it is inside the band, and leaves it only once it is
//! beyond the band.

use crate::config::LodConfig;
use crate::math::{distance_to_segment, Point2d};
use crate::propagator::CongestionCell;
use crate::util::Interval;
use crate::{EdgeId, EdgeMap, RoadGraph};
use serde::Serialize;

/// The simulation resolution of an edge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SimulationTier {
    /// Occupancy only.
    #[default]
    Aggregate,
    /// Density, speed and queue length from the fundamental diagram.
    Simplified,
    /// Individual vehicles.
    Agent,
}

/// A change of tier on one edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierTransition {
    pub edge: EdgeId,
    pub from: SimulationTier,
    pub to: SimulationTier,
}

impl TierTransition {
    /// Whether vehicles must be spawned for this transition.
    pub fn enters_agent(&self) -> bool {
        self.to == SimulationTier::Agent && self.from != SimulationTier::Agent
    }

    /// Whether vehicles must be folded back for this transition.
    pub fn leaves_agent(&self) -> bool {
        self.from == SimulationTier::Agent && self.to != SimulationTier::Agent
    }
}

/// The state of a Simplified-tier edge, read off a triangular fundamental diagram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SimplifiedState {
    /// Density in veh/m/lane.
    pub density: f64,
    /// Space-mean speed in m/s.
    pub speed: f64,
    /// Flow in veh/h.
    pub flow: f64,
    /// Length of the queue at the downstream end, in m.
    pub queue_length: f64,
}

impl SimplifiedState {
    /// Evaluates the fundamental diagram for a cell.
    ///
    /// Below the critical density traffic runs at free-flow speed. Above it,
    /// the excess vehicles form a queue at jam density at the head of the edge.
    pub fn of(cell: &CongestionCell) -> Self {
        let lanes = cell.lanes().max(1) as f64;
        let length = cell.length();
        let density = cell.density().max(0.0);
        let jam = cell.max_occupancy() / (length * lanes);
        let critical = (cell.max_flow() / lanes / cell.free_flow_speed()).min(jam);

        let speed = if density <= critical {
            cell.free_flow_speed()
        } else if density < jam {
            cell.wave_speed() * (jam - density) / density
        } else {
            0.0
        };
        let queue_length = if density <= critical || jam <= critical {
            0.0
        } else {
            ((density - critical) * length / (jam - critical)).clamp(0.0, length)
        };
        Self {
            density,
            speed,
            flow: density * speed * lanes * 3600.0,
            queue_length,
        }
    }
}

/// Assigns a tier to every edge and reports changes.
#[derive(Clone, Debug)]
pub struct LodController {
    agent_band: Interval<f64>,
    simplified_band: Interval<f64>,
    tiers: EdgeMap<SimulationTier>,
    viewpoint: Option<Point2d>,
    transitions: u64,
}

impl LodController {
    /// Creates a controller with every edge of the graph in the aggregate tier.
    pub fn new(graph: &RoadGraph, config: &LodConfig) -> Self {
        Self {
            agent_band: config.agent_band(),
            simplified_band: config.simplified_band(),
            tiers: graph
                .edges()
                .map(|edge| (edge.id(), SimulationTier::Aggregate))
                .collect(),
            viewpoint: None,
            transitions: 0,
        }
    }

    /// Sets the observer position. Without one, every edge is aggregate.
    pub fn set_viewpoint(&mut self, viewpoint: Option<Point2d>) {
        self.viewpoint = viewpoint;
    }

    pub fn viewpoint(&self) -> Option<Point2d> {
        self.viewpoint
    }

    /// Tracks edges added to or removed from the graph.
    /// New edges start aggregate. Returns the removed edges and their last tier.
    pub fn sync(&mut self, graph: &RoadGraph) -> Vec<(EdgeId, SimulationTier)> {
        let removed: Vec<_> = self
            .tiers
            .iter()
            .filter(|(id, _)| graph.edge(*id).is_none())
            .map(|(id, tier)| (id, *tier))
            .collect();
        for (id, _) in &removed {
            self.tiers.remove(*id);
        }
        for edge in graph.edges() {
            if !self.tiers.contains_key(edge.id()) {
                self.tiers.insert(edge.id(), SimulationTier::Aggregate);
            }
        }
        removed
    }

    /// Re-evaluates every edge against the viewpoint, in edge ID order.
    pub fn update(&mut self, graph: &RoadGraph) -> Vec<TierTransition> {
        let mut transitions = vec![];
        for (id, tier) in self.tiers.iter_mut() {
            let distance = match (self.viewpoint, graph.edge_endpoints(id)) {
                (Some(view), Some((a, b))) => distance_to_segment(view, a, b),
                _ => f64::INFINITY,
            };
            let next = classify(self.agent_band, self.simplified_band, *tier, distance);
            if next != *tier {
                transitions.push(TierTransition {
                    edge: id,
                    from: *tier,
                    to: next,
                });
                *tier = next;
            }
        }
        self.transitions += transitions.len() as u64;
        transitions
    }

    /// The tier of an edge.
    pub fn tier(&self, edge: EdgeId) -> Option<SimulationTier> {
        self.tiers.get(edge).copied()
    }

    /// Iterates over every edge and its tier.
    pub fn tiers(&self) -> impl Iterator<Item = (EdgeId, SimulationTier)> + '_ {
        self.tiers.iter().map(|(id, tier)| (id, *tier))
    }

    /// The edges in a tier.
    pub fn edges_in(&self, tier: SimulationTier) -> impl Iterator<Item = EdgeId> + '_ {
        self.tiers().filter(move |(_, t)| *t == tier).map(|(id, _)| id)
    }

    /// The number of edges in a tier.
    pub fn count(&self, tier: SimulationTier) -> usize {
        self.edges_in(tier).count()
    }

    /// Total number of transitions since creation.
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }
}

fn classify(
    agent: Interval<f64>,
    simplified: Interval<f64>,
    current: SimulationTier,
    distance: f64,
) -> SimulationTier {
    use SimulationTier::*;
    let within = |band: Interval<f64>, inside: bool| {
        if inside {
            distance <= band.max
        } else {
            distance < band.min
        }
    };
    if within(agent, current == Agent) {
        Agent
    } else if within(simplified, current != Aggregate) {
        Simplified
    } else {
        Aggregate
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PropagatorConfig;
    use crate::network::{EdgeAttributes, IntersectionControl, NodeAttributes, RoadClass};
    use crate::propagator::CongestionPropagator;
    use assert_approx_eq::assert_approx_eq;
    use SimulationTier::*;

    fn graph() -> (RoadGraph, EdgeId) {
        let mut graph = RoadGraph::new();
        let a = graph.add_node(&NodeAttributes {
            position: Point2d::new(0.0, 0.0),
            control: IntersectionControl::GradeSeparated,
        });
        let b = graph.add_node(&NodeAttributes {
            position: Point2d::new(100.0, 0.0),
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

    #[test]
    fn classify_with_hysteresis() {
        let config = LodConfig::default();
        let (agent, simplified) = (config.agent_band(), config.simplified_band());
        let cases = [
            (Aggregate, 1000.0, Aggregate),
            (Aggregate, 790.0, Aggregate),
            (Aggregate, 770.0, Simplified),
            (Aggregate, 100.0, Agent),
            (Simplified, 820.0, Simplified),
            (Simplified, 830.0, Aggregate),
            (Simplified, 280.0, Simplified),
            (Simplified, 270.0, Agent),
            (Agent, 320.0, Agent),
            (Agent, 330.0, Simplified),
            (Agent, 900.0, Aggregate),
        ];
        for (current, distance, expected) in cases {
            assert_eq!(
                classify(agent, simplified, current, distance),
                expected,
                "{:?} at {}",
                current,
                distance
            );
        }
    }

    #[test]
    fn no_viewpoint_means_aggregate() {
        let (graph, e) = graph();
        let mut lod = LodController::new(&graph, &LodConfig::default());
        assert!(lod.update(&graph).is_empty());
        assert_eq!(lod.tier(e), Some(Aggregate));
    }

    #[test]
    fn oscillating_viewpoint_transitions_once() {
        let (graph, e) = graph();
        let mut lod = LodController::new(&graph, &LodConfig::default());
        let mut transitions = 0;
        for i in 0..100 {
            // The edge lies on y = 0, so distance is |y|
            let y = if i % 2 == 0 { 290.0 } else { 310.0 };
            lod.set_viewpoint(Some(Point2d::new(50.0, y)));
            transitions += lod.update(&graph).len();
        }
        assert_eq!(transitions, 1);
        assert_eq!(lod.tier(e), Some(Simplified));
    }

    #[test]
    fn sync_tracks_graph_edits() {
        let (mut graph, e) = graph();
        let mut lod = LodController::new(&graph, &LodConfig::default());
        lod.set_viewpoint(Some(Point2d::new(50.0, 0.0)));
        assert_eq!(lod.update(&graph).len(), 1);
        assert_eq!(lod.tier(e), Some(Agent));

        graph.remove_edge(e).unwrap();
        assert_eq!(lod.sync(&graph), vec![(e, Agent)]);
        assert_eq!(lod.tier(e), None);
        assert_eq!(lod.tiers().count(), 0);
    }

    #[test]
    fn simplified_state_follows_fundamental_diagram() {
        let (graph, e) = graph();
        let mut prop = CongestionPropagator::new(&graph, &PropagatorConfig::default());

        let free = SimplifiedState::of(prop.cell(e).unwrap());
        assert_eq!(free.density, 0.0);
        assert_eq!(free.queue_length, 0.0);
        assert_approx_eq!(free.speed, 13.9);

        // Seed far over capacity so the edge jams
        let volumes: EdgeMap<f64> = [(e, 1.0e6)].into_iter().collect();
        prop.seed(&graph, &volumes);
        let jammed = SimplifiedState::of(prop.cell(e).unwrap());
        assert_approx_eq!(jammed.density, 1.0 / 7.5);
        assert_eq!(jammed.speed, 0.0);
        assert_approx_eq!(jammed.queue_length, 100.0);
    }
}
