//! The flow assignment engine.
//!
//! Distributes an origin–destination demand matrix over the road network so
//! that, approximately, no traveller can reduce their travel time by switching
//! routes (Wardrop's first principle). The engine first loads demand
//! incrementally in batches, re-costing the network between batches, then
//! refines the result with successive-averages iterations until the relative
//! gap falls below the configured tolerance.

pub use shortest_path::Route;
pub(crate) use shortest_path::PathTree;

use crate::config::AssignmentConfig;
use crate::cost::{edge_cost, graph_costs, EdgeCost, EdgeState};
use crate::demand::{OdDemand, ZoneId};
use crate::{EdgeMap, NodeId, RoadGraph};
use itertools::Itertools;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

mod shortest_path;

/// The result of one assignment run.
#[derive(Clone, Debug)]
pub struct AssignmentResult {
    /// The graph version the run was computed against.
    pub graph_version: u64,
    /// The graph topology version the run was computed against.
    pub topology_version: u64,
    /// Assigned volume per edge, in veh/h.
    pub volumes: EdgeMap<f64>,
    /// Cost of every edge at the assigned volumes.
    pub costs: EdgeMap<EdgeCost>,
    /// Whether the relative gap fell below the tolerance.
    pub converged: bool,
    /// The relative gap of the returned volumes.
    pub relative_gap: f64,
    /// The relative gap observed at each refinement iteration.
    pub gap_history: Vec<f64>,
    /// Number of refinement iterations performed.
    pub iterations: usize,
    /// Demand that could not be assigned.
    pub unrouted: Vec<UnroutedDemand>,
    /// Total system travel time, in veh·h/h.
    pub total_travel_time: f64,
}

/// Demand between an OD pair that could not be routed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnroutedDemand {
    pub origin: ZoneId,
    pub destination: ZoneId,
    /// Trip rate in trips/h.
    pub rate: f64,
    pub reason: UnroutedReason,
}

/// Why demand could not be routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnroutedReason {
    /// No passable path connects the zones.
    NoPath,
    /// A zone is not bound to any node of the graph.
    UnboundZone,
}

/// The run was cancelled before it finished.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("assignment cancelled")]
pub struct Cancelled;

/// A resolved OD pair.
struct Trip {
    zones: (ZoneId, ZoneId),
    origin: NodeId,
    destination: NodeId,
    rate: f64,
}

/// Runs incremental and successive-averages assignment over a graph.
pub struct AssignmentEngine<'a> {
    graph: &'a RoadGraph,
    config: &'a AssignmentConfig,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> AssignmentEngine<'a> {
    /// Creates an engine for the given graph.
    pub fn new(graph: &'a RoadGraph, config: &'a AssignmentConfig) -> Self {
        Self {
            graph,
            config,
            cancel: None,
        }
    }

    /// Polls `flag` between shortest path searches and stops when it is set.
    pub fn with_cancellation(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Assigns the demand to the network.
    pub fn run(&self, demand: &OdDemand) -> Result<AssignmentResult, Cancelled> {
        let (trips, mut unrouted) = self.resolve(demand);
        let batches = self.config.batches.max(1);

        // Incremental loading
        let mut volumes = self.zero_volumes();
        let mut reachable = vec![true; trips.len()];
        for batch in 0..batches {
            let costs = graph_costs(self.graph, &volumes);
            let share = 1.0 / batches as f64;
            let loaded = self.all_or_nothing(&trips, &costs, share, &mut reachable)?;
            for (id, volume) in loaded {
                volumes[id] += volume;
            }
            log::trace!("assignment batch {}/{} loaded", batch + 1, batches);
        }
        for (trip, _) in trips.iter().zip(&reachable).filter(|(_, r)| !**r) {
            unrouted.push(UnroutedDemand {
                origin: trip.zones.0,
                destination: trip.zones.1,
                rate: trip.rate,
                reason: UnroutedReason::NoPath,
            });
        }

        // Successive averages refinement
        let mut best = (f64::INFINITY, volumes.clone());
        let mut gap_history = vec![];
        let mut converged = false;
        let mut iterations = 0;
        for iteration in 1..=self.config.max_iterations.max(1) {
            let costs = graph_costs(self.graph, &volumes);
            let target = self.all_or_nothing(&trips, &costs, 1.0, &mut reachable)?;
            let gap = relative_gap(&volumes, &target, &costs);
            gap_history.push(gap);
            iterations = iteration;

            if gap < best.0 {
                best = (gap, volumes.clone());
            }
            if gap < self.config.gap_tolerance {
                converged = true;
                break;
            }
            if iteration == self.config.max_iterations {
                break;
            }

            let step = 2.0 / (iteration as f64 + 2.0);
            for (id, volume) in volumes.iter_mut() {
                let aon = target.get(id).copied().unwrap_or(0.0);
                *volume += step * (aon - *volume);
            }
        }

        let (relative_gap, volumes) = best;
        if !converged {
            log::warn!(
                "assignment stopped after {} iterations with relative gap {:.4}",
                iterations,
                relative_gap
            );
        }
        Ok(self.finish(volumes, relative_gap, gap_history, iterations, converged, unrouted))
    }

    /// Resolves zones to nodes, reporting pairs with unbound zones.
    fn resolve(&self, demand: &OdDemand) -> (Vec<Trip>, Vec<UnroutedDemand>) {
        let mut trips = vec![];
        let mut unrouted = vec![];
        for (o, d, rate) in demand.iter() {
            match (self.graph.zone_node(o), self.graph.zone_node(d)) {
                (Some(origin), Some(destination)) => trips.push(Trip {
                    zones: (o, d),
                    origin,
                    destination,
                    rate,
                }),
                _ => unrouted.push(UnroutedDemand {
                    origin: o,
                    destination: d,
                    rate,
                    reason: UnroutedReason::UnboundZone,
                }),
            }
        }
        trips.sort_by_key(|t| (t.origin, t.destination, t.zones));
        (trips, unrouted)
    }

    /// Loads `share` of every trip onto its least-cost route.
    /// Trips found unreachable are flagged in `reachable` and skipped thereafter.
    fn all_or_nothing(
        &self,
        trips: &[Trip],
        costs: &EdgeMap<f64>,
        share: f64,
        reachable: &mut [bool],
    ) -> Result<EdgeMap<f64>, Cancelled> {
        let mut loaded = self.zero_volumes();
        let by_origin = trips
            .iter()
            .zip(reachable.iter_mut())
            .group_by(|(trip, _)| trip.origin);

        for (origin, group) in &by_origin {
            self.check_cancelled()?;
            let tree = PathTree::build(self.graph, origin, costs);
            for (trip, reachable) in group.filter(|(_, r)| **r) {
                match tree.route_to(self.graph, trip.destination, costs) {
                    Some(route) => {
                        for id in route {
                            loaded[id] += share * trip.rate;
                        }
                    }
                    None => *reachable = false,
                }
            }
        }
        Ok(loaded)
    }

    fn check_cancelled(&self) -> Result<(), Cancelled> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Cancelled),
            _ => Ok(()),
        }
    }

    fn zero_volumes(&self) -> EdgeMap<f64> {
        self.graph.edges().map(|e| (e.id(), 0.0)).collect()
    }

    fn finish(
        &self,
        volumes: EdgeMap<f64>,
        relative_gap: f64,
        gap_history: Vec<f64>,
        iterations: usize,
        converged: bool,
        unrouted: Vec<UnroutedDemand>,
    ) -> AssignmentResult {
        let costs: EdgeMap<EdgeCost> = self
            .graph
            .edges()
            .map(|edge| {
                let volume = volumes.get(edge.id()).copied().unwrap_or(0.0);
                (edge.id(), edge_cost(&EdgeState::of(edge, volume)))
            })
            .collect();
        let total_travel_time = volumes
            .iter()
            .filter_map(|(id, v)| costs.get(id).filter(|c| c.passable).map(|c| v * c.cost))
            .sum::<f64>()
            / 3600.0;

        AssignmentResult {
            graph_version: self.graph.version(),
            topology_version: self.graph.topology_version(),
            volumes,
            costs,
            converged,
            relative_gap,
            gap_history,
            iterations,
            unrouted,
            total_travel_time,
        }
    }
}

impl AssignmentResult {
    /// Total unrouted trip rate, in trips/h.
    pub fn unrouted_total(&self) -> f64 {
        self.unrouted.iter().map(|u| u.rate).sum()
    }

    /// The assigned volume on an edge, in veh/h.
    pub fn volume(&self, id: crate::EdgeId) -> f64 {
        self.volumes.get(id).copied().unwrap_or(0.0)
    }
}

/// The relative gap between the current volumes and the all-or-nothing target:
/// `(sum(x * c) - sum(y * c)) / sum(x * c)`.
fn relative_gap(current: &EdgeMap<f64>, target: &EdgeMap<f64>, costs: &EdgeMap<f64>) -> f64 {
    let mut total = 0.0;
    let mut shortest = 0.0;
    for (id, cost) in costs.iter().filter(|(_, c)| c.is_finite()) {
        total += current.get(id).copied().unwrap_or(0.0) * cost;
        shortest += target.get(id).copied().unwrap_or(0.0) * cost;
    }
    if total <= 0.0 {
        0.0
    } else {
        ((total - shortest) / total).max(0.0)
    }
}
