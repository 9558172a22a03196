use crate::assignment::{AssignmentResult, Route};
use crate::config::EngineConfig;
use crate::cost::{edge_cost, EdgeCost, EdgeState, LevelOfService};
use crate::demand::{OdDemand, ZoneId};
use crate::error::Result;
use crate::lod::{LodController, SimplifiedState, SimulationTier, TierTransition};
use crate::math::{sample_segment, Point2d};
use crate::micro::AgentMicroModel;
use crate::network::{EditOutcome, GraphEdit};
use crate::propagator::CongestionPropagator;
use crate::snapshot::{SnapshotHandle, TrafficSnapshot};
use crate::worker::{AssignmentWorker, WorkerReply};
use crate::{EdgeId, EdgeMap, NodeId, RoadGraph, VehicleId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A traffic simulation.
///
/// Assignment runs on a background thread every `assignment_interval` seconds
/// of simulated time. Everything else advances synchronously in [Simulation::step].
pub struct Simulation {
    config: EngineConfig,
    /// The road network. Copied on write while the worker holds a reference.
    graph: Arc<RoadGraph>,
    demand: Arc<OdDemand>,
    /// Whether any demand has been supplied.
    has_demand: bool,
    worker: AssignmentWorker,
    /// The latest published snapshot.
    snapshot: SnapshotHandle,
    /// The snapshot published before it, interpolated from.
    previous: Arc<TrafficSnapshot>,
    /// Interpolated volumes used this tick, in veh/h.
    volumes: EdgeMap<f64>,
    propagator: CongestionPropagator,
    lod: LodController,
    micro: AgentMicroModel,
    /// Simulated time in s.
    time: f64,
    /// Simulated time of the last assignment submission.
    last_submit: Option<f64>,
    /// The current frame of simulation.
    tick: u64,
    /// Consecutive cycles each OD pair has been unrouted.
    unrouted: BTreeMap<(ZoneId, ZoneId), u32>,
    stats: SimulationStats,
}

/// Per-edge state for overlays.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EdgeOverlay {
    pub edge: EdgeId,
    /// Current volume in veh/h.
    pub volume: f64,
    pub vc_ratio: f64,
    pub los: LevelOfService,
    /// Vehicles on the edge.
    pub occupancy: f64,
    pub tier: SimulationTier,
    /// Present for edges in the simplified tier.
    pub simplified: Option<SimplifiedState>,
}

/// A vehicle to draw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VehicleRender {
    pub id: VehicleId,
    pub edge: EdgeId,
    pub lane: u8,
    pub cell: u32,
    /// World space position of the vehicle.
    pub position: Point2d,
    /// Speed in m/s.
    pub speed: f64,
}

/// Counters describing the simulation.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    pub tick: u64,
    pub time: f64,
    /// Assignments published.
    pub assignments_published: u64,
    /// Assignments cancelled by topology changes.
    pub assignments_cancelled: u64,
    /// Results discarded because the topology had changed.
    pub assignments_discarded: u64,
    /// Out-of-range occupancies clamped by the propagator.
    pub clamp_warnings: u64,
    /// Unrouted demand in the latest snapshot, in trips/h.
    pub unrouted_total: f64,
    /// OD pairs unrouted for longer than the retry limit.
    pub escalated_pairs: usize,
    /// Vehicles in the aggregate model.
    pub total_occupancy: f64,
    /// Vehicles waiting to enter the network.
    pub total_queued: f64,
    /// Vehicles simulated individually.
    pub agents: usize,
    /// Agents created by edges entering the agent tier.
    pub agents_spawned: u64,
    /// Agents removed by edges leaving the agent tier.
    pub agents_retired: u64,
    /// Edges in each tier, in the order aggregate, simplified, agent.
    pub tiers: [usize; 3],
    /// Worker failures since creation.
    pub worker_errors: u64,
}

impl Simulation {
    /// Creates a simulation of a validated road network.
    pub fn new(graph: RoadGraph, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        graph.validate()?;
        let snapshot = TrafficSnapshot::empty(&graph);
        let propagator = CongestionPropagator::new(&graph, &config.propagator);
        let lod = LodController::new(&graph, &config.lod);
        let micro = AgentMicroModel::new(&config.micro, config.propagator.jam_density);
        let worker = AssignmentWorker::spawn()?;
        log::info!(
            "created simulation with {} nodes and {} edges",
            graph.node_count(),
            graph.edge_count()
        );
        Ok(Self {
            previous: Arc::new(snapshot.clone()),
            snapshot: SnapshotHandle::new(snapshot),
            volumes: EdgeMap::new(),
            graph: Arc::new(graph),
            demand: Arc::new(OdDemand::new()),
            has_demand: false,
            worker,
            propagator,
            lod,
            micro,
            time: 0.0,
            last_submit: None,
            tick: 0,
            unrouted: BTreeMap::new(),
            stats: SimulationStats::default(),
            config,
        })
    }

    /// Supplies a new demand matrix, used from the next assignment cycle.
    /// The first demand triggers an assignment on the next tick.
    pub fn set_demand(&mut self, demand: OdDemand) {
        log::debug!(
            "demand updated: {} pairs, {:.0} trips/h",
            demand.len(),
            demand.total()
        );
        self.demand = Arc::new(demand);
        self.has_demand = true;
    }

    /// Sets the observer position, or `None` to run every edge in aggregate.
    pub fn set_viewpoint(&mut self, viewpoint: Option<Point2d>) {
        self.lod.set_viewpoint(viewpoint);
    }

    /// Applies an edit to the road network.
    ///
    /// Derived capacities are rebuilt. If nodes, edges or zones were added or
    /// removed, any assignment in flight is cancelled and restarted.
    pub fn apply_edit(&mut self, edit: &GraphEdit) -> Result<EditOutcome> {
        let outcome = Arc::make_mut(&mut self.graph).apply(edit)?;

        for (edge, tier) in self.lod.sync(&self.graph) {
            if tier == SimulationTier::Agent {
                self.fold_back(edge);
            }
        }
        self.propagator.rebuild(&self.graph);

        // Agent edges whose geometry changed are rebuilt from the aggregate
        let stale: Vec<EdgeId> = self
            .micro
            .edges()
            .filter(|id| self.graph.edge(*id).map_or(true, |e| self.micro.is_stale(e)))
            .collect();
        for id in stale {
            self.fold_back(id);
            self.spawn_agents(id);
        }

        if outcome.topology_changed && self.worker.is_busy() {
            self.worker.cancel_in_flight();
            self.stats.assignments_cancelled += 1;
            self.submit();
        }
        Ok(outcome)
    }

    /// Advances the simulation by `dt` seconds. Ticks that are not positive
    /// are ignored.
    pub fn step(&mut self, dt: f64) {
        if !(dt > 0.0) {
            return;
        }
        self.poll_worker();

        let interval = self.config.orchestrator.assignment_interval;
        let due = self
            .last_submit
            .map_or(true, |last| self.time >= last + interval);
        if self.has_demand && due && !self.worker.is_busy() {
            self.submit();
        }

        // Rates blend from the previous snapshot to the current one over one interval
        let current = self.snapshot.load();
        let alpha = (self.time - current.published_at()) / interval;
        self.volumes = current.interpolate(&self.previous, alpha);
        self.propagator.set_rates(&self.graph, &self.volumes);
        self.propagator.step(dt);

        for transition in self.lod.update(&self.graph) {
            self.apply_transition(&transition);
        }

        self.micro.record(&self.propagator);
        self.micro.advance(dt);

        self.time += dt;
        self.tick += 1;
    }

    /// Waits up to `timeout` for the in-flight assignment and publishes it.
    /// Returns whether a snapshot was published.
    pub fn drain_blocking(&mut self, timeout: Duration) -> Result<bool> {
        if !self.worker.is_busy() {
            return Ok(false);
        }
        match self.worker.recv_timeout(timeout)? {
            Some(reply) => Ok(self.handle_reply(reply)),
            None => Ok(false),
        }
    }

    fn submit(&mut self) {
        match self
            .worker
            .submit(self.graph.clone(), self.demand.clone(), &self.config.assignment)
        {
            Ok(_) => self.last_submit = Some(self.time),
            Err(err) => {
                log::error!("failed to submit assignment: {}", err);
                self.stats.worker_errors += 1;
            }
        }
    }

    fn poll_worker(&mut self) {
        loop {
            match self.worker.try_recv() {
                Ok(Some(reply)) => {
                    self.handle_reply(reply);
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!("{}", err);
                    self.stats.worker_errors += 1;
                    break;
                }
            }
        }
    }

    fn handle_reply(&mut self, reply: WorkerReply) -> bool {
        match reply {
            WorkerReply::Finished { result, .. } => self.publish(&result),
            WorkerReply::Cancelled { job } => {
                log::debug!("assignment job {} was cancelled", job);
                false
            }
        }
    }

    fn publish(&mut self, result: &AssignmentResult) -> bool {
        if result.topology_version != self.graph.topology_version() {
            log::debug!("discarding assignment computed on an outdated topology");
            self.stats.assignments_discarded += 1;
            return false;
        }
        let current = self.snapshot.load();
        let first = current.seq() == 0;
        let next = TrafficSnapshot::from_result(
            current.seq() + 1,
            result,
            Some(&*current),
            self.config.orchestrator.volume_smoothing,
            self.time,
            &self.graph,
        );
        let next = Arc::new(next);
        self.previous = self.snapshot.store(next.clone());
        if first {
            // Nothing to blend from, so start from the first result outright
            self.previous = next.clone();
            let volumes = next.interpolate(&next, 1.0);
            self.propagator.seed(&self.graph, &volumes);
        }
        self.stats.assignments_published += 1;
        self.track_unrouted(&next);

        log::info!(
            "published snapshot {} (gap {:.4}, {})",
            next.seq(),
            next.relative_gap(),
            if next.converged() { "converged" } else { "not converged" }
        );
        true
    }

    /// Counts how many consecutive cycles each OD pair has gone unrouted.
    fn track_unrouted(&mut self, snapshot: &TrafficSnapshot) {
        let limit = self.config.orchestrator.unrouted_retry_limit;
        let mut ledger = BTreeMap::new();
        for demand in snapshot.unrouted() {
            let key = (demand.origin, demand.destination);
            let cycles = self.unrouted.get(&key).copied().unwrap_or(0) + 1;
            if cycles == limit {
                log::warn!(
                    "demand from {:?} to {:?} ({:.1} trips/h) unrouted for {} cycles: {:?}",
                    demand.origin,
                    demand.destination,
                    demand.rate,
                    cycles,
                    demand.reason
                );
            }
            ledger.insert(key, cycles);
        }
        self.unrouted = ledger;
        self.stats.unrouted_total = snapshot.unrouted().iter().map(|u| u.rate).sum();
        self.stats.escalated_pairs = self.unrouted.values().filter(|c| **c >= limit).count();
        if self.stats.unrouted_total > 0.0 {
            log::info!(
                "{:.1} trips/h of demand unrouted over {} pairs",
                self.stats.unrouted_total,
                self.unrouted.len()
            );
        }
    }

    fn apply_transition(&mut self, transition: &TierTransition) {
        log::trace!(
            "edge {:?}: {:?} -> {:?}",
            transition.edge,
            transition.from,
            transition.to
        );
        if transition.leaves_agent() {
            self.fold_back(transition.edge);
        }
        if transition.enters_agent() {
            self.spawn_agents(transition.edge);
        }
    }

    fn spawn_agents(&mut self, id: EdgeId) {
        let (Some(edge), Some(cell)) = (self.graph.edge(id), self.propagator.cell(id)) else {
            return;
        };
        let flow = self.volumes.get(id).copied().unwrap_or(0.0);
        let speed = SimplifiedState::of(cell).speed;
        self.micro.spawn_edge(edge, cell, flow, speed);
    }

    fn fold_back(&mut self, id: EdgeId) {
        let occupancy = self.propagator.occupancy(id);
        if let Some(fold) = self.micro.retire_edge(id, occupancy) {
            if fold.unmaterialized.abs() > 1.0 {
                log::debug!(
                    "edge {:?} folded back {} agents against {:.1} aggregate vehicles",
                    id,
                    fold.agents,
                    occupancy
                );
            }
        }
    }

    /// The road network.
    pub fn graph(&self) -> &RoadGraph {
        &self.graph
    }

    /// The demand matrix in use.
    pub fn demand(&self) -> &OdDemand {
        &self.demand
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<TrafficSnapshot> {
        self.snapshot.load()
    }

    /// A handle to the published snapshots, for routing callers on other threads.
    pub fn snapshot_handle(&self) -> SnapshotHandle {
        self.snapshot.clone()
    }

    /// The current cost of an edge, at the interpolated volume.
    pub fn edge_cost(&self, id: EdgeId) -> Option<EdgeCost> {
        let edge = self.graph.edge(id)?;
        let volume = self
            .volumes
            .get(id)
            .copied()
            .unwrap_or_else(|| self.snapshot.load().volume(id));
        Some(edge_cost(&EdgeState::of(edge, volume)))
    }

    /// The least-cost route between two nodes at the published costs.
    pub fn route(&self, from: NodeId, to: NodeId) -> Option<Route> {
        self.snapshot.load().route(&self.graph, from, to)
    }

    /// The tier of an edge.
    pub fn tier(&self, id: EdgeId) -> Option<SimulationTier> {
        self.lod.tier(id)
    }

    /// The propagator's state.
    pub fn propagator(&self) -> &CongestionPropagator {
        &self.propagator
    }

    /// The micro-model's state.
    pub fn micro(&self) -> &AgentMicroModel {
        &self.micro
    }

    /// Per-edge state for overlays, in edge ID order.
    pub fn overlay(&self) -> Vec<EdgeOverlay> {
        self.graph
            .edges()
            .map(|edge| {
                let id = edge.id();
                let volume = self.volumes.get(id).copied().unwrap_or(0.0);
                let cost = edge_cost(&EdgeState::of(edge, volume));
                let tier = self.lod.tier(id).unwrap_or_default();
                let cell = self.propagator.cell(id);
                EdgeOverlay {
                    edge: id,
                    volume,
                    vc_ratio: cost.vc_ratio,
                    los: cost.los,
                    occupancy: cell.map_or(0.0, |c| c.occupancy()),
                    tier,
                    simplified: cell
                        .filter(|_| tier == SimulationTier::Simplified)
                        .map(SimplifiedState::of),
                }
            })
            .collect()
    }

    /// The vehicles to draw, in edge, lane and cell order.
    pub fn vehicles(&self) -> Vec<VehicleRender> {
        let lane_width = self.config.micro.lane_width;
        self.micro
            .iter_vehicles()
            .filter_map(|vehicle| {
                let (a, b) = self.graph.edge_endpoints(vehicle.edge())?;
                let along = self.micro.position_along(vehicle);
                let offset = (vehicle.lane() as f64 + 0.5) * lane_width;
                Some(VehicleRender {
                    id: vehicle.id(),
                    edge: vehicle.edge(),
                    lane: vehicle.lane(),
                    cell: vehicle.cell(),
                    position: sample_segment(a, b, along, offset),
                    speed: self.micro.speed_of(vehicle),
                })
            })
            .collect()
    }

    /// The current frame of simulation.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulated time in s.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Counters describing the simulation.
    pub fn stats(&self) -> SimulationStats {
        let tiers = [
            SimulationTier::Aggregate,
            SimulationTier::Simplified,
            SimulationTier::Agent,
        ]
        .map(|tier| self.lod.count(tier));
        let (agents_spawned, agents_retired) = self.micro.handoffs();
        SimulationStats {
            tick: self.tick,
            time: self.time,
            clamp_warnings: self.propagator.clamp_count(),
            total_occupancy: self.propagator.total_occupancy(),
            total_queued: self.propagator.total_queued(),
            agents: self.micro.total_agents(),
            agents_spawned,
            agents_retired,
            tiers,
            ..self.stats.clone()
        }
    }
}
