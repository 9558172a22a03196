//! The congestion propagator.
//!
//! Each edge is a single storage cell. Every tick, vehicles are sent from each
//! edge to the edges downstream of it according to turning fractions taken from
//! the assigned volumes, limited by how much the upstream edge can send and how
//! much the downstream edge can receive. Because the receiving capacity of a
//! nearly full edge travels upstream at the backward wave speed, queues build
//! and dissipate edge by edge.
//!
//! Occupancies are double-buffered: every flow in a sub-step is computed from
//! the occupancies at the start of that sub-step.

use crate::config::PropagatorConfig;
use crate::cost::{edge_cost, EdgeState};
use crate::network::Edge;
use crate::util::Interval;
use crate::{EdgeId, EdgeMap, RoadGraph};
use smallvec::SmallVec;

/// Occupancies within this tolerance of the valid range are clamped silently.
const CLAMP_TOLERANCE: f64 = 1e-9;

/// The aggregate state of a single edge.
#[derive(Clone, Debug, PartialEq)]
pub struct CongestionCell {
    /// Vehicles on the edge.
    occupancy: f64,
    /// Jam density × length × lanes.
    max_occupancy: f64,
    /// Maximum flow in veh/s.
    max_flow: f64,
    /// Backward wave speed in m/s.
    wave_speed: f64,
    /// Free-flow speed in m/s.
    free_flow_speed: f64,
    /// Length in m.
    length: f64,
    lanes: u8,
    /// Vehicles generated at the tail node that have not yet entered.
    entry_queue: f64,
}

/// Where the vehicles leaving an edge go, and how many enter it from outside the network.
#[derive(Clone, Debug, Default)]
struct Turns {
    /// Fraction of the sending flow bound for each downstream edge.
    downstream: SmallVec<[(EdgeId, f64); 4]>,
    /// Fraction of the sending flow absorbed at the head node.
    exit: f64,
    /// Vehicles generated at the tail node for this edge, in veh/s.
    entry_rate: f64,
}

/// Drives every edge's [CongestionCell] forward in time.
#[derive(Clone, Debug)]
pub struct CongestionPropagator {
    config: PropagatorConfig,
    cells: EdgeMap<CongestionCell>,
    turns: EdgeMap<Turns>,
    /// The volumes the turning fractions were derived from.
    volumes: EdgeMap<f64>,
    /// The occupancy buffer written during a sub-step.
    next: EdgeMap<f64>,
    /// Vehicles that entered each edge during the last tick.
    inflow: EdgeMap<f64>,
    /// Vehicles that left each edge during the last tick.
    outflow: EdgeMap<f64>,
    /// The shortest free-flow travel time of any passable edge, in s.
    min_travel_time: f64,
    clamps: u64,
    generated: f64,
    exited: f64,
}

impl CongestionCell {
    fn new(edge: &Edge, jam_density: f64) -> Self {
        let lanes = edge.lanes().max(1);
        Self {
            occupancy: 0.0,
            max_occupancy: jam_density * edge.length() * lanes as f64,
            max_flow: edge.effective_capacity() / 3600.0,
            wave_speed: edge.class().params().wave_speed,
            free_flow_speed: edge.speed(),
            length: edge.length(),
            lanes,
            entry_queue: 0.0,
        }
    }

    /// Vehicles on the edge.
    pub fn occupancy(&self) -> f64 {
        self.occupancy
    }

    /// The most vehicles the edge can hold.
    pub fn max_occupancy(&self) -> f64 {
        self.max_occupancy
    }

    /// Maximum flow in veh/s.
    pub fn max_flow(&self) -> f64 {
        self.max_flow
    }

    /// Backward wave speed in m/s.
    pub fn wave_speed(&self) -> f64 {
        self.wave_speed
    }

    /// Free-flow speed in m/s.
    pub fn free_flow_speed(&self) -> f64 {
        self.free_flow_speed
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn lanes(&self) -> u8 {
        self.lanes
    }

    /// Vehicles waiting to enter the edge from its tail node.
    pub fn entry_queue(&self) -> f64 {
        self.entry_queue
    }

    /// Density in veh/m/lane.
    pub fn density(&self) -> f64 {
        self.occupancy / (self.length * self.lanes as f64)
    }

    /// Occupancy as a fraction of the maximum.
    pub fn fill(&self) -> f64 {
        if self.max_occupancy > 0.0 {
            self.occupancy / self.max_occupancy
        } else {
            0.0
        }
    }

    fn travel_time(&self) -> f64 {
        self.length / self.free_flow_speed
    }

    /// Vehicles the edge can send in `h` seconds.
    fn sending(&self, h: f64) -> f64 {
        let free = self.occupancy * (h / self.travel_time()).min(1.0);
        free.min(self.max_flow * h).max(0.0)
    }

    /// Vehicles the edge can accept in `h` seconds.
    ///
    /// Free space opens up at the back of the edge at the wave speed, so only
    /// the fraction `w·h/L` of it is available within one sub-step.
    fn receiving(&self, h: f64) -> f64 {
        if !(self.max_flow > 0.0) {
            return 0.0;
        }
        let space = (self.max_occupancy - self.occupancy).max(0.0);
        let reach = (self.wave_speed * h / self.length).min(1.0);
        (space * reach).min(self.max_flow * h)
    }
}

impl CongestionPropagator {
    /// Creates a propagator for every edge of the graph, initially empty.
    pub fn new(graph: &RoadGraph, config: &PropagatorConfig) -> Self {
        let mut propagator = Self {
            config: config.clone(),
            cells: EdgeMap::new(),
            turns: EdgeMap::new(),
            volumes: EdgeMap::new(),
            next: EdgeMap::new(),
            inflow: EdgeMap::new(),
            outflow: EdgeMap::new(),
            min_travel_time: f64::INFINITY,
            clamps: 0,
            generated: 0.0,
            exited: 0.0,
        };
        propagator.rebuild(graph);
        propagator
    }

    /// Rebuilds the cells after the graph has been edited.
    ///
    /// Occupancy of surviving edges is kept. If an edge shrank, vehicles that
    /// no longer fit wait in its entry queue.
    pub fn rebuild(&mut self, graph: &RoadGraph) {
        let mut cells = EdgeMap::with_capacity(graph.edge_count());
        for edge in graph.edges() {
            let mut cell = CongestionCell::new(edge, self.config.jam_density);
            if let Some(old) = self.cells.get(edge.id()) {
                cell.occupancy = old.occupancy.min(cell.max_occupancy);
                cell.entry_queue = old.entry_queue + (old.occupancy - cell.occupancy);
            }
            cells.insert(edge.id(), cell);
        }
        let dropped: f64 = self
            .cells
            .iter()
            .filter(|(id, _)| !cells.contains_key(*id))
            .map(|(_, cell)| cell.occupancy + cell.entry_queue)
            .sum();
        if dropped > 0.0 {
            self.exited += dropped;
            log::debug!("{:.1} vehicles left the network with removed edges", dropped);
        }

        self.min_travel_time = cells
            .values()
            .filter(|cell| cell.max_flow > 0.0)
            .map(|cell| cell.travel_time())
            .fold(f64::INFINITY, f64::min);
        self.turns = cells.keys().map(|id| (id, Turns::default())).collect();
        self.next = cells.keys().map(|id| (id, 0.0)).collect();
        self.inflow = self.next.clone();
        self.outflow = self.next.clone();
        self.cells = cells;

        let volumes = std::mem::take(&mut self.volumes);
        self.set_rates(graph, &volumes);
    }

    /// Initializes occupancy from assigned volumes: the number of vehicles on an
    /// edge is its flow times its congested travel time, up to its maximum.
    pub fn seed(&mut self, graph: &RoadGraph, volumes: &EdgeMap<f64>) {
        let before = self.total_occupancy() + self.total_queued();
        for edge in graph.edges() {
            let Some(cell) = self.cells.get_mut(edge.id()) else {
                continue;
            };
            let volume = volumes.get(edge.id()).copied().unwrap_or(0.0).max(0.0);
            let cost = edge_cost(&EdgeState::of(edge, volume)).cost;
            cell.occupancy = if cost.is_finite() {
                (volume * cost / 3600.0).min(cell.max_occupancy)
            } else {
                0.0
            };
            cell.entry_queue = 0.0;
        }
        // Seeded vehicles count as generated so that conservation holds
        self.generated += self.total_occupancy() + self.total_queued() - before;
        log::debug!("seeded {:.1} vehicles", self.total_occupancy());
    }

    /// Derives turning fractions and boundary flows from edge volumes in veh/h.
    ///
    /// At each node the outflow of the inbound edges is split over the passable
    /// outbound edges in proportion to their volumes. Inbound volume in excess
    /// of outbound volume is absorbed at the node, and outbound volume in
    /// excess of inbound volume is generated there. A node with no volume at
    /// all splits uniformly.
    pub fn set_rates(&mut self, graph: &RoadGraph, volumes: &EdgeMap<f64>) {
        let volume = |id: EdgeId| volumes.get(id).copied().unwrap_or(0.0).max(0.0);
        for turns in self.turns.values_mut() {
            turns.entry_rate = 0.0;
        }

        for node in graph.nodes() {
            let outgoing: SmallVec<[(EdgeId, f64); 4]> = node
                .edges_out()
                .iter()
                .filter_map(|id| graph.edge(*id))
                .filter(|edge| edge.is_passable())
                .map(|edge| (edge.id(), volume(edge.id())))
                .collect();
            let out_total: f64 = outgoing.iter().map(|(_, v)| v).sum();
            let in_total: f64 = node.edges_in().iter().map(|id| volume(*id)).sum();

            let split: SmallVec<[(EdgeId, f64); 4]> = if out_total > 0.0 {
                outgoing.iter().map(|(id, v)| (*id, v / out_total)).collect()
            } else {
                let n = outgoing.len() as f64;
                outgoing.iter().map(|(id, _)| (*id, 1.0 / n)).collect()
            };
            let through = match (in_total > 0.0, out_total > 0.0) {
                (true, true) => (out_total / in_total).min(1.0),
                (true, false) => 0.0,
                (false, _) if split.is_empty() => 0.0,
                (false, _) => 1.0,
            };

            for id in node.edges_in() {
                if let Some(turns) = self.turns.get_mut(*id) {
                    turns.downstream = split.iter().map(|(d, f)| (*d, f * through)).collect();
                    turns.exit = 1.0 - through;
                }
            }
            let generated = (out_total - in_total).max(0.0);
            if out_total > 0.0 {
                for (id, share) in &split {
                    if let Some(turns) = self.turns.get_mut(*id) {
                        turns.entry_rate = generated * share / 3600.0;
                    }
                }
            }
        }
        self.volumes = volumes.clone();
    }

    /// The number of sub-steps needed to advance by `dt` without letting a
    /// vehicle cross more than one edge per sub-step.
    pub fn substeps_for(&self, dt: f64) -> usize {
        if !self.min_travel_time.is_finite() || self.min_travel_time <= 0.0 {
            return 1;
        }
        let needed = (dt / self.min_travel_time).ceil() as usize;
        if needed > self.config.max_substeps {
            log::warn!(
                "tick of {:.2}s needs {} sub-steps, limited to {}",
                dt,
                needed,
                self.config.max_substeps
            );
        }
        needed.clamp(1, self.config.max_substeps)
    }

    /// Advances every edge by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        for value in self.inflow.values_mut().chain(self.outflow.values_mut()) {
            *value = 0.0;
        }
        if !(dt > 0.0) || self.cells.is_empty() {
            return;
        }
        let substeps = self.substeps_for(dt);
        let h = dt / substeps as f64;
        for _ in 0..substeps {
            self.substep(h);
        }
    }

    fn substep(&mut self, h: f64) {
        // Sending flows and the demand they place on each downstream edge
        let mut sending = EdgeMap::with_capacity(self.cells.len());
        let mut entering = EdgeMap::with_capacity(self.cells.len());
        let mut demand: EdgeMap<f64> = self.cells.keys().map(|id| (id, 0.0)).collect();
        for (id, cell) in &self.cells {
            let turns = self.turns.get(id);
            let send = cell.sending(h);
            sending.insert(id, send);
            for (d, fraction) in turns.iter().flat_map(|t| &t.downstream) {
                add(&mut demand, *d, send * fraction);
            }
            let entry_rate = turns.map_or(0.0, |t| t.entry_rate);
            let entry = cell.entry_queue + entry_rate * h;
            self.generated += entry_rate * h;
            entering.insert(id, entry);
            add(&mut demand, id, entry);
        }

        // Downstream edges that cannot receive everything scale every contributor
        let ratio: EdgeMap<f64> = self
            .cells
            .iter()
            .map(|(id, cell)| {
                let wanted = demand.get(id).copied().unwrap_or(0.0);
                let receiving = cell.receiving(h);
                let ratio = if wanted > receiving { receiving / wanted } else { 1.0 };
                (id, ratio)
            })
            .collect();
        let ratio_of = |id: EdgeId| ratio.get(id).copied().unwrap_or(0.0);

        for (id, cell) in &self.cells {
            self.next.insert(id, cell.occupancy);
        }
        for (id, cell) in self.cells.iter_mut() {
            let send = sending.get(id).copied().unwrap_or(0.0);
            let mut moved = 0.0;
            if let Some(turns) = self.turns.get(id) {
                for (d, fraction) in &turns.downstream {
                    let flow = send * fraction * ratio_of(*d);
                    add(&mut self.next, *d, flow);
                    add(&mut self.inflow, *d, flow);
                    moved += flow;
                }
                let exiting = send * turns.exit;
                self.exited += exiting;
                moved += exiting;
            }
            add(&mut self.next, id, -moved);
            add(&mut self.outflow, id, moved);

            let entry = entering.get(id).copied().unwrap_or(0.0);
            let accepted = entry * ratio_of(id);
            add(&mut self.next, id, accepted);
            add(&mut self.inflow, id, accepted);
            cell.entry_queue = entry - accepted;
        }

        // Commit the new buffer
        for (id, cell) in self.cells.iter_mut() {
            let value = self.next.get(id).copied().unwrap_or(cell.occupancy);
            let (clamped, violated) = Interval::new(0.0, cell.max_occupancy).clamp(value);
            let excess = (value - clamped).abs();
            if violated && !(excess <= CLAMP_TOLERANCE) {
                log::warn!(
                    "occupancy of edge {:?} clamped from {} to {}",
                    id,
                    value,
                    clamped
                );
                self.clamps += 1;
            }
            cell.occupancy = clamped;
        }
    }

    /// The cell of an edge.
    pub fn cell(&self, edge: EdgeId) -> Option<&CongestionCell> {
        self.cells.get(edge)
    }

    /// Iterates over every edge's cell in edge ID order.
    pub fn cells(&self) -> impl Iterator<Item = (EdgeId, &CongestionCell)> {
        self.cells.iter()
    }

    /// Vehicles on an edge, zero if unknown.
    pub fn occupancy(&self, edge: EdgeId) -> f64 {
        self.cells.get(edge).map_or(0.0, |cell| cell.occupancy)
    }

    /// Vehicles that entered an edge during the last tick.
    pub fn inflow(&self, edge: EdgeId) -> f64 {
        self.inflow.get(edge).copied().unwrap_or(0.0)
    }

    /// Vehicles that left an edge during the last tick.
    pub fn outflow(&self, edge: EdgeId) -> f64 {
        self.outflow.get(edge).copied().unwrap_or(0.0)
    }

    /// Vehicles on all edges.
    pub fn total_occupancy(&self) -> f64 {
        self.cells.values().map(|cell| cell.occupancy).sum()
    }

    /// Vehicles waiting in all entry queues.
    pub fn total_queued(&self) -> f64 {
        self.cells.values().map(|cell| cell.entry_queue).sum()
    }

    /// Vehicles generated at nodes since creation.
    pub fn generated(&self) -> f64 {
        self.generated
    }

    /// Vehicles absorbed at nodes since creation.
    pub fn exited(&self) -> f64 {
        self.exited
    }

    /// How many times an out-of-range occupancy has been clamped.
    pub fn clamp_count(&self) -> u64 {
        self.clamps
    }
}

fn add(map: &mut EdgeMap<f64>, id: EdgeId, value: f64) {
    if let Some(entry) = map.get_mut(id) {
        *entry += value;
    }
}
