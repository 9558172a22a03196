//! The road network: an arena of intersections and directed road segments.

pub use class::{ClassParams, RoadClass};
pub use intersection::IntersectionControl;

use crate::demand::ZoneId;
use crate::error::TopologyError;
use crate::math::Point2d;
use crate::{EdgeId, EdgeSet, NodeId, NodeSet};
use cgmath::MetricSpace;
use intersection::Approach;
use smallvec::SmallVec;
use std::collections::BTreeMap;

mod class;
mod intersection;

/// An intersection in the road network.
#[derive(Clone, Debug)]
pub struct Node {
    /// The node ID.
    id: NodeId,
    /// The world space position of the node.
    position: Point2d,
    /// How traffic is controlled at the node.
    control: IntersectionControl,
    /// The edges that end at this node.
    edges_in: SmallVec<[EdgeId; 4]>,
    /// The edges that start at this node.
    edges_out: SmallVec<[EdgeId; 4]>,
    /// Authored inbound capacities, overriding the derived ones.
    overrides: SmallVec<[(EdgeId, f64); 4]>,
    /// Derived inbound capacity of each approach, in veh/h.
    approach_capacity: SmallVec<[(EdgeId, f64); 4]>,
}

/// A directed road segment.
#[derive(Clone, Debug)]
pub struct Edge {
    /// The edge ID.
    id: EdgeId,
    /// The upstream node.
    from: NodeId,
    /// The downstream node.
    to: NodeId,
    /// Length in m.
    length: f64,
    /// Free-flow speed in m/s.
    speed: f64,
    /// Number of lanes.
    lanes: u8,
    /// The functional class.
    class: RoadClass,
    /// Whether the road is closed.
    blocked: bool,
    /// Capacity of the segment itself in veh/h.
    capacity: f64,
    /// Capacity after accounting for the downstream intersection, in veh/h.
    effective_capacity: f64,
}

/// The attributes of a node.
#[derive(Clone, Copy, Debug)]
pub struct NodeAttributes {
    /// The world space position of the node.
    pub position: Point2d,
    /// How traffic is controlled at the node.
    pub control: IntersectionControl,
}

/// The attributes of an edge.
#[derive(Clone, Copy, Debug)]
pub struct EdgeAttributes {
    pub from: NodeId,
    pub to: NodeId,
    pub class: RoadClass,
    pub lanes: u8,
    /// Length in m; defaults to the distance between the end nodes.
    pub length: Option<f64>,
    /// Free-flow speed in m/s; defaults to the class speed.
    pub speed: Option<f64>,
}

/// A partial update to an existing edge.
#[derive(Clone, Copy, Debug, Default)]
pub struct EdgeModification {
    pub class: Option<RoadClass>,
    pub lanes: Option<u8>,
    pub speed: Option<f64>,
    pub blocked: Option<bool>,
}

/// An edit event from the road authoring tools.
#[derive(Clone, Debug)]
pub enum GraphEdit {
    AddNode(NodeAttributes),
    RemoveNode(NodeId),
    SetControl(NodeId, IntersectionControl),
    SetApproachCapacity {
        node: NodeId,
        edge: EdgeId,
        capacity: Option<f64>,
    },
    AddEdge(EdgeAttributes),
    RemoveEdge(EdgeId),
    ModifyEdge(EdgeId, EdgeModification),
    BindZone(ZoneId, NodeId),
}

/// The result of applying a [GraphEdit].
#[derive(Clone, Debug, Default)]
pub struct EditOutcome {
    /// Whether nodes, edges or zone bindings were added or removed.
    pub topology_changed: bool,
    /// The node created by the edit, if any.
    pub node: Option<NodeId>,
    /// The edge created by the edit, if any.
    pub edge: Option<EdgeId>,
    /// Edges removed by the edit.
    pub removed_edges: Vec<EdgeId>,
}

/// A versioned road network.
#[derive(Clone, Debug, Default)]
pub struct RoadGraph {
    nodes: NodeSet,
    edges: EdgeSet,
    zones: BTreeMap<ZoneId, NodeId>,
    /// Incremented on every edit.
    version: u64,
    /// Incremented when nodes, edges or zones are added or removed.
    topology_version: u64,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn position(&self) -> Point2d {
        self.position
    }

    pub fn control(&self) -> IntersectionControl {
        self.control
    }

    /// The edges that end at this node.
    pub fn edges_in(&self) -> &[EdgeId] {
        &self.edges_in
    }

    /// The edges that start at this node.
    pub fn edges_out(&self) -> &[EdgeId] {
        &self.edges_out
    }

    /// The inbound capacity of the given approach, in veh/h.
    pub fn approach_capacity(&self, edge: EdgeId) -> Option<f64> {
        self.approach_capacity
            .iter()
            .find(|(id, _)| *id == edge)
            .map(|(_, cap)| *cap)
    }
}

impl Edge {
    pub fn id(&self) -> EdgeId {
        self.id
    }

    /// The upstream node.
    pub fn from(&self) -> NodeId {
        self.from
    }

    /// The downstream node.
    pub fn to(&self) -> NodeId {
        self.to
    }

    /// Length in m.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Free-flow speed in m/s.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn lanes(&self) -> u8 {
        self.lanes
    }

    pub fn class(&self) -> RoadClass {
        self.class
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Travel time at free flow, in s.
    pub fn free_flow_time(&self) -> f64 {
        self.length / self.speed
    }

    /// Capacity of the segment itself, in veh/h.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Capacity limited by the downstream intersection, in veh/h.
    pub fn effective_capacity(&self) -> f64 {
        self.effective_capacity
    }

    /// Whether the edge can carry traffic at all.
    pub fn is_passable(&self) -> bool {
        self.effective_capacity > 0.0
    }

    fn refresh_capacity(&mut self) {
        self.capacity = if self.blocked {
            0.0
        } else {
            self.class.capacity(self.lanes)
        };
    }
}

impl RoadGraph {
    /// Creates an empty network.
    pub fn new() -> Self {
        Default::default()
    }

    /// Incremented on every edit.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Incremented whenever nodes, edges or zone bindings are added or removed.
    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    /// Adds an intersection to the network.
    pub fn add_node(&mut self, attributes: &NodeAttributes) -> NodeId {
        let id = self.nodes.insert_with_key(|id| Node {
            id,
            position: attributes.position,
            control: attributes.control,
            edges_in: SmallVec::new(),
            edges_out: SmallVec::new(),
            overrides: SmallVec::new(),
            approach_capacity: SmallVec::new(),
        });
        self.bump(true);
        id
    }

    /// Adds a directed road segment, rejecting malformed geometry.
    pub fn add_edge(&mut self, attributes: &EdgeAttributes) -> Result<EdgeId, TopologyError> {
        let from = self
            .nodes
            .get(attributes.from)
            .ok_or(TopologyError::DanglingNode(attributes.from))?;
        let to = self
            .nodes
            .get(attributes.to)
            .ok_or(TopologyError::DanglingNode(attributes.to))?;
        if attributes.from == attributes.to {
            return Err(TopologyError::SelfLoop(attributes.from));
        }
        let length = attributes
            .length
            .unwrap_or_else(|| from.position.distance(to.position));
        if !(length.is_finite() && length > 0.0) {
            return Err(TopologyError::InvalidLength(length));
        }
        if attributes.lanes == 0 {
            return Err(TopologyError::NoLanes);
        }
        let speed = attributes
            .speed
            .unwrap_or(attributes.class.params().free_flow_speed);
        if !(speed.is_finite() && speed > 0.0) {
            return Err(TopologyError::InvalidSpeed(speed));
        }

        let id = self.edges.insert_with_key(|id| {
            let mut edge = Edge {
                id,
                from: attributes.from,
                to: attributes.to,
                length,
                speed,
                lanes: attributes.lanes,
                class: attributes.class,
                blocked: false,
                capacity: 0.0,
                effective_capacity: 0.0,
            };
            edge.refresh_capacity();
            edge
        });
        self.nodes[attributes.from].edges_out.push(id);
        self.nodes[attributes.to].edges_in.push(id);
        self.rebuild_capacities();
        self.bump(true);
        Ok(id)
    }

    /// Removes an edge from the network.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<(), TopologyError> {
        let edge = self.edges.remove(id).ok_or(TopologyError::UnknownEdge(id))?;
        if let Some(node) = self.nodes.get_mut(edge.from) {
            node.edges_out.retain(|e| *e != id);
        }
        if let Some(node) = self.nodes.get_mut(edge.to) {
            node.edges_in.retain(|e| *e != id);
            node.overrides.retain(|(e, _)| *e != id);
        }
        self.rebuild_capacities();
        self.bump(true);
        Ok(())
    }

    /// Removes a node along with every edge touching it and any zone bound to it.
    /// Returns the removed edges.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Vec<EdgeId>, TopologyError> {
        let node = self.nodes.get(id).ok_or(TopologyError::DanglingNode(id))?;
        let mut removed: Vec<EdgeId> = node
            .edges_in
            .iter()
            .chain(&node.edges_out)
            .copied()
            .collect();
        removed.sort();
        removed.dedup();
        for edge in &removed {
            self.remove_edge(*edge)?;
        }
        self.nodes.remove(id);
        self.zones.retain(|_, node| *node != id);
        self.bump(true);
        Ok(removed)
    }

    /// Changes the attributes of an existing edge.
    pub fn modify_edge(
        &mut self,
        id: EdgeId,
        modification: &EdgeModification,
    ) -> Result<(), TopologyError> {
        let edge = self.edges.get_mut(id).ok_or(TopologyError::UnknownEdge(id))?;
        // Validate everything first so a rejected edit leaves the edge untouched
        if modification.lanes == Some(0) {
            return Err(TopologyError::NoLanes);
        }
        if let Some(speed) = modification.speed {
            if !(speed.is_finite() && speed > 0.0) {
                return Err(TopologyError::InvalidSpeed(speed));
            }
        }

        if let Some(lanes) = modification.lanes {
            edge.lanes = lanes;
        }
        if let Some(speed) = modification.speed {
            edge.speed = speed;
        }
        if let Some(class) = modification.class {
            edge.class = class;
        }
        if let Some(blocked) = modification.blocked {
            edge.blocked = blocked;
        }
        edge.refresh_capacity();
        self.rebuild_capacities();
        self.bump(false);
        Ok(())
    }

    /// Sets the traffic control type of an intersection.
    pub fn set_control(
        &mut self,
        id: NodeId,
        control: IntersectionControl,
    ) -> Result<(), TopologyError> {
        let node = self.nodes.get_mut(id).ok_or(TopologyError::DanglingNode(id))?;
        node.control = control;
        self.rebuild_capacities();
        self.bump(false);
        Ok(())
    }

    /// Overrides (or with `None`, restores) the inbound capacity of one approach.
    pub fn set_approach_capacity(
        &mut self,
        node: NodeId,
        edge: EdgeId,
        capacity: Option<f64>,
    ) -> Result<(), TopologyError> {
        let inbound = self
            .edges
            .get(edge)
            .ok_or(TopologyError::UnknownEdge(edge))?
            .to;
        if inbound != node {
            return Err(TopologyError::UnknownEdge(edge));
        }
        let node = self.nodes.get_mut(node).ok_or(TopologyError::DanglingNode(node))?;
        node.overrides.retain(|(e, _)| *e != edge);
        if let Some(capacity) = capacity {
            node.overrides.push((edge, capacity.max(0.0)));
        }
        self.rebuild_capacities();
        self.bump(false);
        Ok(())
    }

    /// Binds a demand zone to its centroid node.
    pub fn set_zone(&mut self, zone: ZoneId, node: NodeId) -> Result<(), TopologyError> {
        if !self.nodes.contains_key(node) {
            return Err(TopologyError::UnknownZoneNode { zone, node });
        }
        self.zones.insert(zone, node);
        self.bump(true);
        Ok(())
    }

    /// Applies an edit event.
    pub fn apply(&mut self, edit: &GraphEdit) -> Result<EditOutcome, TopologyError> {
        let mut outcome = EditOutcome::default();
        match edit {
            GraphEdit::AddNode(attributes) => {
                outcome.node = Some(self.add_node(attributes));
                outcome.topology_changed = true;
            }
            GraphEdit::RemoveNode(id) => {
                outcome.removed_edges = self.remove_node(*id)?;
                outcome.topology_changed = true;
            }
            GraphEdit::SetControl(id, control) => self.set_control(*id, *control)?,
            GraphEdit::SetApproachCapacity {
                node,
                edge,
                capacity,
            } => self.set_approach_capacity(*node, *edge, *capacity)?,
            GraphEdit::AddEdge(attributes) => {
                outcome.edge = Some(self.add_edge(attributes)?);
                outcome.topology_changed = true;
            }
            GraphEdit::RemoveEdge(id) => {
                self.remove_edge(*id)?;
                outcome.removed_edges.push(*id);
                outcome.topology_changed = true;
            }
            GraphEdit::ModifyEdge(id, modification) => self.modify_edge(*id, modification)?,
            GraphEdit::BindZone(zone, node) => {
                self.set_zone(*zone, *node)?;
                outcome.topology_changed = true;
            }
        }
        Ok(outcome)
    }

    /// Checks whole-graph invariants that cannot be enforced edge by edge.
    pub fn validate(&self) -> Result<(), TopologyError> {
        for (id, node) in &self.nodes {
            if node.edges_in.is_empty() && node.edges_out.is_empty() {
                return Err(TopologyError::IsolatedNode(id));
            }
        }
        for (zone, node) in &self.zones {
            if !self.nodes.contains_key(*node) {
                return Err(TopologyError::UnknownZoneNode {
                    zone: *zone,
                    node: *node,
                });
            }
        }
        Ok(())
    }

    /// Gets the node with the given ID.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Gets the edge with the given ID.
    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    /// Returns an iterator over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Returns an iterator over all edges, in ascending ID order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// The centroid node of a zone.
    pub fn zone_node(&self, zone: ZoneId) -> Option<NodeId> {
        self.zones.get(&zone).copied()
    }

    /// Returns an iterator over the zone bindings.
    pub fn zones(&self) -> impl Iterator<Item = (ZoneId, NodeId)> + '_ {
        self.zones.iter().map(|(z, n)| (*z, *n))
    }

    /// The world space end points of an edge.
    pub fn edge_endpoints(&self, id: EdgeId) -> Option<(Point2d, Point2d)> {
        let edge = self.edges.get(id)?;
        let from = self.nodes.get(edge.from)?;
        let to = self.nodes.get(edge.to)?;
        Some((from.position, to.position))
    }

    /// Recomputes every approach capacity and effective edge capacity.
    fn rebuild_capacities(&mut self) {
        for node in self.nodes.values_mut() {
            let approaches = node
                .edges_in
                .iter()
                .filter_map(|id| self.edges.get(*id))
                .map(|edge| {
                    (
                        edge.id,
                        Approach {
                            capacity: edge.capacity,
                            lanes: edge.lanes,
                        },
                    )
                })
                .collect::<SmallVec<[_; 4]>>();
            let total: f64 = approaches.iter().map(|(_, a)| a.capacity).sum();
            let open = approaches.iter().filter(|(_, a)| a.capacity > 0.0).count();

            node.approach_capacity = approaches
                .iter()
                .map(|(id, approach)| {
                    let authored = node
                        .overrides
                        .iter()
                        .find(|(e, _)| e == id)
                        .map(|(_, cap)| *cap);
                    let cap = authored.unwrap_or_else(|| {
                        node.control.approach_capacity(
                            *approach,
                            open,
                            total - approach.capacity,
                        )
                    });
                    (*id, cap)
                })
                .collect();
        }

        for edge in self.edges.values_mut() {
            let approach = self
                .nodes
                .get(edge.to)
                .and_then(|node| node.approach_capacity(edge.id))
                .unwrap_or(edge.capacity);
            edge.effective_capacity = f64::min(edge.capacity, approach).max(0.0);
        }
    }

    fn bump(&mut self, topology: bool) {
        self.version += 1;
        if topology {
            self.topology_version += 1;
        }
    }
}
