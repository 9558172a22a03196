use crate::{EdgeId, EdgeMap, NodeId, RoadGraph};
use ordered_float::OrderedFloat;
use pathfinding::directed::dijkstra::{build_path, dijkstra_all};
use smallvec::SmallVec;
use std::collections::HashMap;

type Cost = OrderedFloat<f64>;

/// A shortest path tree rooted at one origin.
pub(crate) struct PathTree {
    origin: NodeId,
    parents: HashMap<NodeId, (NodeId, Cost)>,
}

/// A route through the network, as a sequence of edges.
pub type Route = SmallVec<[EdgeId; 16]>;

impl PathTree {
    /// Computes least-cost paths from `origin` to every reachable node.
    ///
    /// Edges whose cost is not finite are impassable and never searched.
    /// Between parallel edges of equal cost, the lowest edge ID is taken.
    /// Equal-cost paths through different nodes are settled in the search's
    /// own deterministic order, which does not depend on edge IDs.
    pub fn build(graph: &RoadGraph, origin: NodeId, costs: &EdgeMap<f64>) -> Self {
        let parents = dijkstra_all(&origin, |node| successors(graph, *node, costs));
        Self { origin, parents }
    }

    /// Whether `dest` can be reached from the origin.
    pub fn reaches(&self, dest: NodeId) -> bool {
        dest == self.origin || self.parents.contains_key(&dest)
    }

    /// Reconstructs the least-cost route to `dest` as a list of edges.
    pub fn route_to(
        &self,
        graph: &RoadGraph,
        dest: NodeId,
        costs: &EdgeMap<f64>,
    ) -> Option<Route> {
        if !self.reaches(dest) {
            return None;
        }
        let nodes = build_path(&dest, &self.parents);
        nodes
            .windows(2)
            .map(|pair| cheapest_edge(graph, pair[0], pair[1], costs))
            .collect()
    }
}

/// The least-cost passable edge between two adjacent nodes,
/// breaking ties by lowest edge ID.
fn cheapest_edge(
    graph: &RoadGraph,
    from: NodeId,
    to: NodeId,
    costs: &EdgeMap<f64>,
) -> Option<EdgeId> {
    graph
        .node(from)?
        .edges_out()
        .iter()
        .filter_map(|id| {
            let edge = graph.edge(*id)?;
            let cost = edge_cost(costs, *id)?;
            (edge.to() == to).then_some((OrderedFloat(cost), *id))
        })
        .min()
        .map(|(_, id)| id)
}

fn edge_cost(costs: &EdgeMap<f64>, id: EdgeId) -> Option<f64> {
    costs.get(id).copied().filter(|cost| cost.is_finite())
}

fn successors(
    graph: &RoadGraph,
    node: NodeId,
    costs: &EdgeMap<f64>,
) -> SmallVec<[(NodeId, Cost); 8]> {
    let mut out: SmallVec<[(EdgeId, NodeId, f64); 8]> = graph
        .node(node)
        .into_iter()
        .flat_map(|n| n.edges_out())
        .filter_map(|id| {
            let edge = graph.edge(*id)?;
            Some((*id, edge.to(), edge_cost(costs, *id)?))
        })
        .collect();
    out.sort_by_key(|(id, _, _)| *id);

    // Parallel edges collapse to the cheapest one per neighbour
    let mut best: SmallVec<[(NodeId, Cost); 8]> = SmallVec::new();
    for (_, to, cost) in out {
        match best.iter_mut().find(|(n, _)| *n == to) {
            Some(entry) if OrderedFloat(cost) < entry.1 => entry.1 = OrderedFloat(cost),
            Some(_) => {}
            None => best.push((to, OrderedFloat(cost))),
        }
    }
    best
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::math::Point2d;
    use crate::network::{EdgeAttributes, IntersectionControl, NodeAttributes, RoadClass};

    fn line_graph() -> (RoadGraph, Vec<NodeId>, Vec<EdgeId>) {
        let mut graph = RoadGraph::new();
        let nodes: Vec<_> = (0..3)
            .map(|i| {
                graph.add_node(&NodeAttributes {
                    position: Point2d::new(100.0 * i as f64, 0.0),
                    control: IntersectionControl::GradeSeparated,
                })
            })
            .collect();
        let mut edges = vec![];
        for (from, to) in [(0, 1), (0, 1), (1, 2)] {
            edges.push(
                graph
                    .add_edge(&EdgeAttributes {
                        from: nodes[from],
                        to: nodes[to],
                        class: RoadClass::Local,
                        lanes: 1,
                        length: None,
                        speed: None,
                    })
                    .unwrap(),
            );
        }
        (graph, nodes, edges)
    }

    fn uniform_costs(graph: &RoadGraph) -> EdgeMap<f64> {
        graph.edges().map(|e| (e.id(), 10.0)).collect()
    }

    #[test]
    fn ties_resolve_to_lowest_edge_id() {
        let (graph, nodes, edges) = line_graph();
        let costs = uniform_costs(&graph);
        let tree = PathTree::build(&graph, nodes[0], &costs);
        let route = tree.route_to(&graph, nodes[2], &costs).unwrap();
        let lowest = edges[0].min(edges[1]);
        assert_eq!(route.as_slice(), &[lowest, edges[2]]);
    }

    #[test]
    fn cheaper_parallel_edge_wins() {
        let (graph, nodes, edges) = line_graph();
        let mut costs = uniform_costs(&graph);
        costs.insert(edges[0], 50.0);
        let tree = PathTree::build(&graph, nodes[0], &costs);
        let route = tree.route_to(&graph, nodes[2], &costs).unwrap();
        assert_eq!(route.as_slice(), &[edges[1], edges[2]]);
    }

    #[test]
    fn impassable_edges_are_never_used() {
        let (graph, nodes, edges) = line_graph();
        let mut costs = uniform_costs(&graph);
        costs.insert(edges[2], f64::INFINITY);
        let tree = PathTree::build(&graph, nodes[0], &costs);
        assert!(tree.reaches(nodes[1]));
        assert!(!tree.reaches(nodes[2]));
        assert!(tree.route_to(&graph, nodes[2], &costs).is_none());
    }

    #[test]
    fn origin_route_is_empty() {
        let (graph, nodes, _) = line_graph();
        let costs = uniform_costs(&graph);
        let tree = PathTree::build(&graph, nodes[0], &costs);
        assert_eq!(tree.route_to(&graph, nodes[0], &costs).unwrap().len(), 0);
    }
}
