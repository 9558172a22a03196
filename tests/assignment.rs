//! Tests of equilibrium assignment on small networks.

use assert_approx_eq::assert_approx_eq;
use traffic_flow::config::AssignmentConfig;
use traffic_flow::math::Point2d;
use traffic_flow::{
    AssignmentEngine, EdgeAttributes, EdgeId, IntersectionControl, NodeAttributes, NodeId,
    OdDemand, RoadClass, RoadGraph, ZoneId,
};

fn node(graph: &mut RoadGraph, x: f64, y: f64) -> NodeId {
    graph.add_node(&NodeAttributes {
        position: Point2d::new(x, y),
        control: IntersectionControl::GradeSeparated,
    })
}

fn edge(graph: &mut RoadGraph, from: NodeId, to: NodeId, class: RoadClass, lanes: u8) -> EdgeId {
    graph
        .add_edge(&EdgeAttributes {
            from,
            to,
            class,
            lanes,
            length: None,
            speed: None,
        })
        .unwrap()
}

/// Test that demand over a single link loads it to the expected V/C and BPR cost.
#[test]
fn single_link_over_capacity() {
    let mut graph = RoadGraph::new();
    let a = node(&mut graph, 0.0, 0.0);
    let b = node(&mut graph, 830.0, 0.0);
    let e = edge(&mut graph, a, b, RoadClass::Local, 2);
    graph.set_zone(ZoneId(0), a).unwrap();
    graph.set_zone(ZoneId(1), b).unwrap();
    let mut demand = OdDemand::new();
    demand.set(ZoneId(0), ZoneId(1), 1200.0);

    let config = AssignmentConfig::default();
    let result = AssignmentEngine::new(&graph, &config).run(&demand).unwrap();
    let cost = result.costs[e];
    assert_approx_eq!(cost.vc_ratio, 1.2, 1e-9);
    let t0 = 830.0 / 8.3;
    assert_approx_eq!(cost.cost, t0 * (1.0 + 0.8 * 1.2f64.powi(3)), 1e-6);
}

/// Test that two identical parallel links split demand evenly.
#[test]
fn parallel_links_reach_equal_cost() {
    let mut graph = RoadGraph::new();
    let a = node(&mut graph, 0.0, 0.0);
    let b = node(&mut graph, 600.0, 0.0);
    let first = edge(&mut graph, a, b, RoadClass::Avenue, 1);
    let second = edge(&mut graph, a, b, RoadClass::Avenue, 1);
    graph.set_zone(ZoneId(0), a).unwrap();
    graph.set_zone(ZoneId(1), b).unwrap();
    let mut demand = OdDemand::new();
    demand.set(ZoneId(0), ZoneId(1), 1500.0);

    let config = AssignmentConfig::default();
    let result = AssignmentEngine::new(&graph, &config).run(&demand).unwrap();
    assert!(result.converged);
    assert_approx_eq!(result.volume(first) + result.volume(second), 1500.0, 1e-6);
    let (c1, c2) = (result.costs[first].cost, result.costs[second].cost);
    assert!((c1 - c2).abs() / c1 < 0.01, "{} vs {}", c1, c2);
}

/// A ring of four nodes with a chord, zones on every corner.
fn ring() -> (RoadGraph, Vec<NodeId>) {
    let mut graph = RoadGraph::new();
    let corners = [(0.0, 0.0), (400.0, 0.0), (400.0, 400.0), (0.0, 400.0)];
    let nodes: Vec<NodeId> = corners.iter().map(|(x, y)| node(&mut graph, *x, *y)).collect();
    let centre = node(&mut graph, 200.0, 200.0);
    for i in 0..4 {
        let j = (i + 1) % 4;
        edge(&mut graph, nodes[i], nodes[j], RoadClass::Avenue, 1);
        edge(&mut graph, nodes[j], nodes[i], RoadClass::Local, 1);
        edge(&mut graph, nodes[i], centre, RoadClass::Local, 1);
        edge(&mut graph, centre, nodes[i], RoadClass::Local, 1);
    }
    for (i, node) in nodes.iter().enumerate() {
        graph.set_zone(ZoneId(i as u32), *node).unwrap();
    }
    (graph, nodes)
}

fn ring_demand() -> OdDemand {
    let mut demand = OdDemand::new();
    for o in 0..4 {
        for d in 0..4 {
            if o != d {
                demand.set(ZoneId(o), ZoneId(d), 150.0 + 25.0 * (o + d) as f64);
            }
        }
    }
    demand
}

/// Test that flow into the centre node, which is not a zone, equals flow out.
#[test]
fn flow_is_conserved_at_interior_nodes() {
    let (graph, nodes) = ring();
    let config = AssignmentConfig::default();
    let result = AssignmentEngine::new(&graph, &config).run(&ring_demand()).unwrap();
    assert!(result.unrouted.is_empty());

    let centre = graph
        .nodes()
        .find(|n| !nodes.contains(&n.id()))
        .unwrap();
    let inflow: f64 = centre.edges_in().iter().map(|e| result.volume(*e)).sum();
    let outflow: f64 = centre.edges_out().iter().map(|e| result.volume(*e)).sum();
    assert_approx_eq!(inflow, outflow, 1e-6);

    // Each zone's net outflow matches its net production
    let demand = ring_demand();
    for (i, id) in nodes.iter().enumerate() {
        let node = graph.node(*id).unwrap();
        let out: f64 = node.edges_out().iter().map(|e| result.volume(*e)).sum();
        let inn: f64 = node.edges_in().iter().map(|e| result.volume(*e)).sum();
        assert_approx_eq!(out - inn, demand.net_production(ZoneId(i as u32)), 1e-6);
    }
}

/// Test that assignment is a pure function of graph and demand.
#[test]
fn assignment_is_reproducible() {
    let (graph, _) = ring();
    let config = AssignmentConfig::default();
    let demand = ring_demand();
    let first = AssignmentEngine::new(&graph, &config).run(&demand).unwrap();
    let second = AssignmentEngine::new(&graph, &config).run(&demand).unwrap();
    for edge in graph.edges() {
        assert_eq!(first.volume(edge.id()), second.volume(edge.id()));
    }
    assert_eq!(first.gap_history, second.gap_history);
}
