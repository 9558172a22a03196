use std::time::{Duration, Instant};

use traffic_flow::math::Point2d;
use traffic_flow::{
    EdgeAttributes, EngineConfig, IntersectionControl, NodeAttributes, OdDemand, RoadClass,
    RoadGraph, Simulation, ZoneId,
};

const GRID: usize = 24;
const SPACING: f64 = 150.0;

/// Builds a two-way street grid with a zone on every boundary node.
fn build_grid() -> traffic_flow::Result<(RoadGraph, Vec<ZoneId>)> {
    let mut graph = RoadGraph::new();
    let mut nodes = Vec::with_capacity(GRID * GRID);
    for y in 0..GRID {
        for x in 0..GRID {
            let arterial = x % 6 == 0 || y % 6 == 0;
            nodes.push(graph.add_node(&NodeAttributes {
                position: Point2d::new(x as f64 * SPACING, y as f64 * SPACING),
                control: if arterial {
                    IntersectionControl::Signalized
                } else {
                    IntersectionControl::Unsignalized
                },
            }));
        }
    }

    for y in 0..GRID {
        for x in 0..GRID {
            let here = nodes[y * GRID + x];
            let mut neighbours = vec![];
            if x + 1 < GRID {
                neighbours.push((nodes[y * GRID + x + 1], y % 6 == 0));
            }
            if y + 1 < GRID {
                neighbours.push((nodes[(y + 1) * GRID + x], x % 6 == 0));
            }
            for (there, arterial) in neighbours {
                let (class, lanes) = if arterial {
                    (RoadClass::Avenue, 2)
                } else {
                    (RoadClass::Local, 1)
                };
                for (from, to) in [(here, there), (there, here)] {
                    graph.add_edge(&EdgeAttributes {
                        from,
                        to,
                        class,
                        lanes,
                        length: None,
                        speed: None,
                    })?;
                }
            }
        }
    }

    let mut zones = vec![];
    for i in (0..GRID).step_by(3) {
        for node in [nodes[i], nodes[(GRID - 1) * GRID + i]] {
            let zone = ZoneId(zones.len() as u32);
            graph.set_zone(zone, node)?;
            zones.push(zone);
        }
    }
    Ok((graph, zones))
}

fn main() -> traffic_flow::Result<()> {
    let (graph, zones) = build_grid()?;
    let mut demand = OdDemand::new();
    for (i, origin) in zones.iter().enumerate() {
        for (j, destination) in zones.iter().enumerate() {
            if i != j {
                demand.set(*origin, *destination, 40.0 + 5.0 * ((i + j) % 7) as f64);
            }
        }
    }

    let mut sim = Simulation::new(graph, EngineConfig::default())?;
    sim.set_demand(demand);
    sim.set_viewpoint(Some(Point2d::new(
        0.5 * GRID as f64 * SPACING,
        0.5 * GRID as f64 * SPACING,
    )));

    println!("Assigning...");
    let start = Instant::now();
    sim.step(0.05);
    sim.drain_blocking(Duration::from_secs(60))?;
    let snapshot = sim.snapshot();
    println!(
        "Assignment: {:?} (gap {:.4}, converged: {})",
        start.elapsed(),
        snapshot.relative_gap(),
        snapshot.converged()
    );

    println!("Simulating...");
    let num_frames = 1000;
    for _ in 0..10 {
        let start = Instant::now();
        for _ in 0..num_frames {
            sim.step(0.05);
        }
        let frame = start.elapsed() / num_frames;
        let stats = sim.stats();
        println!(
            "Avg. frame: {:?} --> {:.0}x speedup ({:.0} vehs, {} agents, tiers {:?})",
            frame,
            0.05 / frame.as_secs_f64(),
            stats.total_occupancy,
            stats.agents,
            stats.tiers,
        );
    }
    Ok(())
}
