//! Mathematical structs and functions.

use cgmath::prelude::*;
use cgmath::{Point2, Vector2};

/// A 2D point
pub type Point2d = Point2<f64>;

/// A 2D vector
pub type Vector2d = Vector2<f64>;

/// Projects a point onto a local coordinate system.
///
/// # Parameters
/// * `point` - The point to project
/// * `origin` - The origin of the coordinate system
/// * `x_axis` - The basis vector pointing in the positive x-axis.
/// * `y_axis` - The basis vector pointing in the positive y-axis.
pub fn project_local(
    point: Point2d,
    origin: Point2d,
    x_axis: Vector2d,
    y_axis: Vector2d,
) -> Point2d {
    let point = point - origin;
    Point2d::new(point.dot(x_axis), point.dot(y_axis))
}

/// Rotates a vector 90 degrees clockwise.
pub fn rot90(vec: Vector2d) -> Vector2d {
    Vector2d::new(-vec.y, vec.x)
}

/// Computes the shortest distance between `point` and the line segment `a`-`b`.
pub fn distance_to_segment(point: Point2d, a: Point2d, b: Point2d) -> f64 {
    let seg = b - a;
    let len = seg.magnitude();
    if len < 1e-9 {
        return point.distance(a);
    }
    let tan = seg / len;
    let local = project_local(point, a, rot90(tan), tan);
    let along = local.y.clamp(0.0, len);
    point.distance(a + tan * along)
}

/// Samples a point along the segment `a`-`b`, `pos` metres from `a`,
/// shifted laterally by `offset` metres.
pub fn sample_segment(a: Point2d, b: Point2d, pos: f64, offset: f64) -> Point2d {
    let seg = b - a;
    let len = seg.magnitude();
    if len < 1e-9 {
        return a;
    }
    let tan = seg / len;
    a + tan * pos.clamp(0.0, len) + rot90(tan) * offset
}
