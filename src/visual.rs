//! Shape extraction from a resolved `visual` sub-tree.
//!
//! The tree is the JSON export of an entity's `visual` key. Shapes live at
//! `visual.shape.<kind>` or `visual.<N>.shape.<kind>`, and a kind may hold
//! several shapes as indexed children (`visual.shape.line.0`, ...).
//!
//! Placement attributes are looked up on the shape first, then on the
//! indexed visual child holding it, then on the visual root:
//!
//! | key         | meaning                                  | default |
//! |-------------|------------------------------------------|---------|
//! | `origin`    | translation `{x, y}`                     | `(0,0)` |
//! | `rotation`  | radians, applied before translation      | `0`     |
//! | `scale`     | uniform factor, applied first            | `1`     |
//! | `start`     | first point                              | `(0,0)` |
//! | `end`       | second point                             |         |
//! | `delta`     | second point relative to `start`         |         |
//! | `direction` | radians, with `length`                   | `0`     |
//! | `length`    | distance along `direction`               |         |
//!
//! Drawing is left to the caller.

use crate::data::OWN_VALUE_KEY;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as Json};
use std::f64::consts::TAU;
use tracing::trace;

/// Root key of an entity's visual attributes.
pub const VISUAL_KEY: &str = "visual";
/// Key holding the shapes of a visual node.
pub const SHAPE_KEY: &str = "shape";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn offset(self, other: Point) -> Point {
        Point::new(self.x + other.x, self.y + other.y)
    }

    fn polar(self, angle: f64, length: f64) -> Point {
        Point::new(self.x + length * angle.cos(), self.y + length * angle.sin())
    }
}

/// A shape in the entity's frame, already transformed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shape {
    Line {
        from: Point,
        to: Point,
    },
    Circle {
        center: Point,
        radius: f64,
    },
    Arc {
        center: Point,
        radius: f64,
        angle_start: f64,
        angle_end: f64,
    },
    RightTriangle {
        vertices: [Point; 3],
    },
}

/// Attribute lookup along shape -> indexed child -> root.
struct Scope<'a> {
    chain: Vec<&'a JsonMap<String, Json>>,
}

impl<'a> Scope<'a> {
    fn get(&self, key: &str) -> Option<&'a Json> {
        self.chain.iter().copied().find_map(|object| object.get(key))
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(number)
    }

    fn point(&self, key: &str) -> Option<Point> {
        self.get(key).and_then(point)
    }

    fn frame(&self) -> Frame {
        Frame {
            origin: self.point("origin").unwrap_or(Point::ORIGIN),
            rotation: self.number("rotation").unwrap_or(0.0),
            scale: self.number("scale").unwrap_or(1.0),
        }
    }
}

struct Frame {
    origin: Point,
    rotation: f64,
    scale: f64,
}

impl Frame {
    fn apply(&self, p: Point) -> Point {
        let (sin, cos) = self.rotation.sin_cos();
        let (x, y) = (p.x * self.scale, p.y * self.scale);
        Point::new(
            self.origin.x + x * cos - y * sin,
            self.origin.y + x * sin + y * cos,
        )
    }
}

fn number(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse().ok(),
        Json::Object(object) => object.get(OWN_VALUE_KEY).and_then(number),
        _ => None,
    }
}

fn point(value: &Json) -> Option<Point> {
    let object = value.as_object()?;
    let x = object.get("x").and_then(number);
    let y = object.get("y").and_then(number);
    if x.is_none() && y.is_none() {
        return None;
    }
    Some(Point::new(x.unwrap_or(0.0), y.unwrap_or(0.0)))
}

/// Numerically keyed children of `object`, in numeric order.
fn indexed(object: &JsonMap<String, Json>) -> Vec<&JsonMap<String, Json>> {
    let mut children: Vec<(usize, &JsonMap<String, Json>)> = object
        .iter()
        .filter_map(|(k, v)| Some((k.parse().ok()?, v.as_object()?)))
        .collect();
    children.sort_by_key(|(n, _)| *n);
    children.into_iter().map(|(_, c)| c).collect()
}

fn line(scope: &Scope<'_>) -> Option<Shape> {
    let start = scope.point("start").unwrap_or(Point::ORIGIN);
    let end = scope
        .point("end")
        .or_else(|| scope.point("delta").map(|d| start.offset(d)))
        .or_else(|| {
            let length = scope.number("length")?;
            Some(start.polar(scope.number("direction").unwrap_or(0.0), length))
        })?;
    let frame = scope.frame();
    Some(Shape::Line {
        from: frame.apply(start),
        to: frame.apply(end),
    })
}

fn circle(scope: &Scope<'_>, arc: bool) -> Option<Shape> {
    let frame = scope.frame();
    let radius = scope.number("radius").or_else(|| scope.number("length"))? * frame.scale;
    let center = frame.apply(scope.point("start").unwrap_or(Point::ORIGIN));
    let start = scope.number("angle_start");
    let end = scope.number("angle_end");
    if !arc && start.is_none() && end.is_none() {
        return Some(Shape::Circle { center, radius });
    }
    Some(Shape::Arc {
        center,
        radius,
        angle_start: start.unwrap_or(0.0) + frame.rotation,
        angle_end: end.unwrap_or(TAU) + frame.rotation,
    })
}

/// Right angle at `start`; the legs run along x and y to `start + delta`.
fn right_triangle(scope: &Scope<'_>) -> Option<Shape> {
    let a = scope.point("start").unwrap_or(Point::ORIGIN);
    let delta = scope
        .point("delta")
        .or_else(|| scope.point("end").map(|e| Point::new(e.x - a.x, e.y - a.y)))?;
    let frame = scope.frame();
    Some(Shape::RightTriangle {
        vertices: [
            frame.apply(a),
            frame.apply(Point::new(a.x + delta.x, a.y)),
            frame.apply(a.offset(delta)),
        ],
    })
}

fn shape(kind: &str, scope: &Scope<'_>) -> Option<Shape> {
    match kind {
        "line" => line(scope),
        "circle" => circle(scope, false),
        "arc" => circle(scope, true),
        "right_triangle" | "triangle" => right_triangle(scope),
        _ => {
            trace!(kind, "unknown shape kind");
            None
        }
    }
}

fn collect<'a>(holder: &'a JsonMap<String, Json>, parents: &[&'a JsonMap<String, Json>], out: &mut Vec<Shape>) {
    let Some(kinds) = holder.get(SHAPE_KEY).and_then(Json::as_object) else {
        return;
    };
    for (kind, params) in kinds {
        let Some(params) = params.as_object() else {
            continue;
        };
        let mut targets = indexed(params);
        if targets.is_empty() {
            targets.push(params);
        }
        for target in targets {
            let mut chain = vec![target];
            if !std::ptr::eq(target, params) {
                chain.push(params);
            }
            chain.push(holder);
            chain.extend_from_slice(parents);
            out.extend(shape(kind, &Scope { chain }));
        }
    }
}

/// Shapes described by an exported `visual` tree, root shapes first, then
/// those of indexed children in numeric order.
pub fn shapes(visual: &Json) -> Vec<Shape> {
    let Some(root) = visual.as_object() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    collect(root, &[], &mut out);
    for child in indexed(root) {
        collect(child, &[root], &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::f64::consts::FRAC_PI_2;

    fn close(a: Point, b: Point) -> bool {
        (a.x - b.x).abs() < 1e-9 && (a.y - b.y).abs() < 1e-9
    }

    #[test]
    fn line_end_falls_back_to_delta_then_length() {
        let tree = json!({
            "shape": { "line": {
                "0": { "start": { "x": 1.0, "y": 1.0 }, "end": { "x": 4.0, "y": 5.0 } },
                "1": { "start": { "x": 1.0, "y": 1.0 }, "delta": { "x": 2.0, "y": 0.0 } },
                "2": { "direction": FRAC_PI_2, "length": 3.0 },
                "3": { "start": { "x": 1.0, "y": 1.0 } }
            } }
        });
        let shapes = shapes(&tree);
        assert_eq!(shapes.len(), 3, "a line without an end is skipped");
        assert_eq!(
            shapes[0],
            Shape::Line {
                from: Point::new(1.0, 1.0),
                to: Point::new(4.0, 5.0)
            }
        );
        assert_eq!(
            shapes[1],
            Shape::Line {
                from: Point::new(1.0, 1.0),
                to: Point::new(3.0, 1.0)
            }
        );
        let Shape::Line { to, .. } = shapes[2] else {
            panic!("expected a line");
        };
        assert!(close(to, Point::new(0.0, 3.0)));
    }

    #[test]
    fn placement_is_inherited_from_child_then_root() {
        let tree = json!({
            "origin": { "x": 10.0, "y": 0.0 },
            "scale": 2.0,
            "0": {
                "origin": { "x": 0.0, "y": 10.0 },
                "shape": { "circle": { "radius": 1.5 } }
            },
            "shape": { "line": { "delta": { "_value": 1.0, "x": 1.0, "y": 0.0 } } }
        });
        let shapes = shapes(&tree);
        assert_eq!(
            shapes,
            vec![
                Shape::Line {
                    from: Point::new(10.0, 0.0),
                    to: Point::new(12.0, 0.0)
                },
                Shape::Circle {
                    center: Point::new(0.0, 10.0),
                    radius: 3.0
                },
            ]
        );
    }

    #[test]
    fn rotation_turns_points_and_arcs() {
        let tree = json!({
            "rotation": FRAC_PI_2,
            "shape": {
                "arc": { "radius": 1.0, "angle_end": 1.0 },
                "right_triangle": { "delta": { "x": 2.0, "y": 1.0 } }
            }
        });
        let shapes = shapes(&tree);
        assert_eq!(shapes.len(), 2);
        match &shapes[0] {
            Shape::Arc {
                angle_start,
                angle_end,
                ..
            } => {
                assert!((angle_start - FRAC_PI_2).abs() < 1e-9);
                assert!((angle_end - (1.0 + FRAC_PI_2)).abs() < 1e-9);
            }
            other => panic!("expected an arc, got {other:?}"),
        }
        let Shape::RightTriangle { vertices } = &shapes[1] else {
            panic!("expected a triangle");
        };
        assert!(close(vertices[0], Point::ORIGIN));
        assert!(close(vertices[1], Point::new(0.0, 2.0)));
        assert!(close(vertices[2], Point::new(-1.0, 2.0)));
    }

    #[test]
    fn non_objects_yield_nothing() {
        assert!(shapes(&Json::Null).is_empty());
        assert!(shapes(&json!({ "shape": { "hexagon": {} } })).is_empty());
    }
}
