//! Pairwise collision kernel.
//!
//! Every ordered pair of [`HitboxKind`]s has an entry in two dispatch
//! tables: a boolean overlap test and a penetration test. Mirrored pairs
//! reuse their counterpart and negate the normal, so
//! `intersection(a, b).normal == -intersection(b, a).normal`.
//!
//! Normal convention: the response normal points from A toward B. Moving B
//! by `normal * penetration` (or A by the negation) separates the shapes.

use crate::hitbox::{CircleHitbox, Hitbox, HitboxKind, PolygonHitbox, RectangleHitbox};
use crate::math::{Vec2, EPSILON};

/// Penetration response for two overlapping shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionResponse {
    /// Unit vector from A toward B.
    pub normal: Vec2,
    /// Overlap depth along `normal`, never negative.
    pub penetration: f32,
}

impl CollisionResponse {
    fn flipped(self) -> Self {
        Self {
            normal: -self.normal,
            penetration: self.penetration,
        }
    }
}

type OverlapFn = fn(&Hitbox, &Hitbox) -> bool;
type IntersectionFn = fn(&Hitbox, &Hitbox) -> Option<CollisionResponse>;

const OVERLAP_TABLE: [[OverlapFn; 3]; 3] = [
    [
        |a, b| circle_circle_overlap(circle(a), circle(b)),
        |a, b| rect_circle_overlap(rect(b), circle(a)),
        |a, b| intersection(a, b).is_some(),
    ],
    [
        |a, b| rect_circle_overlap(rect(a), circle(b)),
        |a, b| rect_rect_overlap(rect(a), rect(b)),
        |a, b| intersection(a, b).is_some(),
    ],
    [
        |a, b| intersection(a, b).is_some(),
        |a, b| intersection(a, b).is_some(),
        |a, b| intersection(a, b).is_some(),
    ],
];

const INTERSECTION_TABLE: [[IntersectionFn; 3]; 3] = [
    [
        |a, b| circle_circle(circle(a), circle(b)),
        |a, b| rect_circle(rect(b), circle(a)).map(CollisionResponse::flipped),
        |a, b| circle_polygon(circle(a), polygon(b)),
    ],
    [
        |a, b| rect_circle(rect(a), circle(b)),
        |a, b| rect_rect(rect(a), rect(b)),
        |a, b| polygon_polygon(&PolygonHitbox::from_rect(rect(a)), polygon(b)),
    ],
    [
        |a, b| circle_polygon(circle(b), polygon(a)).map(CollisionResponse::flipped),
        |a, b| polygon_polygon(polygon(a), &PolygonHitbox::from_rect(rect(b))),
        |a, b| polygon_polygon(polygon(a), polygon(b)),
    ],
];

/// Boolean overlap test. Touching shapes do not overlap.
pub fn overlaps(a: &Hitbox, b: &Hitbox) -> bool {
    OVERLAP_TABLE[a.kind() as usize][b.kind() as usize](a, b)
}

/// Penetration test; `None` when the shapes do not overlap.
pub fn intersection(a: &Hitbox, b: &Hitbox) -> Option<CollisionResponse> {
    INTERSECTION_TABLE[a.kind() as usize][b.kind() as usize](a, b)
}

fn circle(h: &Hitbox) -> &CircleHitbox {
    match h {
        Hitbox::Circle(c) => c,
        other => unreachable!("dispatch expected circle, got {:?}", other.kind()),
    }
}

fn rect(h: &Hitbox) -> &RectangleHitbox {
    match h {
        Hitbox::Rect(r) => r,
        other => unreachable!("dispatch expected rect, got {:?}", other.kind()),
    }
}

fn polygon(h: &Hitbox) -> &PolygonHitbox {
    match h {
        Hitbox::Polygon(p) => p,
        other => unreachable!("dispatch expected polygon, got {:?}", other.kind()),
    }
}

// ─── Boolean tests ───

fn circle_circle_overlap(a: &CircleHitbox, b: &CircleHitbox) -> bool {
    let r = a.radius + b.radius;
    (b.position - a.position).len_sq() < r * r
}

fn rect_circle_overlap(r: &RectangleHitbox, c: &CircleHitbox) -> bool {
    let closest = c.position.clamp(r.min, r.max);
    (c.position - closest).len_sq() < c.radius * c.radius || r.is_point_inside(c.position)
}

fn rect_rect_overlap(a: &RectangleHitbox, b: &RectangleHitbox) -> bool {
    a.min.x < b.max.x && a.max.x > b.min.x && a.min.y < b.max.y && a.max.y > b.min.y
}

// ─── Penetration tests ───

fn circle_circle(a: &CircleHitbox, b: &CircleHitbox) -> Option<CollisionResponse> {
    if !circle_circle_overlap(a, b) {
        return None;
    }
    let d = b.position - a.position;
    Some(CollisionResponse {
        normal: d.normalize(),
        penetration: a.radius + b.radius - d.len(),
    })
}

/// Rectangle A, circle B. A circle whose centre is inside the rectangle is
/// pushed toward the nearest edge.
fn rect_circle(r: &RectangleHitbox, c: &CircleHitbox) -> Option<CollisionResponse> {
    let pos = c.position;
    let inside = pos.x >= r.min.x && pos.x <= r.max.x && pos.y >= r.min.y && pos.y <= r.max.y;
    if inside {
        let half = (r.max - r.min) * 0.5;
        let p = pos - (r.min + half);
        let xp = p.x.abs() - half.x - c.radius;
        let yp = p.y.abs() - half.y - c.radius;
        let sign = |v: f32| if v >= 0.0 { 1.0 } else { -1.0 };
        return Some(if xp > yp {
            CollisionResponse {
                normal: Vec2::new(sign(p.x), 0.0),
                penetration: -xp,
            }
        } else {
            CollisionResponse {
                normal: Vec2::new(0.0, sign(p.y)),
                penetration: -yp,
            }
        });
    }

    let closest = pos.clamp(r.min, r.max);
    let d = pos - closest;
    let dist_sq = d.len_sq();
    if dist_sq >= c.radius * c.radius {
        return None;
    }
    let dist = dist_sq.sqrt();
    Some(CollisionResponse {
        normal: d.normalize(),
        penetration: c.radius - dist,
    })
}

fn rect_rect(a: &RectangleHitbox, b: &RectangleHitbox) -> Option<CollisionResponse> {
    if !rect_rect_overlap(a, b) {
        return None;
    }
    let axes = [
        (Vec2::new(1.0, 0.0), (a.min.x, a.max.x), (b.min.x, b.max.x)),
        (Vec2::new(0.0, 1.0), (a.min.y, a.max.y), (b.min.y, b.max.y)),
    ];
    let mut best: Option<CollisionResponse> = None;
    for (axis, ia, ib) in axes {
        let overlap = (ia.1 - ib.0).min(ib.1 - ia.0);
        if best.map_or(true, |r| overlap < r.penetration) {
            best = Some(CollisionResponse {
                normal: orient(axis, a.center(), b.center(), ia, ib),
                penetration: overlap,
            });
        }
    }
    best
}

fn circle_polygon(c: &CircleHitbox, p: &PolygonHitbox) -> Option<CollisionResponse> {
    let nearest = p
        .verts()
        .iter()
        .copied()
        .min_by(|x, y| {
            (*x - c.position)
                .len_sq()
                .total_cmp(&(*y - c.position).len_sq())
        })
        .unwrap_or(p.center());

    let mut axes: Vec<Vec2> = p.normals().to_vec();
    let to_vertex = nearest - c.position;
    if to_vertex.len_sq() > EPSILON * EPSILON {
        axes.push(to_vertex.normalize());
    }

    let mut best: Option<(f32, Vec2, (f32, f32), (f32, f32))> = None;
    for axis in axes {
        let center = c.position.dot(axis);
        let ia = (center - c.radius, center + c.radius);
        let ib = project(p.verts(), axis);
        let overlap = (ia.1 - ib.0).min(ib.1 - ia.0);
        if overlap <= 0.0 {
            return None;
        }
        if best.map_or(true, |(o, ..)| overlap < o) {
            best = Some((overlap, axis, ia, ib));
        }
    }

    best.map(|(overlap, axis, ia, ib)| CollisionResponse {
        normal: orient(axis, c.position, p.center(), ia, ib),
        penetration: overlap,
    })
}

fn polygon_polygon(a: &PolygonHitbox, b: &PolygonHitbox) -> Option<CollisionResponse> {
    let mut best: Option<(f32, Vec2, (f32, f32), (f32, f32))> = None;
    for &axis in a.normals().iter().chain(b.normals()) {
        let ia = project(a.verts(), axis);
        let ib = project(b.verts(), axis);
        let overlap = (ia.1 - ib.0).min(ib.1 - ia.0);
        if overlap <= 0.0 {
            return None;
        }
        if best.map_or(true, |(o, ..)| overlap < o) {
            best = Some((overlap, axis, ia, ib));
        }
    }

    best.map(|(overlap, axis, ia, ib)| CollisionResponse {
        normal: orient(axis, a.center(), b.center(), ia, ib),
        penetration: overlap,
    })
}

fn project(verts: &[Vec2], axis: Vec2) -> (f32, f32) {
    verts.iter().fold((f32::MAX, f32::MIN), |(lo, hi), v| {
        let d = v.dot(axis);
        (lo.min(d), hi.max(d))
    })
}

/// Orients `axis` from A's centre toward B's centre. When the centres
/// coincide along the axis, B is pushed out of the nearer side.
fn orient(axis: Vec2, a_center: Vec2, b_center: Vec2, ia: (f32, f32), ib: (f32, f32)) -> Vec2 {
    let d = (b_center - a_center).dot(axis);
    if d > EPSILON {
        axis
    } else if d < -EPSILON {
        -axis
    } else if ia.1 - ib.0 <= ib.1 - ia.0 {
        axis
    } else {
        -axis
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn v(x: f32, y: f32) -> Vec2 {
        Vec2::new(x, y)
    }

    fn random_hitbox(rng: &mut StdRng) -> Hitbox {
        let center = v(rng.gen_range(0.0..20.0), rng.gen_range(0.0..20.0));
        match rng.gen_range(0..3) {
            0 => Hitbox::circle(rng.gen_range(0.5..5.0), center),
            1 => Hitbox::Rect(RectangleHitbox::from_center(
                center,
                rng.gen_range(1.0..8.0),
                rng.gen_range(1.0..8.0),
            )),
            _ => {
                let sides = rng.gen_range(3..8);
                let radius = rng.gen_range(1.0..5.0);
                let rotation = rng.gen_range(0.0..1.0);
                let verts = (0..sides)
                    .map(|i| {
                        let angle = rotation + i as f32 * std::f32::consts::TAU / sides as f32;
                        center + Vec2::from_angle(angle) * radius
                    })
                    .collect();
                Hitbox::polygon(verts).unwrap()
            }
        }
    }

    #[test]
    fn circle_inside_rect_pushes_toward_nearest_edge() {
        let rect = Hitbox::rect(v(0.0, 0.0), v(10.0, 10.0));
        let circle = Hitbox::circle(2.0, v(5.0, 5.0));

        let hit = rect.intersection(&circle).unwrap();
        // Every edge is 5 away; penetration is that distance plus the radius.
        assert!((hit.penetration - 7.0).abs() < 1e-5);
        assert!((hit.normal.len() - 1.0).abs() < 1e-6);

        let off_center = Hitbox::circle(2.0, v(2.0, 5.0));
        let hit = rect.intersection(&off_center).unwrap();
        assert_eq!(hit.normal, v(-1.0, 0.0));
        assert!((hit.penetration - 4.0).abs() < 1e-5);

        let reverse = off_center.intersection(&rect).unwrap();
        assert_eq!(reverse.normal, v(1.0, 0.0));
    }

    #[test]
    fn circle_circle_penetration() {
        let a = Hitbox::circle(1.0, v(0.0, 0.0));
        let b = Hitbox::circle(1.0, v(1.5, 0.0));
        let hit = a.intersection(&b).unwrap();
        assert!(hit.normal.approx_eq(v(1.0, 0.0), 1e-6));
        assert!((hit.penetration - 0.5).abs() < 1e-6);
        assert!(!a.collides_with(&Hitbox::circle(1.0, v(2.0, 0.0))));
    }

    #[test]
    fn rect_rect_picks_smallest_axis() {
        let a = Hitbox::rect(v(0.0, 0.0), v(4.0, 4.0));
        let b = Hitbox::rect(v(3.0, 1.0), v(7.0, 3.0));
        let hit = a.intersection(&b).unwrap();
        assert_eq!(hit.normal, v(1.0, 0.0));
        assert!((hit.penetration - 1.0).abs() < 1e-6);
    }

    #[test]
    fn polygon_polygon_separated_by_axis() {
        let a = Hitbox::polygon(vec![v(0.0, 0.0), v(2.0, 0.0), v(1.0, 2.0)]).unwrap();
        let b = a.translate(v(3.0, 0.0));
        assert!(!a.collides_with(&b));
        let c = a.translate(v(1.0, 0.0));
        let hit = a.intersection(&c).unwrap();
        assert!(hit.normal.x > 0.0);
        assert!(hit.penetration > 0.0);
    }

    #[test]
    fn circle_polygon_uses_vertex_axis() {
        let square = Hitbox::polygon(vec![v(0.0, 0.0), v(2.0, 0.0), v(2.0, 2.0), v(0.0, 2.0)]).unwrap();
        // Near the corner diagonally: edge axes overlap, the vertex axis does not.
        let circle = Hitbox::circle(1.0, v(2.8, 2.8));
        assert!(!circle.collides_with(&square));
        let touching = Hitbox::circle(1.0, v(2.5, 2.5));
        let hit = touching.intersection(&square).unwrap();
        assert!(hit.normal.x < 0.0 && hit.normal.y < 0.0);
    }

    #[test]
    fn rect_polygon_entries_are_registered() {
        let rect = Hitbox::rect(v(0.0, 0.0), v(2.0, 2.0));
        let tri = Hitbox::polygon(vec![v(1.0, 1.0), v(4.0, 1.0), v(1.0, 4.0)]).unwrap();
        assert!(rect.collides_with(&tri));
        assert!(tri.collides_with(&rect));
    }

    #[test]
    fn overlap_and_intersection_are_symmetric() {
        let mut rng = StdRng::seed_from_u64(1234);
        for _ in 0..2000 {
            let a = random_hitbox(&mut rng);
            let b = random_hitbox(&mut rng);
            if a.center().approx_eq(b.center(), 1e-3) {
                continue;
            }
            assert_eq!(a.collides_with(&b), b.collides_with(&a), "{a:?} vs {b:?}");

            match (a.intersection(&b), b.intersection(&a)) {
                (Some(ab), Some(ba)) => {
                    assert!(ab.normal.approx_eq(-ba.normal, 1e-4), "{a:?} vs {b:?}");
                    assert!((ab.penetration - ba.penetration).abs() < 1e-3);
                    assert!(ab.penetration >= 0.0);
                }
                (None, None) => {}
                other => panic!("asymmetric intersection {other:?} for {a:?} vs {b:?}"),
            }
        }
    }

    #[test]
    fn overlap_agrees_with_intersection() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..2000 {
            let a = random_hitbox(&mut rng);
            let b = random_hitbox(&mut rng);
            assert_eq!(a.collides_with(&b), a.intersection(&b).is_some(), "{a:?} vs {b:?}");
        }
    }
}
