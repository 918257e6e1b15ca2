//! Hitbox shapes.
//!
//! Circles, axis-aligned rectangles and convex polygons. Shapes are plain
//! values: transforms return a new hitbox, and [`Hitbox::scale`] is the only
//! in-place mutation (it re-derives everything a polygon caches).
//!
//! Pairwise tests live in [`crate::collision`]; this module owns the shapes,
//! their bounds and the segment casts.

use std::f32::consts::FRAC_PI_2;
use std::fmt;

use rand::Rng;

use crate::collision::{self, CollisionResponse};
use crate::math::{Vec2, EPSILON};

/// Closed set of shape kinds. Used to index the collision dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitboxKind {
    Circle = 0,
    Rect = 1,
    Polygon = 2,
}

/// Where a segment first touches a shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineIntersection {
    pub point: Vec2,
    /// Outward surface normal at `point`.
    pub normal: Vec2,
}

/// Invalid shape input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    TooFewVertices(usize),
    DegeneratePolygon,
    NotConvex,
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryError::TooFewVertices(n) => {
                write!(f, "polygon needs at least 3 vertices, got {n}")
            }
            GeometryError::DegeneratePolygon => write!(f, "polygon has zero area"),
            GeometryError::NotConvex => write!(f, "polygon is not convex"),
        }
    }
}

impl std::error::Error for GeometryError {}

// ─── Circle ───

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleHitbox {
    pub position: Vec2,
    pub radius: f32,
}

impl CircleHitbox {
    pub fn new(radius: f32, position: Vec2) -> Self {
        Self { position, radius }
    }

    pub fn to_rectangle(&self) -> RectangleHitbox {
        let r = Vec2::new(self.radius, self.radius);
        RectangleHitbox::new(self.position - r, self.position + r)
    }

    pub fn is_point_inside(&self, point: Vec2) -> bool {
        (point - self.position).len_sq() < self.radius * self.radius
    }

    pub fn intersects_line(&self, a: Vec2, b: Vec2) -> Option<LineIntersection> {
        let d = b - a;
        let f = a - self.position;
        let r_sq = self.radius * self.radius;
        let qa = d.len_sq();
        if qa < EPSILON * EPSILON {
            return (f.len_sq() <= r_sq).then(|| LineIntersection {
                point: a,
                normal: f.normalize(),
            });
        }

        let qb = 2.0 * f.dot(d);
        let qc = f.len_sq() - r_sq;
        let disc = qb * qb - 4.0 * qa * qc;
        if disc < 0.0 {
            return None;
        }
        let sq = disc.sqrt();
        let t1 = (-qb - sq) / (2.0 * qa);
        let t2 = (-qb + sq) / (2.0 * qa);

        if (0.0..=1.0).contains(&t1) {
            let point = a + d * t1;
            Some(LineIntersection {
                point,
                normal: (point - self.position).normalize(),
            })
        } else if t1 < 0.0 && t2 >= 0.0 {
            // Segment starts inside the circle.
            Some(LineIntersection {
                point: a,
                normal: f.normalize_or(-d.normalize()),
            })
        } else {
            None
        }
    }
}

// ─── Rectangle ───

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectangleHitbox {
    pub min: Vec2,
    pub max: Vec2,
}

impl RectangleHitbox {
    /// Builds a rectangle from two opposite corners in any order.
    pub fn new(a: Vec2, b: Vec2) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn from_center(center: Vec2, width: f32, height: f32) -> Self {
        let half = Vec2::new(width * 0.5, height * 0.5);
        Self::new(center - half, center + half)
    }

    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    /// Corners in counter-clockwise order.
    pub fn corners(&self) -> [Vec2; 4] {
        [
            self.min,
            Vec2::new(self.max.x, self.min.y),
            self.max,
            Vec2::new(self.min.x, self.max.y),
        ]
    }

    pub fn is_point_inside(&self, point: Vec2) -> bool {
        point.x > self.min.x && point.x < self.max.x && point.y > self.min.y && point.y < self.max.y
    }

    /// Inclusive overlap of two boxes. Touching edges count.
    pub fn overlaps_inclusive(&self, other: &RectangleHitbox) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    pub fn union(&self, other: &RectangleHitbox) -> RectangleHitbox {
        RectangleHitbox::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Slab test.
    pub fn intersects_line(&self, a: Vec2, b: Vec2) -> Option<LineIntersection> {
        let d = b - a;
        if d.len_sq() < EPSILON * EPSILON {
            return self.is_point_inside(a).then(|| LineIntersection {
                point: a,
                normal: (a - self.center()).normalize(),
            });
        }

        let mut t_min = 0.0f32;
        let mut t_max = 1.0f32;
        let mut normal = Vec2::ZERO;

        let axes = [
            (a.x, d.x, self.min.x, self.max.x, Vec2::new(1.0, 0.0)),
            (a.y, d.y, self.min.y, self.max.y, Vec2::new(0.0, 1.0)),
        ];
        for (origin, dir, lo, hi, unit) in axes {
            if dir.abs() < EPSILON {
                if origin < lo || origin > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / dir;
            let (mut t1, mut n1) = ((lo - origin) * inv, -unit);
            let (mut t2, _) = ((hi - origin) * inv, unit);
            if t1 > t2 {
                std::mem::swap(&mut t1, &mut t2);
                n1 = unit;
            }
            if t1 > t_min {
                t_min = t1;
                normal = n1;
            }
            t_max = t_max.min(t2);
            if t_min > t_max {
                return None;
            }
        }

        if normal == Vec2::ZERO {
            // Segment starts inside the rectangle.
            return Some(LineIntersection {
                point: a,
                normal: -d.normalize(),
            });
        }
        Some(LineIntersection {
            point: a + d * t_min,
            normal,
        })
    }
}

// ─── Polygon ───

/// Convex polygon with counter-clockwise vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonHitbox {
    verts: Vec<Vec2>,
    normals: Vec<Vec2>,
    center: Vec2,
    bounds: RectangleHitbox,
}

impl PolygonHitbox {
    /// Builds a polygon, reversing clockwise input.
    pub fn new(verts: Vec<Vec2>) -> Result<Self, GeometryError> {
        if verts.len() < 3 {
            return Err(GeometryError::TooFewVertices(verts.len()));
        }
        let mut verts = verts;
        let area = signed_area(&verts);
        if area.abs() < EPSILON {
            return Err(GeometryError::DegeneratePolygon);
        }
        if area < 0.0 {
            verts.reverse();
        }
        let n = verts.len();
        let convex = (0..n).all(|i| {
            let e1 = verts[(i + 1) % n] - verts[i];
            let e2 = verts[(i + 2) % n] - verts[(i + 1) % n];
            e1.cross(e2) >= -EPSILON
        });
        if !convex {
            return Err(GeometryError::NotConvex);
        }

        let mut poly = Self {
            verts,
            normals: Vec::new(),
            center: Vec2::ZERO,
            bounds: RectangleHitbox::new(Vec2::ZERO, Vec2::ZERO),
        };
        poly.derive();
        Ok(poly)
    }

    /// Rectangles are always valid polygons.
    pub fn from_rect(rect: &RectangleHitbox) -> Self {
        let mut poly = Self {
            verts: rect.corners().to_vec(),
            normals: Vec::new(),
            center: Vec2::ZERO,
            bounds: *rect,
        };
        poly.derive();
        poly
    }

    fn derive(&mut self) {
        let n = self.verts.len();
        self.normals = (0..n)
            .map(|i| {
                let edge = self.verts[(i + 1) % n] - self.verts[i];
                Vec2::new(edge.y, -edge.x).normalize()
            })
            .collect();
        self.center = centroid(&self.verts);
        let mut min = self.verts[0];
        let mut max = self.verts[0];
        for v in &self.verts[1..] {
            min = min.min(*v);
            max = max.max(*v);
        }
        self.bounds = RectangleHitbox::new(min, max);
    }

    pub fn verts(&self) -> &[Vec2] {
        &self.verts
    }

    /// Outward edge normals; `normals()[i]` belongs to edge `verts[i] -> verts[i + 1]`.
    pub fn normals(&self) -> &[Vec2] {
        &self.normals
    }

    pub fn center(&self) -> Vec2 {
        self.center
    }

    pub fn bounds(&self) -> RectangleHitbox {
        self.bounds
    }

    pub fn is_point_inside(&self, point: Vec2) -> bool {
        self.verts
            .iter()
            .zip(&self.normals)
            .all(|(v, n)| (point - *v).dot(*n) < 0.0)
    }

    pub fn intersects_line(&self, a: Vec2, b: Vec2) -> Option<LineIntersection> {
        let r = b - a;
        if r.len_sq() < EPSILON * EPSILON {
            return self.is_point_inside(a).then(|| LineIntersection {
                point: a,
                normal: (a - self.center).normalize(),
            });
        }

        let n = self.verts.len();
        let mut best: Option<(f32, usize)> = None;
        for i in 0..n {
            let q = self.verts[i];
            let s = self.verts[(i + 1) % n] - q;
            let denom = r.cross(s);
            if denom.abs() < EPSILON {
                continue;
            }
            let qa = q - a;
            let t = qa.cross(s) / denom;
            let u = qa.cross(r) / denom;
            if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
                if best.map_or(true, |(bt, _)| t < bt) {
                    best = Some((t, i));
                }
            }
        }

        match best {
            Some((t, i)) => Some(LineIntersection {
                point: a + r * t,
                normal: self.normals[i],
            }),
            None => None,
        }
    }
}

fn signed_area(verts: &[Vec2]) -> f32 {
    let n = verts.len();
    (0..n)
        .map(|i| verts[i].cross(verts[(i + 1) % n]))
        .sum::<f32>()
        * 0.5
}

fn centroid(verts: &[Vec2]) -> Vec2 {
    let n = verts.len();
    let area = signed_area(verts);
    if area.abs() < EPSILON {
        let sum = verts.iter().fold(Vec2::ZERO, |acc, v| acc + *v);
        return sum * (1.0 / n as f32);
    }
    let mut c = Vec2::ZERO;
    for i in 0..n {
        let (p, q) = (verts[i], verts[(i + 1) % n]);
        let w = p.cross(q);
        c += (p + q) * w;
    }
    c * (1.0 / (6.0 * area))
}

// ─── Hitbox ───

#[derive(Debug, Clone, PartialEq)]
pub enum Hitbox {
    Circle(CircleHitbox),
    Rect(RectangleHitbox),
    Polygon(PolygonHitbox),
}

impl Hitbox {
    pub fn circle(radius: f32, position: Vec2) -> Self {
        Hitbox::Circle(CircleHitbox::new(radius, position))
    }

    pub fn rect(min: Vec2, max: Vec2) -> Self {
        Hitbox::Rect(RectangleHitbox::new(min, max))
    }

    pub fn polygon(verts: Vec<Vec2>) -> Result<Self, GeometryError> {
        PolygonHitbox::new(verts).map(Hitbox::Polygon)
    }

    pub fn kind(&self) -> HitboxKind {
        match self {
            Hitbox::Circle(_) => HitboxKind::Circle,
            Hitbox::Rect(_) => HitboxKind::Rect,
            Hitbox::Polygon(_) => HitboxKind::Polygon,
        }
    }

    /// Boolean overlap test.
    pub fn collides_with(&self, other: &Hitbox) -> bool {
        collision::overlaps(self, other)
    }

    /// Penetration response; the normal points from `self` toward `other`.
    pub fn intersection(&self, other: &Hitbox) -> Option<CollisionResponse> {
        collision::intersection(self, other)
    }

    /// First point where the segment `a -> b` touches this shape.
    pub fn intersects_line(&self, a: Vec2, b: Vec2) -> Option<LineIntersection> {
        match self {
            Hitbox::Circle(c) => c.intersects_line(a, b),
            Hitbox::Rect(r) => r.intersects_line(a, b),
            Hitbox::Polygon(p) => p.intersects_line(a, b),
        }
    }

    /// Axis-aligned bounds.
    pub fn to_rectangle(&self) -> RectangleHitbox {
        match self {
            Hitbox::Circle(c) => c.to_rectangle(),
            Hitbox::Rect(r) => *r,
            Hitbox::Polygon(p) => p.bounds,
        }
    }

    pub fn center(&self) -> Vec2 {
        match self {
            Hitbox::Circle(c) => c.position,
            Hitbox::Rect(r) => r.center(),
            Hitbox::Polygon(p) => p.center,
        }
    }

    pub fn is_point_inside(&self, point: Vec2) -> bool {
        match self {
            Hitbox::Circle(c) => c.is_point_inside(point),
            Hitbox::Rect(r) => r.is_point_inside(point),
            Hitbox::Polygon(p) => p.is_point_inside(point),
        }
    }

    /// Returns a copy moved by `offset`.
    pub fn translate(&self, offset: Vec2) -> Hitbox {
        self.transform(offset, 1.0, 0.0)
    }

    /// Scales by `scale`, rotates by `rotation` around the origin, then moves
    /// by `position`. Rectangles rotated off a right angle become polygons.
    ///
    /// # Panics
    /// If `scale` is not positive.
    pub fn transform(&self, position: Vec2, scale: f32, rotation: f32) -> Hitbox {
        assert!(scale > 0.0, "hitbox scale must be positive, got {scale}");
        let map = |v: Vec2| (v * scale).rotate(rotation) + position;
        match self {
            Hitbox::Circle(c) => Hitbox::Circle(CircleHitbox::new(c.radius * scale, map(c.position))),
            Hitbox::Rect(r) => {
                let quarter_turns = rotation / FRAC_PI_2;
                if (quarter_turns - quarter_turns.round()).abs() < 1e-4 {
                    Hitbox::Rect(RectangleHitbox::new(map(r.min), map(r.max)))
                } else {
                    let mut poly = PolygonHitbox::from_rect(r);
                    poly.verts = poly.verts.iter().map(|v| map(*v)).collect();
                    poly.derive();
                    Hitbox::Polygon(poly)
                }
            }
            Hitbox::Polygon(p) => {
                let mut poly = p.clone();
                poly.verts = p.verts.iter().map(|v| map(*v)).collect();
                poly.derive();
                Hitbox::Polygon(poly)
            }
        }
    }

    /// Scales in place around the shape's centre.
    pub fn scale(&mut self, factor: f32) {
        assert!(factor > 0.0, "hitbox scale must be positive, got {factor}");
        match self {
            Hitbox::Circle(c) => c.radius *= factor,
            Hitbox::Rect(r) => {
                let center = r.center();
                *r = RectangleHitbox::new(
                    center + (r.min - center) * factor,
                    center + (r.max - center) * factor,
                );
            }
            Hitbox::Polygon(p) => {
                let center = p.center;
                for v in &mut p.verts {
                    *v = center + (*v - center) * factor;
                }
                p.derive();
            }
        }
    }

    /// Uniformly sampled point inside the shape.
    pub fn random_point<R: Rng>(&self, rng: &mut R) -> Vec2 {
        match self {
            Hitbox::Circle(c) => {
                let angle = rng.gen_range(0.0..std::f32::consts::TAU);
                let dist = c.radius * rng.gen::<f32>().sqrt();
                c.position + Vec2::from_angle(angle) * dist
            }
            Hitbox::Rect(r) => Vec2::new(
                rng.gen_range(r.min.x..=r.max.x),
                rng.gen_range(r.min.y..=r.max.y),
            ),
            Hitbox::Polygon(p) => {
                for _ in 0..64 {
                    let candidate = Vec2::new(
                        rng.gen_range(p.bounds.min.x..=p.bounds.max.x),
                        rng.gen_range(p.bounds.min.y..=p.bounds.max.y),
                    );
                    if p.is_point_inside(candidate) {
                        return candidate;
                    }
                }
                p.center
            }
        }
    }
}
