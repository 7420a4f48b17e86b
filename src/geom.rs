use nalgebra::{Point2, Vector2};

/// A 2D axis-aligned bounding box.
///
/// An empty box has `min > max` and contains nothing; unioning it with
/// another box yields that box unchanged.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Point2<f64>,
    pub max: Point2<f64>,
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: Point2::new(f64::INFINITY, f64::INFINITY),
            max: Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point2<f64>>) -> Self {
        points
            .into_iter()
            .fold(Self::empty(), |aabb, p| aabb.grown(*p))
    }

    pub fn grown(&self, p: Point2<f64>) -> Self {
        Self {
            min: Point2::new(self.min.x.min(p.x), self.min.y.min(p.y)),
            max: Point2::new(self.max.x.max(p.x), self.max.y.max(p.y)),
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: Point2::new(self.min.x.min(other.min.x), self.min.y.min(other.min.y)),
            max: Point2::new(self.max.x.max(other.max.x), self.max.y.max(other.max.y)),
        }
    }

    pub fn contains(&self, p: Point2<f64>) -> bool {
        self.min.x <= p.x && p.x <= self.max.x && self.min.y <= p.y && p.y <= self.max.y
    }
}

fn edge_sign(p: Point2<f64>, a: Point2<f64>, b: Point2<f64>) -> f64 {
    (p.x - b.x) * (a.y - b.y) - (a.x - b.x) * (p.y - b.y)
}

/// Returns `true` if `p` lies inside the triangle `abc`, regardless of the
/// triangle's winding. Points exactly on an edge count as inside.
pub fn triangle_contains_point(
    p: Point2<f64>,
    a: Point2<f64>,
    b: Point2<f64>,
    c: Point2<f64>,
) -> bool {
    let d1 = edge_sign(p, a, b);
    let d2 = edge_sign(p, b, c);
    let d3 = edge_sign(p, c, a);

    let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
    let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;

    !(has_neg && has_pos)
}

/// Approximate overlap test between the circle at `center` with `radius` and
/// the triangle `abc`.
///
/// The test point starts at `center` and moves toward the triangle centroid
/// by at most `radius` before the containment test. This under-reports
/// overlap for slivers grazing the circle, which is acceptable for the
/// reject logic it backs.
pub fn triangle_overlaps_circle(
    center: Point2<f64>,
    radius: f64,
    a: Point2<f64>,
    b: Point2<f64>,
    c: Point2<f64>,
) -> bool {
    let centroid = Point2::from((a.coords + b.coords + c.coords) / 3.0);
    let toward: Vector2<f64> = centroid - center;
    let dist = toward.norm();

    let probe = if dist > 1e-12 {
        center + toward * (radius.min(dist) / dist)
    } else {
        center
    };

    triangle_contains_point(probe, a, b, c)
}
