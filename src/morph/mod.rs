//! A deformable regular grid mapping between two vertex tables.
//!
//! The grid is built over the unit square in uv space. Registration nudges
//! the observed table away from the canonical one to absorb residual
//! misalignment, and feathering writes the per-vertex alpha ramp that hides
//! seams between overlapping images.

mod tree;

use crate::geom::{self, Aabb};
use nalgebra::{Matrix3, Point2, Vector3};
use std::collections::VecDeque;
use tree::TriangleTree;

/// Which of the grid's two vertex tables a query reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    /// The undeformed grid positions ("in").
    Canonical,

    /// The positions after registration correction ("out").
    Observed,
}

impl Table {
    fn index(self) -> usize {
        match self {
            Table::Canonical => 0,
            Table::Observed => 1,
        }
    }
}

/// One grid vertex.
#[derive(Clone, Copy, Debug)]
pub struct MorphVertex {
    canonical: Point2<f64>,
    observed: Point2<f64>,
    alpha: f64,
    covered: bool,
    interior_distance: i32,
}

impl MorphVertex {
    pub fn canonical(&self) -> Point2<f64> {
        self.canonical
    }

    pub fn observed(&self) -> Point2<f64> {
        self.observed
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn covered(&self) -> bool {
        self.covered
    }

    /// Flood-fill distance from the nearest uncovered vertex; -1 until
    /// [`MorphGrid::fill_alpha`] has run.
    pub fn interior_distance(&self) -> i32 {
        self.interior_distance
    }

    fn position(&self, table: Table) -> Point2<f64> {
        match table {
            Table::Canonical => self.canonical,
            Table::Observed => self.observed,
        }
    }
}

/// A triangle over the vertex pool, with cached per-table bounds and
/// barycentric matrices.
pub(crate) struct MorphTriangle {
    verts: [usize; 3],
    bounds: [Aabb; 2],
    // Cartesian-to-barycentric; None while the triangle is collapsed.
    to_bary: [Option<Matrix3<f64>>; 2],
    from_bary: [Matrix3<f64>; 2],
}

impl MorphTriangle {
    fn new(verts: [usize; 3], vertices: &[MorphVertex]) -> Self {
        let mut tri = Self {
            verts,
            bounds: [Aabb::empty(); 2],
            to_bary: [None; 2],
            from_bary: [Matrix3::identity(); 2],
        };
        tri.refresh(vertices);
        tri
    }

    fn refresh(&mut self, vertices: &[MorphVertex]) {
        for table in [Table::Canonical, Table::Observed] {
            let [a, b, c] = self.verts.map(|v| vertices[v].position(table));
            let i = table.index();
            self.bounds[i] = Aabb::from_points([&a, &b, &c]);
            self.from_bary[i] = Matrix3::new(
                a.x, b.x, c.x, //
                a.y, b.y, c.y, //
                1.0, 1.0, 1.0,
            );
            self.to_bary[i] = self.from_bary[i].try_inverse();
        }
    }

    pub(crate) fn bounds(&self, table: Table) -> &Aabb {
        &self.bounds[table.index()]
    }

    pub(crate) fn contains(&self, p: Point2<f64>, table: Table, vertices: &[MorphVertex]) -> bool {
        if !self.bounds(table).contains(p) {
            return false;
        }
        let [a, b, c] = self.verts.map(|v| vertices[v].position(table));
        geom::triangle_contains_point(p, a, b, c)
    }

    fn barycentric(&self, p: Point2<f64>, table: Table) -> Option<Vector3<f64>> {
        Some(self.to_bary[table.index()]? * Vector3::new(p.x, p.y, 1.0))
    }

    fn point_from_barycentric(&self, bary: Vector3<f64>, table: Table) -> Point2<f64> {
        let v = self.from_bary[table.index()] * bary;
        Point2::new(v.x, v.y)
    }
}

/// The last triangle a lookup landed in.
///
/// Callers thread one of these through consecutive queries; nearby points
/// usually share a triangle, skipping the tree descent. The cache is purely
/// advisory and never required for a correct answer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TriangleCache {
    last: Option<usize>,
}

/// A regular deformable grid with point location, two-table barycentric
/// morphing, and the edge-feathering alpha fill.
pub struct MorphGrid {
    x_verts: usize,
    y_verts: usize,
    vertices: Vec<MorphVertex>,
    triangles: Vec<MorphTriangle>,
    tree: TriangleTree,
}

impl MorphGrid {
    /// Builds an `x_verts` by `y_verts` grid over the unit square, observed
    /// table coincident with the canonical one.
    ///
    /// Both sides need at least two vertices.
    pub fn new(x_verts: usize, y_verts: usize) -> Self {
        assert!(
            x_verts >= 2 && y_verts >= 2,
            "a morph grid needs at least 2x2 vertices"
        );

        let mut vertices = Vec::with_capacity(x_verts * y_verts);
        for j in 0..y_verts {
            for i in 0..x_verts {
                let p = Point2::new(
                    i as f64 / (x_verts - 1) as f64,
                    j as f64 / (y_verts - 1) as f64,
                );
                vertices.push(MorphVertex {
                    canonical: p,
                    observed: p,
                    alpha: 1.0,
                    covered: false,
                    interior_distance: -1,
                });
            }
        }

        let (cells_x, cells_y) = (x_verts - 1, y_verts - 1);
        let mut triangles = Vec::with_capacity(cells_x * cells_y * 2);
        for cy in 0..cells_y {
            for cx in 0..cells_x {
                let v00 = cy * x_verts + cx;
                let v10 = v00 + 1;
                let v01 = v00 + x_verts;
                let v11 = v01 + 1;
                triangles.push(MorphTriangle::new([v00, v10, v11], &vertices));
                triangles.push(MorphTriangle::new([v00, v11, v01], &vertices));
            }
        }

        let tree = TriangleTree::build(cells_x, cells_y, &triangles);
        Self {
            x_verts,
            y_verts,
            vertices,
            triangles,
            tree,
        }
    }

    pub fn x_verts(&self) -> usize {
        self.x_verts
    }

    pub fn y_verts(&self) -> usize {
        self.y_verts
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn vertex(&self, i: usize, j: usize) -> &MorphVertex {
        &self.vertices[j * self.x_verts + i]
    }

    pub fn set_covered(&mut self, i: usize, j: usize, covered: bool) {
        self.vertices[j * self.x_verts + i].covered = covered;
    }

    /// Replaces every observed position with `f(i, j, canonical)` and
    /// rebuilds the triangle caches and tree bounds.
    pub fn warp_observed(&mut self, mut f: impl FnMut(usize, usize, Point2<f64>) -> Point2<f64>) {
        for j in 0..self.y_verts {
            for i in 0..self.x_verts {
                let v = &mut self.vertices[j * self.x_verts + i];
                v.observed = f(i, j, v.canonical);
            }
        }
        for tri in &mut self.triangles {
            tri.refresh(&self.vertices);
        }
        self.tree = TriangleTree::build(self.x_verts - 1, self.y_verts - 1, &self.triangles);
    }

    fn locate(&self, p: Point2<f64>, table: Table, cache: &mut TriangleCache) -> Option<usize> {
        if let Some(t) = cache.last {
            if self.triangles[t].contains(p, table, &self.vertices) {
                return Some(t);
            }
        }
        let found = self.tree.locate(p, table, &self.triangles, &self.vertices);
        if found.is_some() {
            cache.last = found;
        }
        found
    }

    /// Maps `p` from one table to the other through its containing
    /// triangle. A point outside the grid comes back unchanged.
    pub fn morph_point(
        &self,
        p: Point2<f64>,
        from: Table,
        to: Table,
        cache: &mut TriangleCache,
    ) -> Point2<f64> {
        let Some(t) = self.locate(p, from, cache) else {
            return p;
        };
        let tri = &self.triangles[t];
        match tri.barycentric(p, from) {
            Some(bary) => tri.point_from_barycentric(bary, to),
            None => p,
        }
    }

    /// Interpolated alpha of the triangle containing `p`; 1.0 outside the
    /// grid.
    pub fn get_alpha(&self, p: Point2<f64>, table: Table, cache: &mut TriangleCache) -> f64 {
        let Some(t) = self.locate(p, table, cache) else {
            return 1.0;
        };
        let tri = &self.triangles[t];
        let Some(bary) = tri.barycentric(p, table) else {
            return 1.0;
        };
        let [a0, a1, a2] = tri.verts.map(|v| self.vertices[v].alpha);
        (bary.x * a0 + bary.y * a1 + bary.z * a2).clamp(0.0, 1.0)
    }

    /// Writes the feathering alpha ramp from the covered flags.
    ///
    /// A flood fill from every uncovered vertex assigns each vertex its
    /// distance from the interior; alpha then ramps on a half cosine from
    /// 1.0 at the interior to 0.0 at the grid edge, with one ring of slack
    /// next to the interior. A grid with no interior at all instead forces
    /// its four border rows and columns to zero.
    pub fn fill_alpha(&mut self) {
        let (nx, ny) = (self.x_verts, self.y_verts);

        if self.vertices.iter().all(|v| v.covered) {
            for j in 0..ny {
                for i in 0..nx {
                    if i == 0 || j == 0 || i == nx - 1 || j == ny - 1 {
                        self.vertices[j * nx + i].alpha = 0.0;
                    }
                }
            }
            return;
        }

        for v in &mut self.vertices {
            v.interior_distance = -1;
        }
        let mut queue = VecDeque::new();
        for idx in 0..self.vertices.len() {
            if !self.vertices[idx].covered {
                self.vertices[idx].interior_distance = 0;
                queue.push_back(idx);
            }
        }
        while let Some(idx) = queue.pop_front() {
            let next = self.vertices[idx].interior_distance + 1;
            let (i, j) = (idx % nx, idx / nx);
            let mut visit = |ni: usize, nj: usize| {
                let nidx = nj * nx + ni;
                if self.vertices[nidx].interior_distance < 0 {
                    self.vertices[nidx].interior_distance = next;
                    queue.push_back(nidx);
                }
            };
            if i > 0 {
                visit(i - 1, j);
            }
            if i + 1 < nx {
                visit(i + 1, j);
            }
            if j > 0 {
                visit(i, j - 1);
            }
            if j + 1 < ny {
                visit(i, j + 1);
            }
        }

        for j in 0..ny {
            for i in 0..nx {
                let idx = j * nx + i;
                // Anything the fill never reached stays interior.
                let d_int = self.vertices[idx].interior_distance.max(0);
                self.vertices[idx].alpha = if d_int == 0 {
                    1.0
                } else {
                    let d_edge = i.min(j).min(nx - 1 - i).min(ny - 1 - j);
                    if d_edge == 0 {
                        0.0
                    } else {
                        let di = (d_int - 1) as f64;
                        let ratio = di / (di + d_edge as f64);
                        ((ratio * std::f64::consts::PI).cos() + 1.0) / 2.0
                    }
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;
    use rstest::rstest;

    #[rstest]
    #[case(2, 2)]
    #[case(3, 3)]
    #[case(5, 4)]
    #[case(9, 2)]
    fn triangle_count_invariant(#[case] nx: usize, #[case] ny: usize) {
        let grid = MorphGrid::new(nx, ny);
        assert_eq!(grid.triangle_count(), (nx - 1) * (ny - 1) * 2);
    }

    #[test]
    fn identity_morph_on_fresh_grid() {
        let grid = MorphGrid::new(4, 4);
        let mut cache = TriangleCache::default();
        let p = Point2::new(0.37, 0.81);
        let q = grid.morph_point(p, Table::Canonical, Table::Observed, &mut cache);
        assert_relative_eq!((q - p).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn outside_point_falls_back_to_identity() {
        let grid = MorphGrid::new(3, 3);
        let mut cache = TriangleCache::default();
        let p = Point2::new(1.5, -0.2);
        assert_eq!(grid.morph_point(p, Table::Canonical, Table::Observed, &mut cache), p);
        assert_relative_eq!(grid.get_alpha(p, Table::Canonical, &mut cache), 1.0);
    }

    #[test]
    fn warp_shifts_morphed_points() {
        let mut grid = MorphGrid::new(3, 3);
        let shift = Vector2::new(0.1, -0.05);
        grid.warp_observed(|_, _, p| p + shift);

        let mut cache = TriangleCache::default();
        let p = Point2::new(0.4, 0.6);
        let q = grid.morph_point(p, Table::Canonical, Table::Observed, &mut cache);
        assert_relative_eq!((q - (p + shift)).norm(), 0.0, epsilon = 1e-12);

        // And back through the observed table.
        let r = grid.morph_point(q, Table::Observed, Table::Canonical, &mut cache);
        assert_relative_eq!((r - p).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn cache_hit_skips_descent() {
        let grid = MorphGrid::new(4, 4);
        let mut cache = TriangleCache::default();
        grid.morph_point(
            Point2::new(0.1, 0.1),
            Table::Canonical,
            Table::Observed,
            &mut cache,
        );
        let first = cache.last;
        assert!(first.is_some());

        // A nearby point stays in the same triangle.
        grid.morph_point(
            Point2::new(0.12, 0.11),
            Table::Canonical,
            Table::Observed,
            &mut cache,
        );
        assert_eq!(cache.last, first);
    }

    #[test]
    fn fill_alpha_uncovered_is_opaque() {
        let mut grid = MorphGrid::new(5, 5);
        grid.fill_alpha();
        for j in 0..5 {
            for i in 0..5 {
                assert_relative_eq!(grid.vertex(i, j).alpha(), 1.0);
            }
        }
    }

    #[test]
    fn fill_alpha_fully_covered_zeroes_border() {
        let mut grid = MorphGrid::new(5, 5);
        for j in 0..5 {
            for i in 0..5 {
                grid.set_covered(i, j, true);
            }
        }
        grid.fill_alpha();
        for k in 0..5 {
            assert_relative_eq!(grid.vertex(k, 0).alpha(), 0.0);
            assert_relative_eq!(grid.vertex(k, 4).alpha(), 0.0);
            assert_relative_eq!(grid.vertex(0, k).alpha(), 0.0);
            assert_relative_eq!(grid.vertex(4, k).alpha(), 0.0);
        }
    }

    #[test]
    fn fill_alpha_ramps_toward_covered_edge() {
        // Left half interior, right half covered.
        let mut grid = MorphGrid::new(7, 3);
        for j in 0..3 {
            for i in 3..7 {
                grid.set_covered(i, j, true);
            }
        }
        grid.fill_alpha();

        // Interior stays opaque, the covered grid edge goes transparent,
        // and alpha never increases moving toward the edge.
        assert_relative_eq!(grid.vertex(0, 1).alpha(), 1.0);
        assert_relative_eq!(grid.vertex(6, 1).alpha(), 0.0);
        let mut last = 1.0;
        for i in 0..7 {
            let a = grid.vertex(i, 1).alpha();
            assert!(a <= last + 1e-12);
            last = a;
        }
    }
}
