use super::{MorphTriangle, MorphVertex, Table};
use crate::geom::Aabb;
use nalgebra::Point2;

/// Balanced bounding-box hierarchy over a grid's triangles.
///
/// Leaves hold the two triangles of one grid cell; internal nodes own their
/// two children. Every level keeps one aggregated box per vertex table.
pub(crate) enum TriangleTree {
    Leaf {
        tris: [usize; 2],
        bounds: [Aabb; 2],
    },
    Node {
        children: Box<[TriangleTree; 2]>,
        bounds: [Aabb; 2],
    },
}

impl TriangleTree {
    fn bounds(&self, table: Table) -> &Aabb {
        match self {
            TriangleTree::Leaf { bounds, .. } | TriangleTree::Node { bounds, .. } => {
                &bounds[table.index()]
            }
        }
    }

    fn leaf(cell: usize, triangles: &[MorphTriangle]) -> TriangleTree {
        let t0 = cell * 2;
        let bounds = [Table::Canonical, Table::Observed].map(|table| {
            triangles[t0]
                .bounds(table)
                .union(triangles[t0 + 1].bounds(table))
        });
        TriangleTree::Leaf {
            tris: [t0, t0 + 1],
            bounds,
        }
    }

    /// Builds the tree bottom-up: one leaf per cell, columns paired within
    /// each row until rows are single nodes, then rows paired until one root
    /// remains. Odd leftovers ride up a level unpaired.
    pub(crate) fn build(
        cells_x: usize,
        cells_y: usize,
        triangles: &[MorphTriangle],
    ) -> TriangleTree {
        let mut rows: Vec<Vec<TriangleTree>> = (0..cells_y)
            .map(|cy| {
                (0..cells_x)
                    .map(|cx| Self::leaf(cy * cells_x + cx, triangles))
                    .collect()
            })
            .collect();

        while rows.len() > 1 || rows[0].len() > 1 {
            if rows[0].len() > 1 {
                for row in &mut rows {
                    *row = pair_up(std::mem::take(row));
                }
            } else {
                let column: Vec<TriangleTree> =
                    rows.into_iter().map(|mut row| row.pop().unwrap()).collect();
                rows = pair_up(column).into_iter().map(|node| vec![node]).collect();
            }
        }
        rows.pop().unwrap().pop().unwrap()
    }

    /// Finds a triangle containing `p` in the given table, pruning by the
    /// aggregated bounds.
    pub(crate) fn locate(
        &self,
        p: Point2<f64>,
        table: Table,
        triangles: &[MorphTriangle],
        vertices: &[MorphVertex],
    ) -> Option<usize> {
        if !self.bounds(table).contains(p) {
            return None;
        }
        match self {
            TriangleTree::Leaf { tris, .. } => tris
                .iter()
                .copied()
                .find(|&t| triangles[t].contains(p, table, vertices)),
            TriangleTree::Node { children, .. } => children[0]
                .locate(p, table, triangles, vertices)
                .or_else(|| children[1].locate(p, table, triangles, vertices)),
        }
    }
}

fn pair_up(nodes: Vec<TriangleTree>) -> Vec<TriangleTree> {
    let mut out = Vec::with_capacity(nodes.len().div_ceil(2));
    let mut iter = nodes.into_iter();
    while let Some(a) = iter.next() {
        match iter.next() {
            Some(b) => {
                let bounds = [Table::Canonical, Table::Observed]
                    .map(|table| a.bounds(table).union(b.bounds(table)));
                out.push(TriangleTree::Node {
                    children: Box::new([a, b]),
                    bounds,
                });
            }
            None => out.push(a),
        }
    }
    out
}
