use super::{
    DrawContext, Focus, Lens, SeamSide, crosses_back_seam, equiangular_focal, equiangular_hfov,
    reproject, seam_azimuth,
};
use crate::rasterizer::{RasterizerVertex, TriangleRasterizer};
use nalgebra::{Point2, Vector3};

/// Degrees of field per focal length of film along the curved axis.
/// Empirical, kept in line with the other equiangular families.
pub const CYLINDRICAL_K: f64 = 60.0;

// Stand-in for the infinite vertical extent near the cylinder axis.
const CLAMP_HEIGHT_MM: f64 = 1.0e5;

/// Curved horizontally, planar vertically, with a wrap-around seam at ±180°
/// instead of a point singularity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cylindrical {
    focus: Focus,
}

impl Cylindrical {
    pub fn from_focal_length(mm: f64) -> Self {
        Self {
            focus: Focus::FocalLength(mm),
        }
    }

    pub fn from_hfov(degrees: f64) -> Self {
        Self {
            focus: Focus::Hfov(degrees),
        }
    }

    fn project_side(&self, ray: Vector3<f64>, film_width: f64, side: SeamSide) -> Point2<f64> {
        let f = self.focal_length(film_width);
        let azimuth = seam_azimuth(ray.x.atan2(ray.y), side);
        let lateral = ray.x.hypot(ray.y);
        let height = if lateral < 1e-12 {
            CLAMP_HEIGHT_MM * ray.z.signum()
        } else {
            (f * ray.z / lateral).clamp(-CLAMP_HEIGHT_MM, CLAMP_HEIGHT_MM)
        };
        Point2::new(f * azimuth.to_degrees() / CYLINDRICAL_K, height)
    }
}

impl Lens for Cylindrical {
    fn focal_length(&self, film_width: f64) -> f64 {
        equiangular_focal(self.focus, film_width, CYLINDRICAL_K)
    }

    fn hfov(&self, film_width: f64) -> f64 {
        equiangular_hfov(self.focus, film_width, CYLINDRICAL_K)
    }

    fn extrude(&self, point: Point2<f64>, film_width: f64) -> Vector3<f64> {
        let f = self.focal_length(film_width);
        let azimuth = (point.x * CYLINDRICAL_K / f).to_radians();
        Vector3::new(azimuth.sin(), azimuth.cos(), point.y / f).normalize()
    }

    fn project(&self, ray: Vector3<f64>, film_width: f64) -> Point2<f64> {
        // atan2 keeps the azimuth on (-180, 180]; both seam continuations
        // exist only through draw_triangle's double draw.
        self.project_side(ray, film_width, SeamSide::Right)
    }

    /// A triangle straddling the back seam is drawn twice, re-projected once
    /// onto each continuation; drawing it once would smear a span across the
    /// whole film.
    fn draw_triangle(
        &self,
        rast: &mut TriangleRasterizer<'_>,
        ctx: &DrawContext,
        tri: [&RasterizerVertex; 3],
        _flags: &mut u8,
    ) {
        if crosses_back_seam(tri) {
            for side in [SeamSide::Left, SeamSide::Right] {
                let vs = tri.map(|v| {
                    reproject(v, ctx, self.project_side(v.space, ctx.film_width, side))
                });
                rast.draw_triangle(&vs[0], &vs[1], &vs[2]);
            }
        } else {
            rast.draw_triangle(tri[0], tri[1], tri[2]);
        }
    }
}
