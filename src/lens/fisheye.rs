use super::{
    DEFAULT_TOLERANCE_DEG, DrawContext, Focus, Lens, SingularitySampler, equiangular_focal,
    equiangular_hfov, pixel_pitch_mm, pixel_row_range, sweep_region, triangle_near_singularity,
};
use crate::rasterizer::{RasterizerVertex, TriangleRasterizer};
use nalgebra::{Point2, Vector2, Vector3};

/// Degrees of field per focal length of film. Matches real 35mm fisheye
/// lenses; empirical, not derived.
pub const FISHEYE_K: f64 = 60.0;

/// Flag bit recording a triangle rejected at the rear pole.
pub const BACK_POLE: u8 = 0x01;

/// The equidistant polar projection: film radius grows linearly with the
/// angle off the optical axis, with a single singular point 180° behind it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fisheye {
    focus: Focus,
    tolerance_deg: f64,
}

impl Fisheye {
    pub fn from_focal_length(mm: f64) -> Self {
        Self {
            focus: Focus::FocalLength(mm),
            tolerance_deg: DEFAULT_TOLERANCE_DEG,
        }
    }

    pub fn from_hfov(degrees: f64) -> Self {
        Self {
            focus: Focus::Hfov(degrees),
            tolerance_deg: DEFAULT_TOLERANCE_DEG,
        }
    }

    pub fn with_tolerance(mut self, degrees: f64) -> Self {
        self.tolerance_deg = degrees;
        self
    }

    fn backward() -> Vector3<f64> {
        -Vector3::y()
    }

    /// Film radius where the swept neighborhood around the rear pole
    /// begins. Twice the tolerance: a rejected triangle only has to touch
    /// the tolerance cone, so its far side can reach about one more
    /// tolerance inward.
    fn singular_radius(&self, film_width: f64) -> f64 {
        self.focal_length(film_width) * (180.0 - 2.0 * self.tolerance_deg) / FISHEYE_K
    }

    /// Film radius of the rear pole itself.
    fn rim_radius(&self, film_width: f64) -> f64 {
        self.focal_length(film_width) * 180.0 / FISHEYE_K
    }
}

impl Lens for Fisheye {
    fn focal_length(&self, film_width: f64) -> f64 {
        equiangular_focal(self.focus, film_width, FISHEYE_K)
    }

    fn hfov(&self, film_width: f64) -> f64 {
        equiangular_hfov(self.focus, film_width, FISHEYE_K)
    }

    fn extrude(&self, point: Point2<f64>, film_width: f64) -> Vector3<f64> {
        let f = self.focal_length(film_width);
        let r = point.coords.norm();
        if r < 1e-12 {
            return Vector3::y();
        }
        let theta = (r * FISHEYE_K / f).to_radians();
        let lateral = point.coords * (theta.sin() / r);
        Vector3::new(lateral.x, theta.cos(), lateral.y)
    }

    fn project(&self, ray: Vector3<f64>, film_width: f64) -> Point2<f64> {
        let f = self.focal_length(film_width);
        let theta = ray.y.clamp(-1.0, 1.0).acos();
        let r = f * theta.to_degrees() / FISHEYE_K;

        let lateral = Vector2::new(ray.x, ray.z);
        let norm = lateral.norm();
        if norm < 1e-12 {
            // On the axis: the forward pole maps to the origin, the rear
            // pole has no azimuth so any rim point stands in.
            Point2::new(r, 0.0)
        } else {
            Point2::from(lateral * (r / norm))
        }
    }

    fn draw_triangle(
        &self,
        rast: &mut TriangleRasterizer<'_>,
        _ctx: &DrawContext,
        tri: [&RasterizerVertex; 3],
        flags: &mut u8,
    ) {
        if triangle_near_singularity(tri, Self::backward(), self.tolerance_deg) {
            *flags |= BACK_POLE;
            return;
        }
        rast.draw_triangle(tri[0], tri[1], tri[2]);
    }

    fn pick_up_singularity(
        &self,
        rast: &mut TriangleRasterizer<'_>,
        ctx: &DrawContext,
        flags: u8,
        sample: &mut SingularitySampler<'_>,
    ) {
        if flags & BACK_POLE == 0 {
            return;
        }

        let pad = pixel_pitch_mm(ctx);
        let r_in = self.singular_radius(ctx.film_width) - pad;
        let r_out = self.rim_radius(ctx.film_width) + pad;

        let rows = pixel_row_range(
            ctx,
            Point2::new(-r_out, -r_out),
            Point2::new(r_out, r_out),
        );
        let keep = |mm: Point2<f64>| {
            let r = mm.coords.norm();
            r_in <= r && r <= r_out
        };
        sweep_region(rast, ctx, self, rows, &keep, sample);
    }
}
