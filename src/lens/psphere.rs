use super::{
    DEFAULT_TOLERANCE_DEG, DrawContext, Focus, Lens, SeamSide, SingularitySampler,
    crosses_back_seam, equiangular_focal, equiangular_hfov, pixel_pitch_mm, pixel_row_range,
    reproject, seam_azimuth, sweep_region, triangle_near_singularity,
};
use crate::rasterizer::{RasterizerVertex, TriangleRasterizer};
use nalgebra::{Point2, Vector3};

/// Degrees of field per focal length of film on both axes. Empirical, kept
/// in line with the other equiangular families.
pub const PSPHERE_K: f64 = 60.0;

/// Flag bit recording a triangle rejected at the upper pole.
pub const NORTH_POLE: u8 = 0x01;

/// Flag bit recording a triangle rejected at the lower pole.
pub const SOUTH_POLE: u8 = 0x02;

/// The toroidal projection: equiangular in azimuth and elevation
/// independently, with singular points at both poles and the ±180° seam.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PSphere {
    focus: Focus,
    tolerance_deg: f64,
}

impl PSphere {
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

    fn project_side(&self, ray: Vector3<f64>, film_width: f64, side: SeamSide) -> Point2<f64> {
        let f = self.focal_length(film_width);
        let azimuth = seam_azimuth(ray.x.atan2(ray.y), side);
        let elevation = ray.z.atan2(ray.x.hypot(ray.y));
        Point2::new(
            f * azimuth.to_degrees() / PSPHERE_K,
            f * elevation.to_degrees() / PSPHERE_K,
        )
    }
}

impl Lens for PSphere {
    fn focal_length(&self, film_width: f64) -> f64 {
        equiangular_focal(self.focus, film_width, PSPHERE_K)
    }

    fn hfov(&self, film_width: f64) -> f64 {
        equiangular_hfov(self.focus, film_width, PSPHERE_K)
    }

    fn extrude(&self, point: Point2<f64>, film_width: f64) -> Vector3<f64> {
        let f = self.focal_length(film_width);
        let azimuth = (point.x * PSPHERE_K / f).to_radians();
        let elevation = (point.y * PSPHERE_K / f).to_radians();
        Vector3::new(
            elevation.cos() * azimuth.sin(),
            elevation.cos() * azimuth.cos(),
            elevation.sin(),
        )
    }

    fn project(&self, ray: Vector3<f64>, film_width: f64) -> Point2<f64> {
        self.project_side(ray, film_width, SeamSide::Right)
    }

    /// Pole proximity is checked before the seam: a triangle at a pole spans
    /// every azimuth at once, so the seam classification is meaningless for
    /// it.
    fn draw_triangle(
        &self,
        rast: &mut TriangleRasterizer<'_>,
        ctx: &DrawContext,
        tri: [&RasterizerVertex; 3],
        flags: &mut u8,
    ) {
        if triangle_near_singularity(tri, Vector3::z(), self.tolerance_deg) {
            *flags |= NORTH_POLE;
            return;
        }
        if triangle_near_singularity(tri, -Vector3::z(), self.tolerance_deg) {
            *flags |= SOUTH_POLE;
            return;
        }

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

    fn pick_up_singularity(
        &self,
        rast: &mut TriangleRasterizer<'_>,
        ctx: &DrawContext,
        flags: u8,
        sample: &mut SingularitySampler<'_>,
    ) {
        let f = self.focal_length(ctx.film_width);
        let pad = pixel_pitch_mm(ctx);
        // Twice the tolerance: a rejected triangle only touches the
        // tolerance cone, so its far side reaches about one more tolerance
        // below the pole.
        let y_inner = f * (90.0 - 2.0 * self.tolerance_deg) / PSPHERE_K - pad;
        let y_outer = f * 90.0 / PSPHERE_K + pad;
        let x_extent = f * 180.0 / PSPHERE_K + pad;

        for (bit, sign) in [(NORTH_POLE, 1.0f64), (SOUTH_POLE, -1.0f64)] {
            if flags & bit == 0 {
                continue;
            }
            let rows = pixel_row_range(
                ctx,
                Point2::new(-x_extent, sign.min(0.0) * y_outer + sign.max(0.0) * y_inner),
                Point2::new(x_extent, sign.max(0.0) * y_outer + sign.min(0.0) * y_inner),
            );
            let keep = |mm: Point2<f64>| {
                let y = sign * mm.y;
                y_inner <= y && y <= y_outer
            };
            sweep_region(rast, ctx, self, rows, &keep, sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{RasterImage, Rgba};
    use approx::assert_relative_eq;
    use nalgebra::{Affine2, Matrix3, Rotation3, Unit};
    use rstest::rstest;

    const FILM_WIDTH: f64 = 36.0;

    #[rstest]
    #[case(Point2::new(0.0, 0.0))]
    #[case(Point2::new(12.0, 4.0))]
    #[case(Point2::new(-17.0, -8.0))]
    fn project_extrude_roundtrip(#[case] p: Point2<f64>) {
        let lens = PSphere::from_hfov(360.0);
        let back = lens.project(lens.extrude(p, FILM_WIDTH), FILM_WIDTH);
        assert_relative_eq!(back.x, p.x, epsilon = 1e-9);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-9);
    }

    fn ctx() -> DrawContext {
        let mm_to_pixel = Affine2::from_matrix_unchecked(Matrix3::new(
            1.0, 0.0, 40.0, //
            0.0, -1.0, 40.0, //
            0.0, 0.0, 1.0,
        ));
        DrawContext {
            mm_to_pixel,
            pixel_to_mm: mm_to_pixel.inverse(),
            film_width: FILM_WIDTH,
            dest_size: (80, 80),
        }
    }

    fn vert(ray: Vector3<f64>) -> RasterizerVertex {
        RasterizerVertex {
            screen: Point2::new(0.0, 0.0),
            uv: Point2::new(0.0, 0.0),
            space: ray,
            alpha: 1.0,
            visibility: 0,
        }
    }

    fn ring_around(center: Vector3<f64>, off_deg: f64) -> [RasterizerVertex; 3] {
        let perp = if center.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let tilt = Rotation3::from_axis_angle(
            &Unit::new_normalize(center.cross(&perp)),
            off_deg.to_radians(),
        );
        [0.0f64, 120.0, 240.0].map(|spin| {
            let around = Rotation3::from_axis_angle(&Unit::new_normalize(center), spin.to_radians());
            vert(around * (tilt * center))
        })
    }

    #[rstest]
    #[case(Vector3::z(), NORTH_POLE)]
    #[case(-Vector3::z(), SOUTH_POLE)]
    fn pole_triangles_are_deferred(#[case] pole: Vector3<f64>, #[case] expected: u8) {
        let lens = PSphere::from_hfov(360.0);
        let ctx = ctx();
        let mut dest = RasterImage::new(80, 80);
        let mut rast =
            TriangleRasterizer::new(&mut dest, None, Rgba::opaque(1.0, 1.0, 1.0), false);

        let tri = ring_around(pole, 2.0);
        let mut flags = 0;
        lens.draw_triangle(&mut rast, &ctx, [&tri[0], &tri[1], &tri[2]], &mut flags);

        assert_eq!(flags, expected);
        assert_eq!(rast.stats().triangles_drawn, 0);
    }

    #[test]
    fn seam_triangle_away_from_poles_draws_twice() {
        let lens = PSphere::from_hfov(360.0);
        let ctx = ctx();
        let mut dest = RasterImage::new(80, 80);
        let mut rast =
            TriangleRasterizer::new(&mut dest, None, Rgba::opaque(1.0, 1.0, 1.0), false);

        let v = |az_deg: f64, z: f64| {
            let a = az_deg.to_radians();
            vert(Vector3::new(a.sin(), a.cos(), z).normalize())
        };
        let tri = [v(175.0, 0.0), v(-175.0, 0.0), v(175.0, 0.3)];
        let mut flags = 0;
        lens.draw_triangle(&mut rast, &ctx, [&tri[0], &tri[1], &tri[2]], &mut flags);

        assert_eq!(flags, 0);
        assert_eq!(rast.stats().triangles_drawn, 2);
    }
}
