//! Projection models mapping between film-plane millimetres and view rays.
//!
//! The camera frame is +Y forward, +X right, +Z up; the film plane runs x
//! right / y up with its origin on the optical axis. Each lens owns the seam
//! and singularity handling for triangles drawn through it.

mod cylindrical;
mod fisheye;
mod perspective;
mod psphere;

pub use cylindrical::{CYLINDRICAL_K, Cylindrical};
pub use fisheye::{FISHEYE_K, Fisheye};
pub use perspective::Perspective;
pub use psphere::{PSPHERE_K, PSphere};

use crate::{
    geom,
    rasterizer::{RasterizerVertex, TriangleRasterizer, visibility_mask},
};
use nalgebra::{Affine2, Point2, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default singularity tolerance in degrees.
pub const DEFAULT_TOLERANCE_DEG: f64 = 5.0;

/// The one focus parameter a lens is built from; the other of the
/// focal-length/field-of-view pair is derived on demand from the film width.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Focus {
    /// Focal length in millimetres.
    FocalLength(f64),

    /// Horizontal field of view in degrees.
    Hfov(f64),
}

/// Focal length for the equiangular families, whose film millimetres grow
/// linearly with degrees at `k` degrees per focal length of film.
pub(crate) fn equiangular_focal(focus: Focus, film_width: f64, k: f64) -> f64 {
    match focus {
        Focus::FocalLength(f) => f,
        Focus::Hfov(v) => film_width * k / v,
    }
}

pub(crate) fn equiangular_hfov(focus: Focus, film_width: f64, k: f64) -> f64 {
    match focus {
        Focus::Hfov(v) => v,
        Focus::FocalLength(f) => film_width * k / f,
    }
}

/// Destination-side geometry for one rasterization pass.
#[derive(Clone, Debug)]
pub struct DrawContext {
    pub mm_to_pixel: Affine2<f64>,
    pub pixel_to_mm: Affine2<f64>,
    pub film_width: f64,
    pub dest_size: (usize, usize),
}

/// Maps a destination-camera ray back to source texel coordinates and an
/// alpha weight, or `None` where the source does not cover the ray. Built by
/// the rasterization pass and handed to singularity sweeps.
pub type SingularitySampler<'a> = dyn FnMut(Vector3<f64>) -> Option<(Point2<f64>, f64)> + 'a;

/// A projection between film-plane positions and view rays, plus the
/// triangle gatekeeping that makes its seams and singular points drawable.
pub trait Lens {
    /// Focal length in millimetres for the given film width.
    fn focal_length(&self, film_width: f64) -> f64;

    /// Horizontal field of view in degrees for the given film width.
    fn hfov(&self, film_width: f64) -> f64;

    /// Maps a film point to the unit view ray it images.
    fn extrude(&self, point: Point2<f64>, film_width: f64) -> Vector3<f64>;

    /// Maps a view ray to the film point imaging it. Inverse of
    /// [`extrude`](Lens::extrude) away from seams and singularities.
    fn project(&self, ray: Vector3<f64>, film_width: f64) -> Point2<f64>;

    /// Routes one triangle into the rasterizer, splitting it across seams or
    /// rejecting it near singular points. Rejections record which singular
    /// point was hit in `flags`; a later
    /// [`pick_up_singularity`](Lens::pick_up_singularity) pass compensates.
    fn draw_triangle(
        &self,
        rast: &mut TriangleRasterizer<'_>,
        ctx: &DrawContext,
        tri: [&RasterizerVertex; 3],
        flags: &mut u8,
    );

    /// Sweeps the singular destination regions recorded in `flags`
    /// pixel-by-pixel. Lenses without singular points keep the no-op
    /// default.
    fn pick_up_singularity(
        &self,
        rast: &mut TriangleRasterizer<'_>,
        ctx: &DrawContext,
        flags: u8,
        sample: &mut SingularitySampler<'_>,
    ) {
        let _ = (rast, ctx, flags, sample);
    }
}

/// Which continuation of the ±180° seam a re-projection should stay on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum SeamSide {
    Left,
    Right,
}

/// Wraps an azimuth onto one side of the back seam.
pub(crate) fn seam_azimuth(azimuth: f64, side: SeamSide) -> f64 {
    match side {
        SeamSide::Left if azimuth > 0.0 => azimuth - std::f64::consts::TAU,
        SeamSide::Right if azimuth < 0.0 => azimuth + std::f64::consts::TAU,
        _ => azimuth,
    }
}

/// A triangle entirely behind the camera with vertices on both sides of the
/// x=0 plane straddles the ±180° seam.
pub(crate) fn crosses_back_seam(tri: [&RasterizerVertex; 3]) -> bool {
    let front = tri.iter().any(|v| v.space.y >= 0.0);
    let left = tri.iter().any(|v| v.space.y < 0.0 && v.space.x < 0.0);
    let right = tri.iter().any(|v| v.space.y < 0.0 && v.space.x > 0.0);
    !front && left && right
}

/// Rebuilds a vertex at a new film position, keeping its sampling state.
pub(crate) fn reproject(
    v: &RasterizerVertex,
    ctx: &DrawContext,
    mm: Point2<f64>,
) -> RasterizerVertex {
    let screen = ctx.mm_to_pixel.transform_point(&mm);
    RasterizerVertex {
        screen,
        visibility: visibility_mask(screen, ctx.dest_size),
        ..*v
    }
}

fn pick_perpendicular(v: Vector3<f64>) -> Vector3<f64> {
    let axis = if v.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    v.cross(&axis).normalize()
}

/// Tests whether the spherical triangle spanned by three vertex rays comes
/// within `tolerance_deg` of the singular direction.
///
/// The rays are dropped onto the gnomonic chart tangent at the singular
/// direction, where the pole is the origin and the tolerance cone a circle
/// of radius tan(tolerance); overlap then uses the centroid-approach
/// circle-versus-triangle test. Quad-grid triangles are small, so a vertex a
/// quarter turn from the pole clears the whole triangle.
pub(crate) fn triangle_near_singularity(
    tri: [&RasterizerVertex; 3],
    singular: Vector3<f64>,
    tolerance_deg: f64,
) -> bool {
    let tol = tolerance_deg.to_radians();
    let dots = [
        tri[0].space.dot(&singular),
        tri[1].space.dot(&singular),
        tri[2].space.dot(&singular),
    ];

    if dots.iter().any(|&d| d >= tol.cos()) {
        return true;
    }
    if dots.iter().any(|&d| d <= 1e-6) {
        return false;
    }

    let e1 = pick_perpendicular(singular);
    let e2 = singular.cross(&e1);
    let chart = |v: &RasterizerVertex, dot: f64| {
        let offset = v.space / dot - singular;
        Point2::new(offset.dot(&e1), offset.dot(&e2))
    };

    geom::triangle_overlaps_circle(
        Point2::origin(),
        tol.tan(),
        chart(tri[0], dots[0]),
        chart(tri[1], dots[1]),
        chart(tri[2], dots[2]),
    )
}

/// Pixel rows covering the film-space box `[mm_min, mm_max]`.
pub(crate) fn pixel_row_range(
    ctx: &DrawContext,
    mm_min: Point2<f64>,
    mm_max: Point2<f64>,
) -> std::ops::Range<i64> {
    let corners = [
        Point2::new(mm_min.x, mm_min.y),
        Point2::new(mm_max.x, mm_min.y),
        Point2::new(mm_min.x, mm_max.y),
        Point2::new(mm_max.x, mm_max.y),
    ];
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for c in corners {
        let y = ctx.mm_to_pixel.transform_point(&c).y;
        lo = lo.min(y);
        hi = hi.max(y);
    }
    (lo.floor() as i64)..(hi.ceil() as i64 + 1)
}

/// Walks the given destination rows pixel-by-pixel, drawing every pixel
/// whose film position satisfies `keep`.
///
/// The filter radius for each pixel comes from differencing its texel
/// coordinates against the previous sample on the row, the per-pixel
/// analogue of the main pass's gradient estimate.
pub(crate) fn sweep_region(
    rast: &mut TriangleRasterizer<'_>,
    ctx: &DrawContext,
    lens: &dyn Lens,
    rows: std::ops::Range<i64>,
    keep: &dyn Fn(Point2<f64>) -> bool,
    sample: &mut SingularitySampler<'_>,
) {
    let (w, h) = ctx.dest_size;
    let y0 = rows.start.max(0);
    let y1 = rows.end.min(h as i64);

    for y in y0..y1 {
        let mut last: Option<Point2<f64>> = None;
        for x in 0..w as i64 {
            let px = Point2::new(x as f64, y as f64);
            let mm = ctx.pixel_to_mm.transform_point(&px);
            if !keep(mm) {
                last = None;
                continue;
            }
            let ray = lens.extrude(mm, ctx.film_width);
            match sample(ray) {
                Some((texel, alpha)) => {
                    let radius = match last {
                        Some(prev) => (texel.x - prev.x).abs().max((texel.y - prev.y).abs()) * 0.5,
                        None => 0.5,
                    };
                    rast.draw_pixel(
                        &RasterizerVertex {
                            screen: px,
                            uv: texel,
                            space: ray,
                            alpha,
                            visibility: 0,
                        },
                        radius,
                    );
                    last = Some(texel);
                }
                None => last = None,
            }
        }
    }
}

/// One destination pixel's extent in film millimetres, for padding sweep
/// bands so they meet the main pass without a gap.
pub(crate) fn pixel_pitch_mm(ctx: &DrawContext) -> f64 {
    let origin = ctx.pixel_to_mm.transform_point(&Point2::new(0.0, 0.0));
    let dx = ctx.pixel_to_mm.transform_point(&Point2::new(1.0, 0.0)) - origin;
    let dy = ctx.pixel_to_mm.transform_point(&Point2::new(0.0, 1.0)) - origin;
    dx.norm().max(dy.norm())
}
