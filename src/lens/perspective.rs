use super::{DrawContext, Focus, Lens};
use crate::rasterizer::{RasterizerVertex, TriangleRasterizer};
use nalgebra::{Point2, Vector2, Vector3};

// Film radius that stands in for infinity when a ray grazes or passes
// behind the film plane.
const CLAMP_RADIUS_MM: f64 = 1.0e5;

/// The standard planar pinhole projection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Perspective {
    focus: Focus,
}

impl Perspective {
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
}

impl Lens for Perspective {
    fn focal_length(&self, film_width: f64) -> f64 {
        match self.focus {
            Focus::FocalLength(f) => f,
            Focus::Hfov(v) => film_width / 2.0 / (v.to_radians() / 2.0).tan(),
        }
    }

    fn hfov(&self, film_width: f64) -> f64 {
        match self.focus {
            Focus::Hfov(v) => v,
            Focus::FocalLength(f) => 2.0 * (film_width / 2.0 / f).atan().to_degrees(),
        }
    }

    fn extrude(&self, point: Point2<f64>, film_width: f64) -> Vector3<f64> {
        let f = self.focal_length(film_width);
        Vector3::new(point.x, f, point.y).normalize()
    }

    fn project(&self, ray: Vector3<f64>, film_width: f64) -> Point2<f64> {
        let f = self.focal_length(film_width);

        let p = if ray.y > 1e-12 {
            Point2::new(ray.x * f / ray.y, ray.z * f / ray.y)
        } else {
            // At or behind the film plane: push the point out along its
            // lateral direction to a large but finite radius.
            let lateral = Vector2::new(ray.x, ray.z);
            let norm = lateral.norm();
            if norm < 1e-12 {
                return Point2::new(CLAMP_RADIUS_MM, 0.0);
            }
            Point2::from(lateral * (CLAMP_RADIUS_MM / norm))
        };

        let radius = p.coords.norm();
        if radius > CLAMP_RADIUS_MM {
            Point2::from(p.coords * (CLAMP_RADIUS_MM / radius))
        } else {
            p
        }
    }

    // No seams, no singular points.
    fn draw_triangle(
        &self,
        rast: &mut TriangleRasterizer<'_>,
        _ctx: &DrawContext,
        tri: [&RasterizerVertex; 3],
        _flags: &mut u8,
    ) {
        rast.draw_triangle(tri[0], tri[1], tri[2]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use quickcheck_macros::quickcheck;
    use rstest::rstest;

    const FILM_WIDTH: f64 = 36.0;

    #[quickcheck]
    fn project_extrude_roundtrip(x_seed: i16, y_seed: i16) -> bool {
        // Film points inside a generous frame around the film.
        let p = Point2::new(
            x_seed as f64 * 40.0 / i16::MAX as f64,
            y_seed as f64 * 40.0 / i16::MAX as f64,
        );

        let lens = Perspective::from_focal_length(35.0);
        let back = lens.project(lens.extrude(p, FILM_WIDTH), FILM_WIDTH);
        (back - p).norm() < 1e-9
    }

    #[rstest]
    #[case(Perspective::from_focal_length(18.0))]
    #[case(Perspective::from_hfov(90.0))]
    fn focus_derivations_agree(#[case] lens: Perspective) {
        // 90 degrees across a 36mm film is an 18mm focal length.
        assert_relative_eq!(lens.focal_length(FILM_WIDTH), 18.0, epsilon = 1e-12);
        assert_relative_eq!(lens.hfov(FILM_WIDTH), 90.0, epsilon = 1e-12);
    }

    #[rstest]
    #[case(Vector3::new(0.0, -1.0, 0.0))]
    #[case(Vector3::new(0.3, -0.5, 0.1).normalize())]
    #[case(Vector3::new(1.0, 0.0, 0.0))]
    fn behind_camera_projects_finite(#[case] ray: Vector3<f64>) {
        let lens = Perspective::from_focal_length(35.0);
        let p = lens.project(ray, FILM_WIDTH);
        assert!(p.coords.norm().is_finite());
        assert!(p.coords.norm() <= CLAMP_RADIUS_MM + 1e-6);
    }
}
