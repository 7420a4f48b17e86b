//! Registration: solving every image's orientation from shared control
//! points, then feathering the overlaps.

use crate::{image::Image, point::PointTable};
use nalgebra::{Point2, Rotation3, Unit, Vector2, Vector3};
use rayon::prelude::*;
use std::cmp::Ordering;
use tracing::{info, warn};

/// Outcome of one [`Stitcher::stitch`] run.
#[derive(Clone, Debug, Default)]
pub struct StitchReport {
    /// Image indices in placement order.
    pub placed: Vec<usize>,

    /// Images that could not be registered and are excluded from output.
    pub abandoned: Vec<usize>,
}

/// Minimal rotation taking `from` onto `to`.
fn rotation_between(from: Vector3<f64>, to: Vector3<f64>) -> Rotation3<f64> {
    Rotation3::rotation_between(&from, &to).unwrap_or_else(|| {
        // Antiparallel: a half turn about any perpendicular axis.
        let axis = if from.x.abs() < 0.9 {
            from.cross(&Vector3::x())
        } else {
            from.cross(&Vector3::y())
        };
        Rotation3::from_axis_angle(&Unit::new_normalize(axis), std::f64::consts::PI)
    })
}

/// Builds the candidate rotation anchored on the ordered pair `(i, j)`:
/// first the minimal rotation taking ray `i` onto its known direction, then
/// a roll about that direction until ray `j` lines up. Returns the rotation
/// and its misfit score over all anchors (0 is a perfect fit).
fn match_pair(
    rays: &[Vector3<f64>],
    dirs: &[Unit<Vector3<f64>>],
    i: usize,
    j: usize,
) -> (Rotation3<f64>, f64) {
    let base = rotation_between(rays[i], dirs[i].into_inner());
    let axis = dirs[i];

    let moved = base * rays[j];
    let u = moved - axis.into_inner() * moved.dot(&axis);
    let w = dirs[j].into_inner() - axis.into_inner() * dirs[j].dot(&axis);

    let rotation = if u.norm() > 1e-12 && w.norm() > 1e-12 {
        // Angle between the two planes holding the axis and each ray.
        let angle = u.cross(&w).dot(&axis).atan2(u.dot(&w));
        Rotation3::from_axis_angle(&axis, angle) * base
    } else {
        base
    };

    let score = rays
        .iter()
        .zip(dirs)
        .map(|(ray, dir)| 1.0 - (rotation * ray).dot(dir))
        .sum();
    (rotation, score)
}

/// Orders and orients a collection of images sharing named control points.
#[derive(Default)]
pub struct Stitcher {
    images: Vec<Image>,
    points: PointTable,
    order: Vec<usize>,
}

impl Stitcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an image, wiring its named points into the shared table.
    /// Returns the image's handle.
    pub fn add_image(&mut self, image: Image) -> usize {
        let idx = self.images.len();
        for name in image.control_points().keys() {
            self.points.reference(name, idx);
        }
        self.images.push(image);
        idx
    }

    /// Declares an explicit world direction for a named point.
    pub fn add_point(&mut self, name: &str, direction: Vector3<f64>) {
        self.points.set_direction(name, Unit::new_normalize(direction));
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn image(&self, idx: usize) -> &Image {
        &self.images[idx]
    }

    pub fn image_mut(&mut self, idx: usize) -> &mut Image {
        &mut self.images[idx]
    }

    pub fn points(&self) -> &PointTable {
        &self.points
    }

    /// Placed images in placement order, for the outputter to walk.
    pub fn placed_images(&self) -> impl Iterator<Item = &Image> {
        self.order.iter().map(|&i| &self.images[i])
    }

    /// Registers every image it can and feathers the overlaps.
    ///
    /// Images that cannot be placed are reported and left out; the run
    /// itself always completes.
    pub fn stitch(&mut self) -> StitchReport {
        self.order.clear();
        let mut placed = Vec::new();
        let mut abandoned = Vec::new();

        // With no explicit directions anywhere, the first image becomes the
        // reference frame: its points are extruded in place and its rotation
        // stays identity (or its explicit orientation, when it carries one).
        if !self.images.is_empty()
            && self.points.iter().all(|p| !p.is_known())
            && !self.images[0].control_points().is_empty()
        {
            let pose = self.images[0].orientation().map(|pose| pose.rotation());
            if let Some(rotation) = pose {
                self.images[0].set_rotation(rotation);
            }
            let reference = &self.images[0];
            let seeds: Vec<(String, Unit<Vector3<f64>>)> = reference
                .control_points()
                .iter()
                .map(|(name, &uv)| {
                    (
                        name.clone(),
                        Unit::new_normalize(reference.world_ray_from_uv(uv)),
                    )
                })
                .collect();
            for (name, dir) in seeds {
                self.points.set_direction(&name, dir);
            }
            self.images[0].set_index(0);
            placed.push(0);
            info!(image = %self.images[0].name(), "placed reference image");
        }

        while let Some(idx) = self.best_candidate() {
            self.register(idx, &mut placed);
        }

        // Anything left either has an explicit orientation to fall back on
        // or cannot be registered at all.
        for idx in 0..self.images.len() {
            if self.images[idx].index().is_some() {
                continue;
            }
            if self.images[idx].orientation().is_some() {
                self.register(idx, &mut placed);
            } else {
                warn!(
                    image = %self.images[idx].name(),
                    "cannot register image: fewer than 2 known control points and no explicit orientation"
                );
                abandoned.push(idx);
            }
        }

        self.feather(&placed);
        self.order = placed.clone();
        StitchReport { placed, abandoned }
    }

    /// Scores a pair of named anchors on one image: the candidate rotation
    /// they generate and its misfit over all of the image's known points.
    pub fn try_match(
        &self,
        image: usize,
        first: &str,
        second: &str,
    ) -> Option<(Rotation3<f64>, f64)> {
        let known = self.known_points(image);
        let i = known.iter().position(|(name, _, _)| name == first)?;
        let j = known.iter().position(|(name, _, _)| name == second)?;
        if i == j {
            return None;
        }
        let (rays, dirs) = self.anchor_rays(image, &known);
        Some(match_pair(&rays, &dirs, i, j))
    }

    /// The image's control points whose world direction is already known,
    /// in name order.
    fn known_points(&self, image: usize) -> Vec<(String, Point2<f64>, Unit<Vector3<f64>>)> {
        self.images[image]
            .control_points()
            .iter()
            .filter_map(|(name, &uv)| {
                self.points
                    .get(name)
                    .and_then(|p| p.direction())
                    .map(|dir| (name.clone(), uv, *dir))
            })
            .collect()
    }

    fn anchor_rays(
        &self,
        image: usize,
        known: &[(String, Point2<f64>, Unit<Vector3<f64>>)],
    ) -> (Vec<Vector3<f64>>, Vec<Unit<Vector3<f64>>>) {
        let img = &self.images[image];
        let rays = known
            .iter()
            .map(|(_, uv, _)| {
                let mm = img.uv_to_mm().transform_point(uv);
                img.lens().extrude(mm, img.film_width())
            })
            .collect();
        let dirs = known.iter().map(|(_, _, dir)| *dir).collect();
        (rays, dirs)
    }

    /// The unplaced image with the most known points, two at minimum.
    /// Earlier images win ties.
    fn best_candidate(&self) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for idx in 0..self.images.len() {
            if self.images[idx].index().is_some() {
                continue;
            }
            let score = self.known_points(idx).len();
            if score < 2 {
                continue;
            }
            if best.is_none_or(|(s, _)| score > s) {
                best = Some((score, idx));
            }
        }
        best.map(|(_, idx)| idx)
    }

    fn register(&mut self, idx: usize, placed: &mut Vec<usize>) {
        let known = self.known_points(idx);
        let Some(rotation) = self.solve_rotation(idx, &known) else {
            return;
        };
        self.images[idx].set_rotation(rotation);
        self.correct_residual(idx, &known);
        self.propagate(idx);

        let order = placed.len();
        self.images[idx].set_index(order);
        placed.push(idx);
        info!(
            image = %self.images[idx].name(),
            anchors = known.len(),
            order,
            "registered image"
        );
    }

    fn solve_rotation(
        &self,
        idx: usize,
        known: &[(String, Point2<f64>, Unit<Vector3<f64>>)],
    ) -> Option<Rotation3<f64>> {
        let img = &self.images[idx];
        let (rays, dirs) = self.anchor_rays(idx, known);

        match known.len() {
            0 => img.orientation().map(|pose| pose.rotation()),
            1 => {
                // One anchor pins the direction but not the roll; an
                // explicit orientation supplies the roll if there is one.
                let base = rotation_between(rays[0], dirs[0].into_inner());
                Some(match img.orientation() {
                    Some(pose) => {
                        Rotation3::from_axis_angle(&dirs[0], pose.roll.to_radians()) * base
                    }
                    None => base,
                })
            }
            _ => {
                let mut pairs = Vec::with_capacity(known.len() * (known.len() - 1));
                for i in 0..known.len() {
                    for j in 0..known.len() {
                        if i != j {
                            pairs.push((i, j));
                        }
                    }
                }
                pairs
                    .par_iter()
                    .enumerate()
                    .map(|(rank, &(i, j))| {
                        let (rotation, score) = match_pair(&rays, &dirs, i, j);
                        (score, rank, rotation)
                    })
                    .min_by(|(sa, ra, _), (sb, rb, _)| {
                        sa.partial_cmp(sb).unwrap_or(Ordering::Equal).then(ra.cmp(rb))
                    })
                    .map(|(_, _, rotation)| rotation)
            }
        }
    }

    /// Nudges the observed morph table so that every anchor lands exactly
    /// on its measured uv, tapering by inverse distance elsewhere.
    fn correct_residual(
        &mut self,
        idx: usize,
        known: &[(String, Point2<f64>, Unit<Vector3<f64>>)],
    ) {
        if known.is_empty() {
            return;
        }
        let img = &self.images[idx];
        let anchors: Vec<(Point2<f64>, Vector2<f64>)> = known
            .iter()
            .map(|(_, measured, dir)| {
                let required = img.uv_from_world_ray(dir.into_inner());
                (required, measured - required)
            })
            .collect();

        self.images[idx].grid_mut().warp_observed(|_, _, p| {
            let mut weight_sum = 0.0;
            let mut delta = Vector2::zeros();
            for (anchor, d) in &anchors {
                let dist = (p - anchor).norm();
                if dist < 1e-9 {
                    return p + d;
                }
                let w = dist.powf(-0.2);
                weight_sum += w;
                delta += d * w;
            }
            p + delta / weight_sum
        });
    }

    /// Makes the placed image's remaining unknown points known, so later
    /// images can register against them transitively.
    fn propagate(&mut self, idx: usize) {
        let img = &self.images[idx];
        let fresh: Vec<(String, Unit<Vector3<f64>>)> = img
            .control_points()
            .iter()
            .filter(|(name, _)| self.points.get(name).is_none_or(|p| !p.is_known()))
            .map(|(name, &uv)| (name.clone(), Unit::new_normalize(img.world_ray_from_uv(uv))))
            .collect();
        for (name, dir) in fresh {
            self.points.set_direction(&name, dir);
        }
    }

    /// Marks grid vertices covered by earlier-placed images and runs the
    /// alpha fill, in placement order. The first image never feathers.
    fn feather(&mut self, placed: &[usize]) {
        for k in 1..placed.len() {
            let idx = placed[k];
            let earlier = &placed[..k];

            let (nx, ny) = {
                let grid = self.images[idx].grid();
                (grid.x_verts(), grid.y_verts())
            };
            let mut covered = vec![false; nx * ny];
            for j in 0..ny {
                for i in 0..nx {
                    let uv = self.images[idx].grid().vertex(i, j).canonical();
                    let ray = self.images[idx].world_ray_from_uv(uv);
                    covered[j * nx + i] = earlier.iter().any(|&e| {
                        let img = &self.images[e];
                        img.contains_uv(img.uv_from_world_ray(ray))
                    });
                }
            }

            let grid = self.images[idx].grid_mut();
            for j in 0..ny {
                for i in 0..nx {
                    grid.set_covered(i, j, covered[j * nx + i]);
                }
            }
            grid.fill_alpha();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageParams, LensFamily, LensSpec};
    use approx::assert_relative_eq;
    use nalgebra::Point2;

    fn perspective_params(name: &str) -> ImageParams {
        ImageParams::new(
            name,
            LensSpec::focal_length(LensFamily::Perspective, 35.0),
            400,
            300,
        )
    }

    /// Pixel position where `dir` lands on `image` under `rotation`.
    fn control_pixel(image: &Image, rotation: &Rotation3<f64>, dir: &Vector3<f64>) -> Point2<f64> {
        let cam = rotation.inverse() * dir;
        let mm = image.lens().project(cam, image.film_width());
        let uv = image.mm_to_uv().transform_point(&mm);
        image.uv_to_pixel().transform_point(&uv)
    }

    /// Builds an image whose measured control points are the ground-truth
    /// directions seen through `rotation`.
    fn oriented_image(
        name: &str,
        rotation: &Rotation3<f64>,
        points: &[(&str, Vector3<f64>)],
    ) -> Image {
        let mut image = Image::new(perspective_params(name)).unwrap();
        for (point, dir) in points {
            let pixel = control_pixel(&image, rotation, dir);
            image.add_control_point(*point, pixel);
        }
        image
    }

    #[test]
    fn recovers_known_yaw() {
        let identity = Rotation3::identity();
        let yaw = Rotation3::from_axis_angle(&Vector3::z_axis(), 10.0_f64.to_radians());

        let dir_a = Vector3::new(0.1, 1.0, -0.05).normalize();
        let dir_b = Vector3::new(-0.2, 1.0, 0.12).normalize();
        let shared = [("a", dir_a), ("b", dir_b)];

        let mut stitcher = Stitcher::new();
        stitcher.add_image(oriented_image("reference", &identity, &shared));
        let b = stitcher.add_image(oriented_image("offset", &yaw, &shared));

        let report = stitcher.stitch();
        assert_eq!(report.placed.len(), 2);
        assert!(report.abandoned.is_empty());

        let recovered = stitcher.image(b).rotation();
        let residual = recovered * yaw.inverse();
        assert!(residual.angle() < 1e-3, "residual angle {}", residual.angle());

        // The winning anchor pair fits essentially exactly, and no worse
        // than any other tested permutation.
        let (_, best) = stitcher.try_match(b, "a", "b").unwrap();
        assert!(best < 1e-2);
        let (_, other) = stitcher.try_match(b, "b", "a").unwrap();
        assert!(best <= other + 1e-12);
    }

    #[test]
    fn first_image_is_reference() {
        let identity = Rotation3::identity();
        let shared = [
            ("a", Vector3::new(0.0, 1.0, 0.1).normalize()),
            ("b", Vector3::new(0.1, 1.0, 0.0).normalize()),
        ];

        let mut stitcher = Stitcher::new();
        let a = stitcher.add_image(oriented_image("first", &identity, &shared));
        stitcher.add_image(oriented_image("second", &identity, &shared));
        stitcher.stitch();

        assert_eq!(stitcher.image(a).index(), Some(0));
        assert!(stitcher.image(a).rotation().angle() < 1e-12);
        assert!(stitcher.points().get("a").unwrap().is_known());
    }

    #[test]
    fn insufficient_points_are_reported_not_fatal() {
        let identity = Rotation3::identity();
        let shared = [
            ("a", Vector3::new(0.0, 1.0, 0.1).normalize()),
            ("b", Vector3::new(0.1, 1.0, 0.0).normalize()),
        ];

        let mut stitcher = Stitcher::new();
        stitcher.add_image(oriented_image("first", &identity, &shared));
        // Shares only one point and has no explicit orientation.
        let lonely = stitcher.add_image(oriented_image("lonely", &identity, &shared[..1]));

        let report = stitcher.stitch();
        assert_eq!(report.abandoned, vec![lonely]);
        assert_eq!(stitcher.image(lonely).index(), None);
        assert_eq!(stitcher.placed_images().count(), 1);
    }

    #[test]
    fn explicit_orientation_places_without_points() {
        let mut params = perspective_params("oriented");
        params.orientation = Some(crate::image::PoseSpec {
            heading: 45.0,
            pitch: 0.0,
            roll: 0.0,
        });

        let mut stitcher = Stitcher::new();
        let idx = stitcher.add_image(Image::new(params).unwrap());
        let report = stitcher.stitch();

        assert_eq!(report.placed, vec![idx]);
        let expected = Rotation3::from_axis_angle(&Vector3::z_axis(), 45.0_f64.to_radians());
        let residual = stitcher.image(idx).rotation() * expected.inverse();
        assert!(residual.angle() < 1e-12);
    }

    #[test]
    fn residual_correction_pulls_anchors_toward_measurements() {
        let identity = Rotation3::identity();
        let shared = [
            ("a", Vector3::new(0.15, 1.0, -0.1).normalize()),
            ("b", Vector3::new(-0.1, 1.0, 0.08).normalize()),
        ];

        let mut stitcher = Stitcher::new();
        for (name, dir) in &shared {
            stitcher.add_point(name, *dir);
        }

        // Measurements consistent with identity, except "a" is nudged so no
        // rotation can fit both anchors.
        let mut params = perspective_params("offset");
        params.grid = Some((17, 17));
        let mut image = Image::new(params).unwrap();
        for (name, dir) in &shared {
            let pixel = control_pixel(&image, &identity, dir);
            image.add_control_point(*name, pixel);
        }
        let nudged_pixel =
            control_pixel(&image, &identity, &shared[0].1) + nalgebra::Vector2::new(8.0, 0.0);
        image.add_control_point("a", nudged_pixel);

        let idx = stitcher.add_image(image);
        let report = stitcher.stitch();
        assert_eq!(report.placed, vec![idx]);

        // The morph must shrink the worst anchor misfit left by the
        // rotation.
        let image = stitcher.image(idx);
        let mut cache = crate::morph::TriangleCache::default();
        let mut before: f64 = 0.0;
        let mut after: f64 = 0.0;
        for (name, dir) in &shared {
            let measured = image.control_points()[*name];
            let required = image.uv_from_world_ray(*dir);
            let morphed = image.grid().morph_point(
                required,
                crate::morph::Table::Canonical,
                crate::morph::Table::Observed,
                &mut cache,
            );
            before = before.max((required - measured).norm());
            after = after.max((morphed - measured).norm());
        }
        assert!(before > 1e-3, "nudge should leave a residual, got {before}");
        assert!(after < before * 0.8, "after {after} vs before {before}");
    }

    #[test]
    fn feathering_marks_overlap() {
        let identity = Rotation3::identity();
        let shared = [
            ("a", Vector3::new(0.1, 1.0, 0.1).normalize()),
            ("b", Vector3::new(-0.1, 1.0, -0.1).normalize()),
        ];

        let mut stitcher = Stitcher::new();
        stitcher.add_image(oriented_image("first", &identity, &shared));
        // Fully overlapping duplicate view.
        let second = stitcher.add_image(oriented_image("second", &identity, &shared));
        stitcher.stitch();

        // The duplicate is completely covered, so its border alpha is 0.
        let grid = stitcher.image(second).grid();
        for i in 0..grid.x_verts() {
            assert_relative_eq!(grid.vertex(i, 0).alpha(), 0.0);
            assert_relative_eq!(grid.vertex(i, grid.y_verts() - 1).alpha(), 0.0);
        }
    }
}
