use nalgebra::{Point2, Rotation3, Vector3};
use seamster::{Image, ImageParams, LensFamily, LensSpec, Stitcher};

fn params(name: &str) -> ImageParams {
    ImageParams::new(
        name,
        LensSpec::focal_length(LensFamily::Perspective, 35.0),
        640,
        480,
    )
}

/// Pixel position where the world direction `dir` lands on `image` when the
/// image has the ground-truth `rotation`.
fn control_pixel(image: &Image, rotation: &Rotation3<f64>, dir: &Vector3<f64>) -> Point2<f64> {
    let cam = rotation.inverse() * dir;
    let mm = image.lens().project(cam, image.film_width());
    let uv = image.mm_to_uv().transform_point(&mm);
    image.uv_to_pixel().transform_point(&uv)
}

fn oriented_image(
    name: &str,
    rotation: &Rotation3<f64>,
    points: &[(&str, Vector3<f64>)],
) -> Image {
    let mut image = Image::new(params(name)).unwrap();
    for (point, dir) in points {
        let pixel = control_pixel(&image, rotation, dir);
        image.add_control_point(*point, pixel);
    }
    image
}

fn yaw(degrees: f64) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Vector3::z_axis(), degrees.to_radians())
}

#[test]
fn three_image_chain_registers_transitively() {
    // The reference never sees r or s; they only become known once the
    // middle image is placed.
    let p = Vector3::new(0.10, 1.0, 0.05).normalize();
    let q = Vector3::new(-0.12, 1.0, -0.06).normalize();
    let r = yaw(10.0) * Vector3::new(0.08, 1.0, -0.04).normalize();
    let s = yaw(10.0) * Vector3::new(-0.06, 1.0, 0.09).normalize();

    let mut stitcher = Stitcher::new();
    let a = stitcher.add_image(oriented_image(
        "reference",
        &Rotation3::identity(),
        &[("p", p), ("q", q)],
    ));
    let b = stitcher.add_image(oriented_image(
        "middle",
        &yaw(8.0),
        &[("p", p), ("q", q), ("r", r), ("s", s)],
    ));
    let c = stitcher.add_image(oriented_image("far", &yaw(16.0), &[("r", r), ("s", s)]));

    let report = stitcher.stitch();
    assert_eq!(report.placed, vec![a, b, c]);
    assert!(report.abandoned.is_empty());

    let residual = stitcher.image(c).rotation() * yaw(16.0).inverse();
    assert!(
        residual.angle() < 1e-3,
        "chain registration drifted: {}",
        residual.angle()
    );

    // Directions discovered along the way are shared state now.
    assert!(stitcher.points().get("r").unwrap().is_known());
    assert!(stitcher.points().get("s").unwrap().is_known());
}

#[test]
fn greedy_order_prefers_most_constrained_image() {
    let a = Vector3::new(0.10, 1.0, 0.02).normalize();
    let b = Vector3::new(-0.08, 1.0, -0.03).normalize();
    let c = Vector3::new(0.02, 1.0, 0.11).normalize();
    let d = Vector3::new(-0.03, 1.0, -0.12).normalize();

    let mut stitcher = Stitcher::new();
    stitcher.add_image(oriented_image(
        "reference",
        &Rotation3::identity(),
        &[("a", a), ("b", b), ("c", c), ("d", d)],
    ));
    let two = stitcher.add_image(oriented_image(
        "two-points",
        &yaw(5.0),
        &[("a", a), ("b", b)],
    ));
    let three = stitcher.add_image(oriented_image(
        "three-points",
        &yaw(-5.0),
        &[("a", a), ("b", b), ("c", c)],
    ));

    stitcher.stitch();

    // The image sharing three known points registers before the one
    // sharing two, regardless of insertion order.
    assert_eq!(stitcher.image(three).index(), Some(1));
    assert_eq!(stitcher.image(two).index(), Some(2));
}

#[test]
fn explicit_points_anchor_the_frame() {
    let a = Vector3::new(0.10, 1.0, 0.00).normalize();
    let b = Vector3::new(-0.10, 1.0, 0.05).normalize();

    let mut stitcher = Stitcher::new();
    stitcher.add_point("a", a);
    stitcher.add_point("b", b);

    let truth = yaw(12.0);
    let img = stitcher.add_image(oriented_image("only", &truth, &[("a", a), ("b", b)]));
    let report = stitcher.stitch();

    // With explicit directions there is no reference seeding; even the
    // first image is solved against them.
    assert_eq!(report.placed, vec![img]);
    let residual = stitcher.image(img).rotation() * truth.inverse();
    assert!(residual.angle() < 1e-6);
}

#[test]
fn unmatchable_image_is_excluded_without_aborting() {
    let a = Vector3::new(0.10, 1.0, 0.02).normalize();
    let b = Vector3::new(-0.08, 1.0, -0.03).normalize();

    let mut stitcher = Stitcher::new();
    stitcher.add_image(oriented_image(
        "reference",
        &Rotation3::identity(),
        &[("a", a), ("b", b)],
    ));
    let loner = {
        let mut image = Image::new(params("loner")).unwrap();
        image.add_control_point("elsewhere", Point2::new(320.0, 240.0));
        stitcher.add_image(image)
    };
    let follower = stitcher.add_image(oriented_image(
        "follower",
        &yaw(4.0),
        &[("a", a), ("b", b)],
    ));

    let report = stitcher.stitch();
    assert_eq!(report.abandoned, vec![loner]);
    assert_eq!(report.placed.len(), 2);
    assert!(stitcher.image(follower).index().is_some());
    assert_eq!(stitcher.image(loner).index(), None);
}
