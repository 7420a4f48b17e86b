use crate::{
    error::StitchError,
    lens::{Cylindrical, Fisheye, Lens, PSphere, Perspective},
    morph::MorphGrid,
    raster::{PixelSource, RasterImage, Rgba},
};
use nalgebra::{Affine2, Matrix3, Point2, Rotation3, Vector3};
use std::collections::BTreeMap;
use tracing::warn;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The four supported projection families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LensFamily {
    Perspective,
    Fisheye,
    Cylindrical,
    PSphere,
}

/// Parser-facing lens description.
///
/// At least one of `focal_length` (mm) and `hfov` (degrees) must be given;
/// focal length wins when both are.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LensSpec {
    pub family: LensFamily,
    pub focal_length: Option<f64>,
    pub hfov: Option<f64>,

    /// Singularity tolerance in degrees, where the family has one.
    pub tolerance: Option<f64>,
}

impl LensSpec {
    pub fn focal_length(family: LensFamily, mm: f64) -> Self {
        Self {
            family,
            focal_length: Some(mm),
            hfov: None,
            tolerance: None,
        }
    }

    pub fn hfov(family: LensFamily, degrees: f64) -> Self {
        Self {
            family,
            focal_length: None,
            hfov: Some(degrees),
            tolerance: None,
        }
    }

    fn build(&self, image: &str) -> Result<Box<dyn Lens>, StitchError> {
        enum Focus {
            Mm(f64),
            Deg(f64),
        }
        let focus = match (self.focal_length, self.hfov) {
            (Some(mm), _) => Focus::Mm(mm),
            (None, Some(deg)) => Focus::Deg(deg),
            (None, None) => {
                return Err(StitchError::LensWithoutFocus {
                    name: image.to_owned(),
                });
            }
        };

        Ok(match self.family {
            LensFamily::Perspective => match focus {
                Focus::Mm(mm) => Box::new(Perspective::from_focal_length(mm)),
                Focus::Deg(deg) => Box::new(Perspective::from_hfov(deg)),
            },
            LensFamily::Fisheye => {
                let lens = match focus {
                    Focus::Mm(mm) => Fisheye::from_focal_length(mm),
                    Focus::Deg(deg) => Fisheye::from_hfov(deg),
                };
                match self.tolerance {
                    Some(tol) => Box::new(lens.with_tolerance(tol)),
                    None => Box::new(lens),
                }
            }
            LensFamily::Cylindrical => match focus {
                Focus::Mm(mm) => Box::new(Cylindrical::from_focal_length(mm)),
                Focus::Deg(deg) => Box::new(Cylindrical::from_hfov(deg)),
            },
            LensFamily::PSphere => {
                let lens = match focus {
                    Focus::Mm(mm) => PSphere::from_focal_length(mm),
                    Focus::Deg(deg) => PSphere::from_hfov(deg),
                };
                match self.tolerance {
                    Some(tol) => Box::new(lens.with_tolerance(tol)),
                    None => Box::new(lens),
                }
            }
        })
    }
}

/// How the physical film size is specified.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Resolution {
    /// Pixels per millimetre on each axis.
    PixelsPerMm { x: f64, y: f64 },

    /// Film dimensions in millimetres.
    FilmSize { width: f64, height: f64 },
}

/// An explicit orientation override in degrees.
///
/// Heading turns about +Z (up), pitch about +X (right), roll about +Y
/// (forward), each right-handed, applied in that order.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoseSpec {
    pub heading: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl PoseSpec {
    pub fn rotation(&self) -> Rotation3<f64> {
        Rotation3::from_axis_angle(&Vector3::z_axis(), self.heading.to_radians())
            * Rotation3::from_axis_angle(&Vector3::x_axis(), self.pitch.to_radians())
            * Rotation3::from_axis_angle(&Vector3::y_axis(), self.roll.to_radians())
    }
}

/// Everything the external command parser supplies for one image.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImageParams {
    pub name: String,
    pub lens: LensSpec,
    pub width_px: u32,
    pub height_px: u32,
    pub resolution: Resolution,

    /// Film-centre offset from the optical axis, in millimetres.
    pub film_offset: (f64, f64),

    /// Named correspondence points in pixel space.
    pub control_points: Vec<(String, (f64, f64))>,

    pub orientation: Option<PoseSpec>,

    /// Morph grid vertex counts; 2x2 when unset.
    pub grid: Option<(usize, usize)>,

    /// Fade-mask filename for the front end to resolve into a pixel source.
    pub fade_mask: Option<String>,

    pub untextured_color: Rgba,
}

impl ImageParams {
    pub fn new(name: impl Into<String>, lens: LensSpec, width_px: u32, height_px: u32) -> Self {
        let aspect = if width_px > 0 {
            height_px as f64 / width_px as f64
        } else {
            1.0
        };
        Self {
            name: name.into(),
            lens,
            width_px,
            height_px,
            // Defaults to a 36mm film back.
            resolution: Resolution::FilmSize {
                width: 36.0,
                height: 36.0 * aspect,
            },
            film_offset: (0.0, 0.0),
            control_points: Vec::new(),
            orientation: None,
            grid: None,
            fade_mask: None,
            untextured_color: Rgba::opaque(0.5, 0.5, 0.5),
        }
    }
}

/// One photograph: a lens, a morph grid, the pixel/uv/mm transform chain, an
/// orientation, and its named control points.
///
/// Pixel space has its origin at the top-left with y running down; uv spans
/// the unit square with (0, 0) at the bottom-left; film millimetres are
/// centred on the optical axis. The three transform pairs are mutually
/// inverse and the middle one composes the outer two.
pub struct Image {
    name: String,
    width_px: u32,
    height_px: u32,
    film_size: (f64, f64),
    film_offset: (f64, f64),

    pixel_to_uv: Affine2<f64>,
    uv_to_pixel: Affine2<f64>,
    uv_to_mm: Affine2<f64>,
    mm_to_uv: Affine2<f64>,
    pixel_to_mm: Affine2<f64>,
    mm_to_pixel: Affine2<f64>,

    lens: Box<dyn Lens>,
    rotation: Rotation3<f64>,
    grid: MorphGrid,
    control_points: BTreeMap<String, Point2<f64>>,
    orientation: Option<PoseSpec>,
    index: Option<usize>,
    untextured: Rgba,

    source: Option<Box<dyn PixelSource>>,
    fade: Option<Box<dyn PixelSource>>,
    fade_mask: Option<String>,
}

impl Image {
    pub fn new(params: ImageParams) -> Result<Self, StitchError> {
        let ImageParams {
            name,
            lens,
            width_px,
            height_px,
            resolution,
            film_offset,
            control_points,
            orientation,
            grid,
            fade_mask,
            untextured_color,
        } = params;

        if width_px == 0 || height_px == 0 {
            return Err(StitchError::ZeroDimensions {
                name,
                width: width_px,
                height: height_px,
            });
        }

        let film_size = match resolution {
            Resolution::PixelsPerMm { x, y } if x > 0.0 && y > 0.0 => {
                (width_px as f64 / x, height_px as f64 / y)
            }
            Resolution::FilmSize { width, height } if width > 0.0 && height > 0.0 => {
                (width, height)
            }
            _ => return Err(StitchError::BadResolution { name }),
        };

        let (x_verts, y_verts) = grid.unwrap_or((2, 2));
        if x_verts < 2 || y_verts < 2 {
            return Err(StitchError::BadGrid {
                name,
                x_verts,
                y_verts,
            });
        }

        let lens = lens.build(&name)?;

        let pixel_to_uv = Affine2::from_matrix_unchecked(Matrix3::new(
            1.0 / width_px as f64,
            0.0,
            0.0,
            0.0,
            -1.0 / height_px as f64,
            1.0,
            0.0,
            0.0,
            1.0,
        ));
        let uv_to_mm = Affine2::from_matrix_unchecked(Matrix3::new(
            film_size.0,
            0.0,
            -film_size.0 / 2.0 + film_offset.0,
            0.0,
            film_size.1,
            -film_size.1 / 2.0 + film_offset.1,
            0.0,
            0.0,
            1.0,
        ));
        let pixel_to_mm = uv_to_mm * pixel_to_uv;

        let control_points = control_points
            .into_iter()
            .map(|(point, (x, y))| (point, pixel_to_uv.transform_point(&Point2::new(x, y))))
            .collect();

        Ok(Self {
            name,
            width_px,
            height_px,
            film_size,
            film_offset,
            pixel_to_uv,
            uv_to_pixel: pixel_to_uv.inverse(),
            uv_to_mm,
            mm_to_uv: uv_to_mm.inverse(),
            pixel_to_mm,
            mm_to_pixel: pixel_to_mm.inverse(),
            lens,
            rotation: Rotation3::identity(),
            grid: MorphGrid::new(x_verts, y_verts),
            control_points,
            orientation,
            index: None,
            untextured: untextured_color,
            source: None,
            fade: None,
            fade_mask,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_px(&self) -> (u32, u32) {
        (self.width_px, self.height_px)
    }

    pub fn film_size(&self) -> (f64, f64) {
        self.film_size
    }

    pub fn film_width(&self) -> f64 {
        self.film_size.0
    }

    pub fn film_offset(&self) -> (f64, f64) {
        self.film_offset
    }

    pub fn lens(&self) -> &dyn Lens {
        &*self.lens
    }

    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    pub fn set_rotation(&mut self, rotation: Rotation3<f64>) {
        self.rotation = rotation;
    }

    pub fn grid(&self) -> &MorphGrid {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut MorphGrid {
        &mut self.grid
    }

    /// Control point positions in uv space.
    pub fn control_points(&self) -> &BTreeMap<String, Point2<f64>> {
        &self.control_points
    }

    /// Registers a named point given in pixel space.
    pub fn add_control_point(&mut self, name: impl Into<String>, pixel: Point2<f64>) {
        self.control_points
            .insert(name.into(), self.pixel_to_uv.transform_point(&pixel));
    }

    pub fn orientation(&self) -> Option<&PoseSpec> {
        self.orientation.as_ref()
    }

    /// Placement order assigned by the stitcher; `None` until registered.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = Some(index);
    }

    pub fn untextured_color(&self) -> Rgba {
        self.untextured
    }

    pub fn set_untextured_color(&mut self, color: Rgba) {
        self.untextured = color;
    }

    pub fn set_source(&mut self, source: Box<dyn PixelSource>) {
        self.source = Some(source);
    }

    pub fn set_fade_source(&mut self, source: Box<dyn PixelSource>) {
        self.fade = Some(source);
    }

    /// Fade-mask filename carried through from the parameters, for the
    /// front end that resolves files.
    pub fn fade_mask(&self) -> Option<&str> {
        self.fade_mask.as_deref()
    }

    /// Reads the pixel source if one is attached. A failed read is reported
    /// and the image falls back to its untextured color.
    pub(crate) fn read_source(&mut self) -> Option<RasterImage> {
        let source = self.source.as_mut()?;
        match source.read() {
            Ok(raster) => Some(raster),
            Err(error) => {
                warn!(image = %self.name, %error, "pixel source read failed, rendering untextured");
                None
            }
        }
    }

    pub(crate) fn read_fade(&mut self) -> Option<RasterImage> {
        let fade = self.fade.as_mut()?;
        match fade.read() {
            Ok(raster) => Some(raster),
            Err(error) => {
                warn!(image = %self.name, %error, "fade mask read failed, ignoring mask");
                None
            }
        }
    }

    pub fn uv_to_pixel(&self) -> &Affine2<f64> {
        &self.uv_to_pixel
    }

    pub fn pixel_to_uv(&self) -> &Affine2<f64> {
        &self.pixel_to_uv
    }

    pub fn uv_to_mm(&self) -> &Affine2<f64> {
        &self.uv_to_mm
    }

    pub fn mm_to_uv(&self) -> &Affine2<f64> {
        &self.mm_to_uv
    }

    pub fn pixel_to_mm(&self) -> &Affine2<f64> {
        &self.pixel_to_mm
    }

    pub fn mm_to_pixel(&self) -> &Affine2<f64> {
        &self.mm_to_pixel
    }

    /// Extrudes a uv position through the lens and the image's rotation
    /// into a world-frame unit ray.
    pub fn world_ray_from_uv(&self, uv: Point2<f64>) -> Vector3<f64> {
        let mm = self.uv_to_mm.transform_point(&uv);
        self.rotation * self.lens.extrude(mm, self.film_size.0)
    }

    /// Projects a world-frame ray back onto this image's uv square.
    pub fn uv_from_world_ray(&self, ray: Vector3<f64>) -> Point2<f64> {
        let mm = self.lens.project(self.rotation.inverse() * ray, self.film_size.0);
        self.mm_to_uv.transform_point(&mm)
    }

    pub fn contains_uv(&self, uv: Point2<f64>) -> bool {
        (0.0..=1.0).contains(&uv.x) && (0.0..=1.0).contains(&uv.y)
    }
}
