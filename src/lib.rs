//! A panoramic image stitching engine.
//!
//! Given a set of photographs, each with a lens model and a handful of named
//! correspondence points, the engine solves every photograph's orientation
//! relative to a common frame, re-projects each one through an arbitrary
//! output lens, and blends the overlaps with smooth edge feathering.
//!
//! The pipeline runs in two stages. [`Stitcher`] registers the images:
//! greedy placement ordered by how many already-known control points each
//! image shares, a pairwise anchor search for each rotation, and a morph
//! grid nudge absorbing whatever misalignment the rotation leaves behind.
//! [`rasterizer::draw_image`] then renders any placed image into a
//! destination raster through any output lens, with the lens itself
//! handling its seams and singular points.
//!
//! Command-file parsing and raster file I/O live in the front ends; this
//! crate consumes [`ImageParams`](image::ImageParams) records and opaque
//! [`PixelSource`](raster::PixelSource)s and writes into in-memory
//! [`RasterImage`](raster::RasterImage) buffers.

pub mod error;
pub mod geom;
pub mod image;
pub mod lens;
pub mod morph;
pub mod point;
pub mod raster;
pub mod rasterizer;
pub mod stitcher;

pub use error::{SourceError, StitchError};
pub use image::{Image, ImageParams, LensFamily, LensSpec, PoseSpec, Resolution};
pub use raster::{PixelSource, RasterImage, Rgba};
pub use rasterizer::{DrawOptions, DrawStats, draw_image};
pub use stitcher::{StitchReport, Stitcher};
