use thiserror::Error;

/// Errors raised while building images from parser output.
#[derive(Debug, Error)]
pub enum StitchError {
    #[error("image `{name}` has a zero pixel dimension: {width}x{height}")]
    ZeroDimensions {
        name: String,
        width: u32,
        height: u32,
    },

    #[error("image `{name}` has a non-positive resolution or film size")]
    BadResolution { name: String },

    #[error("image `{name}` declares a lens with neither focal length nor field of view")]
    LensWithoutFocus { name: String },

    #[error("image `{name}` asks for a {x_verts}x{y_verts} morph grid; both sides need at least 2 vertices")]
    BadGrid {
        name: String,
        x_verts: usize,
        y_verts: usize,
    },
}

/// Errors raised by a [`PixelSource`](crate::raster::PixelSource) when the
/// backing raster cannot be produced.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("pixel source unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("pixel source decode failed: {reason}")]
    Decode { reason: String },
}
