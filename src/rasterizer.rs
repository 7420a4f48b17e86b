use crate::{
    image::Image,
    lens::DrawContext,
    morph::{Table, TriangleCache},
    raster::{RasterImage, Rgba},
};
use nalgebra::{Point2, Vector3};
use tracing::debug;

const FP_BITS: u32 = 11;
const FP_ONE: i64 = 1 << FP_BITS;

// Bound on any fixed-point magnitude. Keeps accumulators from wrapping when
// a degenerate sliver produces effectively infinite gradients.
const FP_MAX: f64 = (1i64 << 42) as f64;

fn to_fp(v: f64) -> i64 {
    (v * FP_ONE as f64).round().clamp(-FP_MAX, FP_MAX) as i64
}

fn fp_to_f64(v: i64) -> f64 {
    v as f64 / FP_ONE as f64
}

fn fp_ceil(v: i64) -> i64 {
    v.saturating_add(FP_ONE - 1) >> FP_BITS
}

fn fp_of_int(v: i64) -> i64 {
    v << FP_BITS
}

fn fp_mul(a: i64, b: i64) -> i64 {
    ((a as i128 * b as i128) >> FP_BITS)
        .clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// One corner of a triangle handed to the rasterizer.
#[derive(Clone, Copy, Debug)]
pub struct RasterizerVertex {
    /// Position in destination pixels.
    pub screen: Point2<f64>,

    /// Position in source texels.
    pub uv: Point2<f64>,

    /// Unit view ray in the destination camera frame. The rasterizer itself
    /// never reads this; lenses use it to re-project vertices around seams.
    pub space: Vector3<f64>,

    /// Blend weight in `[0, 1]`.
    pub alpha: f64,

    /// Out-of-bounds conditions, from [`visibility_mask`].
    pub visibility: u8,
}

/// Computes the 8-bit out-of-bounds mask for a destination position.
///
/// The low four bits are the destination edges, the high four a guard band
/// one destination-size away. A triangle whose three vertices share any bit
/// lies entirely on the far side of that boundary.
pub fn visibility_mask(p: Point2<f64>, dest_size: (usize, usize)) -> u8 {
    let (w, h) = (dest_size.0 as f64, dest_size.1 as f64);
    let mut mask = 0;
    if p.x < 0.0 {
        mask |= 0x01;
    }
    if p.x >= w {
        mask |= 0x02;
    }
    if p.y < 0.0 {
        mask |= 0x04;
    }
    if p.y >= h {
        mask |= 0x08;
    }
    if p.x < -w {
        mask |= 0x10;
    }
    if p.x >= 2.0 * w {
        mask |= 0x20;
    }
    if p.y < -h {
        mask |= 0x40;
    }
    if p.y >= 2.0 * h {
        mask |= 0x80;
    }
    mask
}

/// Counters accumulated over one rasterization pass.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DrawStats {
    pub triangles_drawn: usize,
    pub triangles_rejected: usize,
    pub pixels_written: usize,
}

/// An edge being walked one scanline at a time in fixed point.
///
/// Adding the fixed-point slope every scanline is what decides, through the
/// accumulated fractional error, whether a given line takes the inner or the
/// outer integer x-step, so adjacent spans meet without seams.
struct Edge {
    x: i64,
    slope: i64,
    y: i64,
    y_end: i64,
}

impl Edge {
    fn new(from: Point2<f64>, to: Point2<f64>) -> Option<Edge> {
        let y = from.y.ceil() as i64;
        let y_end = to.y.ceil() as i64;
        if y >= y_end {
            return None;
        }
        let slope = (to.x - from.x) / (to.y - from.y);
        Some(Edge {
            x: to_fp(from.x + (y as f64 - from.y) * slope),
            slope: to_fp(slope),
            y,
            y_end,
        })
    }

    fn step(&mut self) {
        self.x = self.x.saturating_add(self.slope);
        self.y += 1;
    }

    /// Advances `k` scanlines at once. Fixed-point addition carries no
    /// per-step rounding, so one jump lands exactly where `k` single steps
    /// would.
    fn advance(&mut self, k: i64) {
        self.x = self.x.saturating_add(fp_scale(self.slope, k));
        self.y += k;
    }
}

// step * k, saturating instead of wrapping for far off-screen jumps.
fn fp_scale(step: i64, k: i64) -> i64 {
    (step as i128 * k as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Incremental scanline rasterizer compositing source texels into a
/// destination raster.
pub struct TriangleRasterizer<'a> {
    dest: &'a mut RasterImage,
    source: Option<&'a RasterImage>,
    untextured: Rgba,
    filter_output: bool,
    stats: DrawStats,
}

impl<'a> TriangleRasterizer<'a> {
    pub fn new(
        dest: &'a mut RasterImage,
        source: Option<&'a RasterImage>,
        untextured: Rgba,
        filter_output: bool,
    ) -> Self {
        Self {
            dest,
            source,
            untextured,
            filter_output,
            stats: DrawStats::default(),
        }
    }

    pub fn stats(&self) -> DrawStats {
        self.stats
    }

    pub fn dest_size(&self) -> (usize, usize) {
        (self.dest.width(), self.dest.height())
    }

    /// Renders one triangle, interpolating alpha and source texel
    /// coordinates across its span.
    pub fn draw_triangle(
        &mut self,
        v0: &RasterizerVertex,
        v1: &RasterizerVertex,
        v2: &RasterizerVertex,
    ) {
        if v0.visibility & v1.visibility & v2.visibility != 0 {
            self.stats.triangles_rejected += 1;
            return;
        }

        let mut vs = [v0, v1, v2];
        if vs[1].screen.y < vs[0].screen.y {
            vs.swap(0, 1);
        }
        if vs[2].screen.y < vs[1].screen.y {
            vs.swap(1, 2);
        }
        if vs[1].screen.y < vs[0].screen.y {
            vs.swap(0, 1);
        }
        let [a, b, c] = vs;

        let (x0, y0) = (a.screen.x, a.screen.y);
        let area2 =
            (b.screen.x - x0) * (c.screen.y - y0) - (c.screen.x - x0) * (b.screen.y - y0);

        // An exactly zero area has no span and would poison the gradient
        // division. Near-zero slivers are kept; the grid walk produces them
        // on purpose.
        if area2 == 0.0 {
            return;
        }
        self.stats.triangles_drawn += 1;

        let inv = 1.0 / area2;
        let grad = |f0: f64, f1: f64, f2: f64| -> (f64, f64) {
            (
                ((f1 - f0) * (c.screen.y - y0) - (f2 - f0) * (b.screen.y - y0)) * inv,
                ((f2 - f0) * (b.screen.x - x0) - (f1 - f0) * (c.screen.x - x0)) * inv,
            )
        };
        let (dadx, dady) = grad(a.alpha, b.alpha, c.alpha);
        let (dsdx, dsdy) = grad(a.uv.x, b.uv.x, c.uv.x);
        let (dtdx, dtdy) = grad(a.uv.y, b.uv.y, c.uv.y);

        let radius = dsdx.abs().max(dtdx.abs()).max(dsdy.abs()).max(dtdy.abs()) * 0.5;

        let Some(mut long) = Edge::new(a.screen, c.screen) else {
            return;
        };
        let long_slope = (c.screen.x - a.screen.x) / (c.screen.y - a.screen.y);

        // Attribute accumulators are pinned to the long edge so both halves
        // extrapolate spans from the same anchor.
        let (long_y0, long_x0) = (long.y as f64, fp_to_f64(long.x));
        let edge_value = move |f0: f64, ddx: f64, ddy: f64| {
            to_fp(f0 + (long_y0 - y0) * ddy + (long_x0 - x0) * ddx)
        };
        let edge_step = |ddx: f64, ddy: f64| to_fp(ddy + ddx * long_slope);

        let mut al = edge_value(a.alpha, dadx, dady);
        let mut s = edge_value(a.uv.x, dsdx, dsdy);
        let mut t = edge_value(a.uv.y, dtdx, dtdy);
        let al_step = edge_step(dadx, dady);
        let s_step = edge_step(dsdx, dsdy);
        let t_step = edge_step(dtdx, dtdy);

        let dadx_fp = to_fp(dadx);
        let dsdx_fp = to_fp(dsdx);
        let dtdx_fp = to_fp(dtdx);

        // Sign of the doubled area tells which side the long edge runs on.
        let left_long = area2 > 0.0;
        let height = self.dest.height() as i64;

        for (from, to) in [(a, b), (b, c)] {
            let Some(mut short) = Edge::new(from.screen, to.screen) else {
                continue;
            };
            loop {
                let remaining = (short.y_end - short.y).min(long.y_end - long.y);
                if remaining <= 0 {
                    break;
                }
                // Jump over rows outside the destination in one exact step;
                // rows past the bottom still have to be consumed so the
                // second half stays aligned with the long edge.
                let skip = if long.y < 0 {
                    remaining.min(-long.y)
                } else if long.y >= height {
                    remaining
                } else {
                    0
                };
                if skip > 0 {
                    short.advance(skip);
                    long.advance(skip);
                    al = al.saturating_add(fp_scale(al_step, skip));
                    s = s.saturating_add(fp_scale(s_step, skip));
                    t = t.saturating_add(fp_scale(t_step, skip));
                    continue;
                }

                let (xl, xr) = if left_long {
                    (long.x, short.x)
                } else {
                    (short.x, long.x)
                };
                self.span(long.y, xl, xr, long.x, al, s, t, dadx_fp, dsdx_fp, dtdx_fp, radius);
                short.step();
                long.step();
                al = al.saturating_add(al_step);
                s = s.saturating_add(s_step);
                t = t.saturating_add(t_step);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn span(
        &mut self,
        y: i64,
        xl: i64,
        xr: i64,
        anchor: i64,
        al: i64,
        s: i64,
        t: i64,
        dadx: i64,
        dsdx: i64,
        dtdx: i64,
        radius: f64,
    ) {
        let x0 = fp_ceil(xl).max(0);
        let x1 = fp_ceil(xr).min(self.dest.width() as i64);
        if x0 >= x1 {
            return;
        }

        let dist = fp_of_int(x0).saturating_sub(anchor);
        let mut al = al.saturating_add(fp_mul(dadx, dist));
        let mut s = s.saturating_add(fp_mul(dsdx, dist));
        let mut t = t.saturating_add(fp_mul(dtdx, dist));

        for x in x0..x1 {
            let alpha = fp_to_f64(al).clamp(0.0, 1.0);
            if alpha > 0.0 {
                let color = match self.source {
                    Some(_) => self.filter_pixel(fp_to_f64(s), fp_to_f64(t), radius),
                    None => Some(self.untextured),
                };
                if let Some(color) = color {
                    self.dest.blend(x as usize, y as usize, color, alpha);
                    self.stats.pixels_written += 1;
                }
            }
            al = al.saturating_add(dadx);
            s = s.saturating_add(dsdx);
            t = t.saturating_add(dtdx);
        }
    }

    /// Draws a single pixel; the degenerate path used by singularity sweeps
    /// and point markers.
    pub fn draw_pixel(&mut self, v: &RasterizerVertex, radius: f64) {
        let x = v.screen.x.round() as i64;
        let y = v.screen.y.round() as i64;
        if !self.dest.contains(x, y) {
            return;
        }
        let alpha = v.alpha.clamp(0.0, 1.0);
        if alpha <= 0.0 {
            return;
        }
        let color = match self.source {
            Some(_) => self.filter_pixel(v.uv.x, v.uv.y, radius),
            None => Some(self.untextured),
        };
        if let Some(color) = color {
            self.dest.blend(x as usize, y as usize, color, alpha);
            self.stats.pixels_written += 1;
        }
    }

    /// Samples the source at `(s, t)` texels.
    ///
    /// Below half a texel of footprint this is a nearest lookup; beyond it a
    /// square box average of the given radius. Texels outside the source do
    /// not contribute, and a sample with no contributing texels yields
    /// `None` (the pixel is skipped, not clamped).
    fn filter_pixel(&self, s: f64, t: f64, radius: f64) -> Option<Rgba> {
        let source = self.source?;
        let cx = s.round() as i64;
        let cy = t.round() as i64;

        if !self.filter_output || radius < 0.5 {
            return source.texel(cx, cy);
        }

        let r = radius.round().clamp(1.0, 64.0) as i64;
        let mut sum = [0.0f64; 4];
        let mut n = 0u32;
        for y in (cy - r)..=(cy + r) {
            for x in (cx - r)..=(cx + r) {
                if let Some(px) = source.texel(x, y) {
                    sum[0] += px.r;
                    sum[1] += px.g;
                    sum[2] += px.b;
                    sum[3] += px.a;
                    n += 1;
                }
            }
        }
        (n > 0).then(|| {
            let inv = 1.0 / n as f64;
            Rgba::new(sum[0] * inv, sum[1] * inv, sum[2] * inv, sum[3] * inv)
        })
    }
}

/// Knobs for one [`draw_image`] pass.
#[derive(Clone, Copy, Debug)]
pub struct DrawOptions {
    /// Quad-grid cells walked across the input image.
    pub grid: (usize, usize),

    /// Enables the box filter in [`TriangleRasterizer`]; nearest sampling
    /// otherwise.
    pub filter_output: bool,
}

impl Default for DrawOptions {
    fn default() -> Self {
        Self {
            grid: (32, 32),
            filter_output: true,
        }
    }
}

fn fade_factor(fade: Option<&RasterImage>, uv: Point2<f64>) -> f64 {
    let Some(mask) = fade else {
        return 1.0;
    };
    let x = (uv.x * mask.width() as f64).floor() as i64;
    let y = ((1.0 - uv.y) * mask.height() as f64).floor() as i64;
    match mask.texel(x.clamp(0, mask.width() as i64 - 1), y.clamp(0, mask.height() as i64 - 1)) {
        Some(px) => (px.r + px.g + px.b) / 3.0,
        None => 1.0,
    }
}

fn make_vertex(
    input: &Image,
    output: &Image,
    ctx: &DrawContext,
    uv: Point2<f64>,
    fade: Option<&RasterImage>,
    cache: &mut TriangleCache,
) -> RasterizerVertex {
    let grid = input.grid();
    let texel_uv = grid.morph_point(uv, Table::Canonical, Table::Observed, cache);
    let alpha = grid.get_alpha(uv, Table::Canonical, cache) * fade_factor(fade, uv);

    let world = input.world_ray_from_uv(uv);
    let cam = output.rotation().inverse() * world;
    let mm = output.lens().project(cam, ctx.film_width);
    let screen = ctx.mm_to_pixel.transform_point(&mm);

    RasterizerVertex {
        screen,
        uv: input.uv_to_pixel().transform_point(&texel_uv),
        space: cam,
        alpha,
        visibility: visibility_mask(screen, ctx.dest_size),
    }
}

/// Rasterizes `input` into `dest` as seen through `output`'s lens and
/// orientation.
///
/// The input image is walked as a quad grid; every grid corner is projected
/// through the input rotation and the output lens, every cell's two
/// triangles are routed through the output lens (which owns seam and
/// singularity handling), and any region the main pass rejected is swept
/// pixel-by-pixel afterwards. The input's pixel source is read when the pass
/// starts and released when it ends.
pub fn draw_image(
    input: &mut Image,
    output: &Image,
    dest: &mut RasterImage,
    options: &DrawOptions,
) -> DrawStats {
    let source = input.read_source();
    let fade = input.read_fade();
    let input: &Image = &*input;

    let ctx = DrawContext {
        mm_to_pixel: *output.mm_to_pixel(),
        pixel_to_mm: *output.pixel_to_mm(),
        film_width: output.film_width(),
        dest_size: (dest.width(), dest.height()),
    };
    let mut rast = TriangleRasterizer::new(
        dest,
        source.as_ref(),
        input.untextured_color(),
        options.filter_output,
    );

    let (gx, gy) = options.grid;
    let (gx, gy) = (gx.max(1), gy.max(1));
    let mut cache = TriangleCache::default();
    let mut verts = Vec::with_capacity((gx + 1) * (gy + 1));
    for j in 0..=gy {
        for i in 0..=gx {
            let uv = Point2::new(i as f64 / gx as f64, j as f64 / gy as f64);
            verts.push(make_vertex(input, output, &ctx, uv, fade.as_ref(), &mut cache));
        }
    }

    let mut flags = 0u8;
    for j in 0..gy {
        for i in 0..gx {
            let v00 = &verts[j * (gx + 1) + i];
            let v10 = &verts[j * (gx + 1) + i + 1];
            let v01 = &verts[(j + 1) * (gx + 1) + i];
            let v11 = &verts[(j + 1) * (gx + 1) + i + 1];
            let lens = output.lens();
            lens.draw_triangle(&mut rast, &ctx, [v00, v10, v11], &mut flags);
            lens.draw_triangle(&mut rast, &ctx, [v00, v11, v01], &mut flags);
        }
    }

    if flags != 0 {
        let mut cache = TriangleCache::default();
        let rotation = *output.rotation();
        let mut sample = |cam: Vector3<f64>| -> Option<(Point2<f64>, f64)> {
            let uv = input.uv_from_world_ray(rotation * cam);
            if !input.contains_uv(uv) {
                return None;
            }
            let grid = input.grid();
            let texel_uv = grid.morph_point(uv, Table::Canonical, Table::Observed, &mut cache);
            let alpha = grid.get_alpha(uv, Table::Canonical, &mut cache) * fade_factor(fade.as_ref(), uv);
            Some((input.uv_to_pixel().transform_point(&texel_uv), alpha))
        };
        output
            .lens()
            .pick_up_singularity(&mut rast, &ctx, flags, &mut sample);
    }

    let stats = rast.stats();
    debug!(
        input = %input.name(),
        triangles = stats.triangles_drawn,
        rejected = stats.triangles_rejected,
        pixels = stats.pixels_written,
        "rasterized image"
    );
    stats
}
