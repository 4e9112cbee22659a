//! Box (`z_where`) encoder and the spatial transformer placing glimpses on the canvas.

use std::fmt;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Conv2d, Module};

use super::flatten_cells;
use crate::{
    detection::{
        boxes::{convert_locations_to_boxes, convert_to_square},
        ssd::SsdConfig,
        BoxPredictor,
    },
    iter::zip_levels,
};

/// Predicts one box per anchor by decoding the SSD regression heads against the priors.
pub struct WhereEncoder {
    reg_headers: Vec<Conv2d>,
    priors: Tensor,
    center_variance: f32,
    size_variance: f32,
    square_boxes: bool,
}

impl WhereEncoder {
    /// Creates a box encoder from the SSD's regression heads.
    ///
    /// `priors` is the `[anchors, 4]` tensor of prior boxes.
    pub fn new(
        predictor: BoxPredictor,
        priors: Tensor,
        config: &SsdConfig,
        square_boxes: bool,
    ) -> anyhow::Result<Self> {
        let (anchors, four) = priors.dims2()?;
        if four != 4 || anchors != config.anchor_count() {
            anyhow::bail!(
                "expected [{}, 4] prior boxes, got {:?}",
                config.anchor_count(),
                priors.dims(),
            );
        }
        Ok(Self {
            reg_headers: predictor.reg_headers().to_vec(),
            priors,
            center_variance: config.center_variance,
            size_variance: config.size_variance,
            square_boxes,
        })
    }

    /// Computes `[N, anchors, 4]` boxes in normalized `(center_x, center_y, width, height)`.
    pub fn forward(&self, features: &[Tensor]) -> anyhow::Result<Tensor> {
        let mut locations = Vec::with_capacity(features.len());
        for (feature, header) in zip_levels(features, &self.reg_headers)? {
            locations.push(flatten_cells(&header.forward(feature)?, 4)?);
        }
        let locations = Tensor::cat(&locations, 1)?;

        let boxes = convert_locations_to_boxes(
            &locations,
            &self.priors,
            self.center_variance,
            self.size_variance,
        )?;
        if self.square_boxes {
            Ok(convert_to_square(&boxes)?)
        } else {
            Ok(boxes)
        }
    }
}

/// A box with zero width or height was passed to the [`WhereTransformer`].
///
/// Placing a glimpse in such a box would require an infinite scale factor.
#[derive(Debug, Clone, PartialEq)]
pub struct DegenerateBoxError {
    /// Index of the offending box in the flattened batch of boxes.
    pub index: usize,
    pub width: f32,
    pub height: f32,
}

impl fmt::Display for DegenerateBoxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "box {} has degenerate size {}x{}",
            self.index, self.width, self.height
        )
    }
}

impl std::error::Error for DegenerateBoxError {}

/// Differentiably warps glimpses into their boxes on an `image_size x image_size` canvas.
///
/// Each box `(cx, cy, w, h)` is turned into the affine map
///
/// ```text
/// [ 1/w   0   (1 - 2cx)/w ]
/// [  0   1/h  (1 - 2cy)/h ]
/// ```
///
/// from canvas coordinates to glimpse coordinates (both in `[-1, 1]`). The canvas is then
/// bilinearly sampled from the glimpse, and locations outside of the glimpse are zero.
///
/// With `inverse` set, the inverse map is used instead, which crops the box back out of the
/// input.
pub struct WhereTransformer {
    image_size: usize,
    inverse: bool,
}

impl WhereTransformer {
    pub fn new(image_size: usize, inverse: bool) -> Self {
        Self {
            image_size,
            inverse,
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn is_inverse(&self) -> bool {
        self.inverse
    }

    /// Transforms `[n, C, H, W]` glimpses using `[n, 4]` boxes into `[n, C, S, S]` images.
    ///
    /// If `n` is zero, nothing is sampled, the (empty) input is just reshaped.
    pub fn forward(&self, glimpses: &Tensor, boxes: &Tensor) -> anyhow::Result<Tensor> {
        let (n, c, _, _) = glimpses.dims4()?;
        let size = self.image_size;
        if n == 0 {
            return Ok(glimpses.reshape((0, c, size, size))?);
        }
        if boxes.dims() != [n, 4] {
            anyhow::bail!(
                "expected boxes of shape [{n}, 4] for {n} glimpses, got {:?}",
                boxes.dims()
            );
        }
        check_box_sizes(boxes)?;

        let mut theta = box_to_theta(boxes)?;
        if self.inverse {
            theta = invert_theta(&theta)?;
        }
        let grid = affine_grid(&theta, size, size)?;
        Ok(grid_sample(glimpses, &grid, size, size)?)
    }
}

fn check_box_sizes(boxes: &Tensor) -> anyhow::Result<()> {
    let sizes = boxes.narrow(1, 2, 2)?.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    for (index, size) in sizes.iter().enumerate() {
        let (width, height) = (size[0], size[1]);
        if width == 0.0 || height == 0.0 {
            return Err(DegenerateBoxError {
                index,
                width,
                height,
            }
            .into());
        }
    }
    Ok(())
}

/// Converts `[n, 4]` boxes into `[n, 2, 3]` affine matrices.
fn box_to_theta(boxes: &Tensor) -> candle_core::Result<Tensor> {
    let n = boxes.dim(0)?;
    let scale = boxes.narrow(1, 2, 2)?.recip()?;
    let translation = boxes.narrow(1, 0, 2)?.affine(-2.0, 1.0)?.mul(&scale)?;
    // [0, tx, ty, sx, sy]
    let params = Tensor::cat(
        &[
            Tensor::zeros((n, 1), boxes.dtype(), boxes.device())?,
            translation,
            scale,
        ],
        1,
    )?;
    let order = Tensor::new(&[3u32, 0, 1, 0, 4, 2], boxes.device())?;
    params.index_select(&order, 1)?.reshape((n, 2, 3))
}

/// Inverts `[n, 2, 3]` affine matrices, treating them as `[[A, t], [0, 1]]`.
fn invert_theta(theta: &Tensor) -> candle_core::Result<Tensor> {
    let at = |r: usize, c: usize| -> candle_core::Result<Tensor> {
        theta.narrow(1, r, 1)?.narrow(2, c, 1)
    };
    let (a, b, tx) = (at(0, 0)?, at(0, 1)?, at(0, 2)?);
    let (c, d, ty) = (at(1, 0)?, at(1, 1)?, at(1, 2)?);

    let det = ((&a * &d)? - (&b * &c)?)?;
    let ia = (&d / &det)?;
    let ib = (b.neg()? / &det)?;
    let ic = (c.neg()? / &det)?;
    let id = (&a / &det)?;
    let itx = ((&ia * &tx)? + (&ib * &ty)?)?.neg()?;
    let ity = ((&ic * &tx)? + (&id * &ty)?)?.neg()?;

    let row0 = Tensor::cat(&[ia, ib, itx], 2)?;
    let row1 = Tensor::cat(&[ic, id, ity], 2)?;
    Tensor::cat(&[row0, row1], 1)
}

/// Computes the `[n, height * width, 2]` sampling grid of `[n, 2, 3]` affine matrices.
///
/// Output pixel centers are located at `(2j + 1) / width - 1` (and likewise vertically), so the
/// grid covers `[-1, 1]` edge to edge.
fn affine_grid(theta: &Tensor, height: usize, width: usize) -> candle_core::Result<Tensor> {
    let mut base = Vec::with_capacity(height * width * 3);
    for y in 0..height {
        let fy = (2 * y + 1) as f32 / height as f32 - 1.0;
        for x in 0..width {
            let fx = (2 * x + 1) as f32 / width as f32 - 1.0;
            base.extend_from_slice(&[fx, fy, 1.0]);
        }
    }
    let base = Tensor::from_vec(base, (1, height * width, 3), theta.device())?
        .to_dtype(theta.dtype())?;
    base.broadcast_matmul(&theta.transpose(1, 2)?.contiguous()?)
}

/// Bilinearly samples `[n, C, H, W]` inputs at the `[n, P, 2]` grid locations.
///
/// Grid coordinates are in `[-1, 1]`, `-1` being the left/top edge of the input. Samples outside
/// of the input read zeros. Returns `[n, C, out_height, out_width]` with `P` equal to
/// `out_height * out_width`.
fn grid_sample(
    input: &Tensor,
    grid: &Tensor,
    out_height: usize,
    out_width: usize,
) -> candle_core::Result<Tensor> {
    let (n, c, in_h, in_w) = input.dims4()?;
    let points = grid.dim(1)?;
    assert_eq!(points, out_height * out_width);

    let to_pixels = |coord: Tensor, size: usize| {
        let size = size as f64;
        coord.affine(size / 2.0, (size - 1.0) / 2.0)
    };
    let ix = to_pixels(grid.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?, in_w)?;
    let iy = to_pixels(grid.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?, in_h)?;

    // Corner positions carry no gradient, the interpolation weights do.
    let x0 = ix.detach().floor()?;
    let y0 = iy.detach().floor()?;
    let x1 = x0.affine(1.0, 1.0)?;
    let y1 = y0.affine(1.0, 1.0)?;
    let wx0 = (&x1 - &ix)?;
    let wx1 = (&ix - &x0)?;
    let wy0 = (&y1 - &iy)?;
    let wy1 = (&iy - &y0)?;

    let flat = input.reshape((n, c, in_h * in_w))?;
    let corners = [
        (&x0, &y0, (&wx0 * &wy0)?),
        (&x1, &y0, (&wx1 * &wy0)?),
        (&x0, &y1, (&wx0 * &wy1)?),
        (&x1, &y1, (&wx1 * &wy1)?),
    ];

    let mut out = Tensor::zeros((n, c, points), input.dtype(), input.device())?;
    for (x, y, weight) in corners {
        let valid = (in_range(x, in_w)? * in_range(y, in_h)?)?;
        let index = (y.clamp(0.0, (in_h - 1) as f64)? * in_w as f64)?
            .add(&x.clamp(0.0, (in_w - 1) as f64)?)?
            .to_dtype(DType::U32)?
            .unsqueeze(1)?
            .broadcast_as((n, c, points))?
            .contiguous()?;
        let values = flat.gather(&index, 2)?;
        let weight = (weight * valid)?.unsqueeze(1)?;
        out = (out + values.broadcast_mul(&weight)?)?;
    }
    out.reshape((n, c, out_height, out_width))
}

/// `1.0` where `0 <= coord <= size - 1`, `0.0` elsewhere.
fn in_range(coord: &Tensor, size: usize) -> candle_core::Result<Tensor> {
    let lower = coord.ge(0.0)?.to_dtype(coord.dtype())?;
    let upper = coord.le((size - 1) as f64)?.to_dtype(coord.dtype())?;
    lower * upper
}

/// Creates the `[1, 4]` box covering the whole canvas.
pub(crate) fn whole_image_box(device: &Device) -> candle_core::Result<Tensor> {
    Tensor::new(&[[0.5f32, 0.5, 1.0, 1.0]], device)
}
