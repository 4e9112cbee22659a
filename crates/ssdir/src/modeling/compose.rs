//! Compositing of rendered objects into one image.
//!
//! Every image of a batch may contain a different number of present objects. The rendered
//! objects of the whole batch are kept in one flat `[n, C, H, W]` tensor, and turned into a
//! padded `[N, max + 1, C, H, W]` stack by gathering with a computed index array. Index 0 of the
//! flat tensor is reserved for an empty *starter* object with depth `-inf`, which also serves as
//! padding.

use candle_core::Tensor;

use crate::num;

/// Chooses how objects that are not present are handled when compositing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Compositing {
    /// Only present objects are rendered, and the per-image stacks are padded to the largest
    /// object count in the batch.
    #[default]
    DropEmpty,
    /// All objects are rendered. Objects that are not present get the depth `empty_depth`, which
    /// should be low enough for their weight to vanish.
    MaskEmpty { empty_depth: f32 },
}

impl Compositing {
    /// The masking policy with its default depth of `-1000`.
    pub fn mask_empty() -> Self {
        Self::MaskEmpty {
            empty_depth: -1000.0,
        }
    }
}

/// Computes the gather indices that turn flat per-object data into padded per-image stacks.
///
/// `n_present[i]` is the number of objects of image `i`. Objects are expected to be stored
/// image by image starting at flat index 1. Every image gets `max(n_present) + 1` entries: the
/// starter (index 0), its own objects in order, and index 0 as padding.
pub fn pad_indices(n_present: &[usize]) -> Vec<u32> {
    let width = n_present.iter().copied().max().unwrap_or(0) + 1;
    let mut indices = Vec::with_capacity(n_present.len() * width);
    let mut next = 1;
    for &count in n_present {
        indices.push(0);
        indices.extend(next..next + count as u32);
        indices.extend(std::iter::repeat(0).take(width - 1 - count));
        next += count as u32;
    }
    indices
}

/// Pads flat per-object images and depths into per-image stacks.
///
/// `images` is `[n, C, H, W]`, `depths` is `[n]` or `[n, 1]`, with
/// `n == n_present.iter().sum()`. Returns `[N, max + 1, C, H, W]` images and `[N, max + 1]`
/// depths, where `N == n_present.len()`.
pub fn pad_reconstructions(
    images: &Tensor,
    depths: &Tensor,
    n_present: &[usize],
) -> anyhow::Result<(Tensor, Tensor)> {
    let (n, c, h, w) = images.dims4()?;
    let total = n_present.iter().sum::<usize>();
    if n != total || depths.elem_count() != total {
        anyhow::bail!(
            "{} present objects, but got {n} images and {} depths",
            total,
            depths.elem_count()
        );
    }

    let device = images.device();
    let starter_image = Tensor::zeros((1, c, h, w), images.dtype(), device)?;
    let starter_depth = Tensor::new(&[f32::NEG_INFINITY], device)?.to_dtype(depths.dtype())?;
    let images = Tensor::cat(&[&starter_image, images], 0)?;
    let depths = Tensor::cat(&[&starter_depth, &depths.flatten_all()?], 0)?;

    let batch = n_present.len();
    let width = n_present.iter().copied().max().unwrap_or(0) + 1;
    let indices = Tensor::new(pad_indices(n_present), device)?;
    let images = images
        .index_select(&indices, 0)?
        .reshape((batch, width, c, h, w))?;
    let depths = depths.index_select(&indices, 0)?.reshape((batch, width))?;
    Ok((images, depths))
}

/// Turns `[N, K]` depths into per-image compositing weights.
///
/// Weights of each image sum to 1, objects with depth `-inf` get a weight of 0. An image without
/// any finite depth gets all-zero weights.
pub fn depth_weights(depths: &Tensor) -> candle_core::Result<Tensor> {
    num::softmax_or_zero(depths, 1)
}

/// Computes the weighted sum of `[N, K, C, H, W]` images with `[N, K]` weights.
pub fn merge_reconstructions(images: &Tensor, weights: &Tensor) -> anyhow::Result<Tensor> {
    let (n, k, _, _, _) = images.dims5()?;
    if weights.dims() != [n, k] {
        anyhow::bail!(
            "cannot merge {n}x{k} images with weights of shape {:?}",
            weights.dims()
        );
    }
    let weights = weights.to_dtype(images.dtype())?.reshape((n, k, 1, 1, 1))?;
    Ok(images.broadcast_mul(&weights)?.sum(1)?)
}

/// Builds the `[N, K]` depths used by [`Compositing::MaskEmpty`].
///
/// Where `present` (`[N, K]` or `[N, K, 1]`) is not exactly 1, the depth is replaced with
/// `empty_depth`.
pub fn mask_depths(depths: &Tensor, present: &Tensor, empty_depth: f32) -> anyhow::Result<Tensor> {
    let (n, k) = (depths.dim(0)?, depths.dim(1)?);
    let depths = depths.reshape((n, k))?;
    let present = present.reshape((n, k))?;
    let empty = Tensor::full(empty_depth, (n, k), depths.device())?.to_dtype(depths.dtype())?;
    Ok(present.eq(1.0)?.where_cond(&depths, &empty)?)
}
