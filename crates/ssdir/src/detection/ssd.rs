//! Anchor/Prior geometry of Single Shot MultiBox Detectors (SSDs).
//!
//! An SSD predicts a fixed number of boxes for every cell of every feature map level. SSDIR keeps
//! two resolutions of latent variables on top of that layout: one entry per *anchor* (box
//! parameters and presence) and one entry per *slot*, i.e. per feature map cell, for appearance
//! and depth. This module defines the geometry of both, and the mapping between them.

use candle_core::{Device, Tensor};
use ndarray::Array2;

/// Describes an output layer of an SSD network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerInfo {
    /// Side length of the (square) feature map, in cells.
    grid: usize,
    /// Number of anchors per feature map cell. Must be non-zero.
    boxes_per_cell: usize,
    /// Size of the smallest prior box, in input image pixels.
    min_size: f32,
    /// Upper size used for the second (large square) prior box, in input image pixels.
    max_size: f32,
}

impl LayerInfo {
    /// Creates a new SSD layer description.
    ///
    /// # Parameters
    ///
    /// - `grid`: side length of this layer's feature map, in output cells.
    /// - `boxes_per_cell`: the number of boxes associated with each cell in this feature map.
    /// - `min_size`/`max_size`: prior box sizes of this layer, in input image pixels.
    pub fn new(grid: usize, boxes_per_cell: usize, min_size: f32, max_size: f32) -> Self {
        assert_ne!(grid, 0);
        assert_ne!(boxes_per_cell, 0);
        Self {
            grid,
            boxes_per_cell,
            min_size,
            max_size,
        }
    }

    #[inline]
    pub fn grid(&self) -> usize {
        self.grid
    }

    #[inline]
    pub fn boxes_per_cell(&self) -> usize {
        self.boxes_per_cell
    }

    /// Returns the number of feature map cells (and thus object slots) of this layer.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.grid * self.grid
    }

    /// Returns the number of anchors of this layer.
    #[inline]
    pub fn anchor_count(&self) -> usize {
        self.cell_count() * self.boxes_per_cell
    }
}

/// Configuration of the SSD detector SSDIR is built on.
#[derive(Debug, Clone)]
pub struct SsdConfig {
    /// Side length of the (square) input images, in pixels.
    pub image_size: usize,
    /// Output layers, from the finest to the coarsest feature map.
    pub layers: Vec<LayerInfo>,
    /// Number of backbone channels of each output layer.
    pub channels: Vec<usize>,
    pub center_variance: f32,
    pub size_variance: f32,
}

impl SsdConfig {
    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.layers.is_empty() {
            anyhow::bail!("SSD configuration needs at least one feature map layer");
        }
        if self.layers.len() != self.channels.len() {
            anyhow::bail!(
                "SSD configuration has {} layers, but {} channel counts",
                self.layers.len(),
                self.channels.len(),
            );
        }
        if self.image_size == 0 || self.channels.contains(&0) {
            anyhow::bail!("SSD image size and channel counts must be non-zero");
        }
        Ok(())
    }

    /// Returns the number of object slots, not counting the background slot.
    pub fn slot_count(&self) -> usize {
        self.layers.iter().map(LayerInfo::cell_count).sum()
    }

    /// Returns the total number of anchors over all layers.
    pub fn anchor_count(&self) -> usize {
        self.layers.iter().map(LayerInfo::anchor_count).sum()
    }

    /// Returns the feature map side lengths of all layers.
    pub fn feature_maps(&self) -> Vec<usize> {
        self.layers.iter().map(LayerInfo::grid).collect()
    }
}

/// The SSD300 layout.
impl Default for SsdConfig {
    fn default() -> Self {
        Self {
            image_size: 300,
            layers: vec![
                LayerInfo::new(38, 4, 30.0, 60.0),
                LayerInfo::new(19, 6, 60.0, 111.0),
                LayerInfo::new(10, 6, 111.0, 162.0),
                LayerInfo::new(5, 6, 162.0, 213.0),
                LayerInfo::new(3, 4, 213.0, 264.0),
                LayerInfo::new(1, 4, 264.0, 315.0),
            ],
            channels: vec![512, 1024, 512, 256, 256, 256],
            center_variance: 0.1,
            size_variance: 0.2,
        }
    }
}

/// A prior box ("anchor") of an SSD network.
///
/// All values are relative to the input image size and range from 0 to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    x_center: f32,
    y_center: f32,
    width: f32,
    height: f32,
}

impl Anchor {
    pub fn x_center(&self) -> f32 {
        self.x_center
    }

    pub fn y_center(&self) -> f32 {
        self.y_center
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }
}

/// The prior boxes of an SSD network, one `(center_x, center_y, width, height)` row per anchor.
///
/// Anchors are ordered by layer, then by feature map row, then by column, then by box. This is
/// the order obtained by flattening a `[N, boxes * 4, H, W]` regression output after permuting it
/// to `[N, H, W, boxes * 4]`.
#[derive(Debug, Clone)]
pub struct PriorBoxes {
    boxes: Array2<f32>,
}

impl PriorBoxes {
    pub fn calculate(config: &SsdConfig) -> Self {
        let mut boxes = Array2::zeros((config.anchor_count(), 4));
        let image_size = config.image_size as f32;

        let mut row = 0;
        for layer in &config.layers {
            let grid = layer.grid as f32;
            let small = layer.min_size / image_size;
            let large = (layer.min_size * layer.max_size).sqrt() / image_size;

            for y in 0..layer.grid {
                for x in 0..layer.grid {
                    let x_center = (x as f32 + 0.5) / grid;
                    let y_center = (y as f32 + 0.5) / grid;

                    for b in 0..layer.boxes_per_cell {
                        let (w, h) = match b {
                            0 => (small, small),
                            1 => (large, large),
                            _ => {
                                // Aspect ratios 2, 2, 3, 3, ... in alternating orientation.
                                let ratio = (2 + (b - 2) / 2) as f32;
                                let stretch = ratio.sqrt();
                                if b % 2 == 0 {
                                    (small * stretch, small / stretch)
                                } else {
                                    (small / stretch, small * stretch)
                                }
                            }
                        };

                        let prior = [x_center, y_center, w, h].map(|v| v.clamp(0.0, 1.0));
                        boxes.row_mut(row).assign(&ndarray::aview1(&prior));
                        row += 1;
                    }
                }
            }
        }
        assert_eq!(row, boxes.nrows());

        log::debug!("calculated {} SSD prior boxes", boxes.nrows());
        Self { boxes }
    }

    /// Returns the total number of SSD anchors/priors.
    pub fn anchor_count(&self) -> usize {
        self.boxes.nrows()
    }

    /// Returns the anchor at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn anchor(&self, index: usize) -> Anchor {
        let row = self.boxes.row(index);
        Anchor {
            x_center: row[0],
            y_center: row[1],
            width: row[2],
            height: row[3],
        }
    }

    /// Uploads the priors as an `[anchors, 4]` tensor.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let data = self.boxes.iter().copied().collect::<Vec<_>>();
        Tensor::from_vec(data, self.boxes.dim(), device)
    }
}

/// Computes the slot each anchor belongs to.
///
/// All anchors of a feature map cell share a slot. Slots are numbered consecutively across
/// layers, and one trailing entry refers to the background slot, which has the highest index.
/// The result thus has `anchor_count + 1` entries, is sorted ascending, and contains every slot
/// index from `0` to `slot_count` (inclusive) at least once.
///
/// The indices are used to broadcast per-slot latents (`z_what`, `z_depth`) to per-anchor
/// resolution.
pub fn reconstruction_indices(layers: &[LayerInfo]) -> Vec<u32> {
    let anchors = layers.iter().map(LayerInfo::anchor_count).sum::<usize>();
    let mut indices = Vec::with_capacity(anchors + 1);
    let mut slot = 0;
    for layer in layers {
        for _ in 0..layer.cell_count() {
            indices.extend(std::iter::repeat(slot).take(layer.boxes_per_cell));
            slot += 1;
        }
    }
    indices.push(slot);
    indices
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use approx::assert_abs_diff_eq;

    use super::*;

    fn layers(levels: &[(usize, usize)]) -> Vec<LayerInfo> {
        levels
            .iter()
            .map(|&(grid, boxes)| LayerInfo::new(grid, boxes, 30.0, 60.0))
            .collect()
    }

    #[test]
    fn indices_small() {
        let indices = reconstruction_indices(&layers(&[(2, 2), (1, 3)]));
        assert_eq!(indices, [0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 4, 5]);
    }

    #[test]
    fn indices_single_box() {
        let indices = reconstruction_indices(&layers(&[(2, 1)]));
        assert_eq!(indices, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn indices_properties() {
        let configs: &[&[(usize, usize)]] = &[
            &[(1, 1)],
            &[(3, 1), (2, 4)],
            &[(5, 6), (3, 4), (1, 4)],
            &[(38, 4), (19, 6), (10, 6), (5, 6), (3, 4), (1, 4)],
        ];
        for levels in configs {
            let layers = layers(levels);
            let indices = reconstruction_indices(&layers);

            let anchors = layers.iter().map(LayerInfo::anchor_count).sum::<usize>();
            let slots = layers.iter().map(LayerInfo::cell_count).sum::<usize>();
            assert_eq!(indices.len(), anchors + 1);

            let unique = indices.iter().collect::<HashSet<_>>();
            assert_eq!(unique.len(), slots + 1, "{levels:?}");
            assert!(indices.windows(2).all(|w| w[0] <= w[1]), "{levels:?}");
            assert_eq!(*indices.last().unwrap() as usize, slots);
        }
    }

    #[test]
    fn default_config_counts() {
        let config = SsdConfig::default();
        config.validate().unwrap();
        assert_eq!(config.anchor_count(), 8732);
        assert_eq!(config.slot_count(), 1940);
        assert_eq!(PriorBoxes::calculate(&config).anchor_count(), 8732);
    }

    #[test]
    fn invalid_config() {
        let mut config = SsdConfig::default();
        config.channels.pop();
        assert!(config.validate().is_err());

        config.layers.clear();
        config.channels.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn prior_layout() {
        let config = SsdConfig {
            image_size: 100,
            layers: vec![LayerInfo::new(2, 4, 20.0, 45.0)],
            channels: vec![8],
            center_variance: 0.1,
            size_variance: 0.2,
        };
        let priors = PriorBoxes::calculate(&config);
        assert_eq!(priors.anchor_count(), 16);

        // All boxes of a cell share its center.
        for b in 0..4 {
            let anchor = priors.anchor(b);
            assert_eq!((anchor.x_center(), anchor.y_center()), (0.25, 0.25));
        }
        // Second cell is to the right of the first.
        assert_eq!(priors.anchor(4).x_center(), 0.75);
        assert_eq!(priors.anchor(4).y_center(), 0.25);
        // Third cell starts the second row.
        assert_eq!(priors.anchor(8).x_center(), 0.25);
        assert_eq!(priors.anchor(8).y_center(), 0.75);

        let small = priors.anchor(0);
        assert_abs_diff_eq!(small.width(), 0.2);
        assert_abs_diff_eq!(small.height(), 0.2);
        let large = priors.anchor(1);
        assert_abs_diff_eq!(large.width(), 0.3, epsilon = 1e-6);
        let wide = priors.anchor(2);
        let tall = priors.anchor(3);
        assert!(wide.width() > wide.height());
        assert!(tall.width() < tall.height());
        assert_abs_diff_eq!(wide.width() * wide.height(), 0.04, epsilon = 1e-6);
    }

    #[test]
    fn prior_tensor() {
        let config = SsdConfig {
            image_size: 10,
            layers: vec![LayerInfo::new(1, 1, 5.0, 10.0)],
            channels: vec![1],
            center_variance: 0.1,
            size_variance: 0.2,
        };
        let priors = PriorBoxes::calculate(&config).to_tensor(&Device::Cpu).unwrap();
        assert_eq!(priors.dims(), &[1, 4]);
        assert_eq!(priors.to_vec2::<f32>().unwrap(), [[0.5, 0.5, 0.5, 0.5]]);
    }
}
