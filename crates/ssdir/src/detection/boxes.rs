//! Bounding box regression decoding.

use candle_core::{Result, Tensor, D};

/// Converts SSD regression outputs into `(center_x, center_y, width, height)` boxes.
///
/// `locations` is `[N, anchors, 4]`, `priors` is `[anchors, 4]`. The regression targets are
/// encoded relative to the priors:
///
/// ```text
/// center = offset_center * center_variance * prior_size + prior_center
/// size = prior_size * exp(offset_size * size_variance)
/// ```
pub fn convert_locations_to_boxes(
    locations: &Tensor,
    priors: &Tensor,
    center_variance: f32,
    size_variance: f32,
) -> Result<Tensor> {
    let prior_centers = priors.narrow(D::Minus1, 0, 2)?;
    let prior_sizes = priors.narrow(D::Minus1, 2, 2)?;

    let centers = locations
        .narrow(D::Minus1, 0, 2)?
        .affine(center_variance as f64, 0.0)?
        .broadcast_mul(&prior_sizes)?
        .broadcast_add(&prior_centers)?;
    let sizes = locations
        .narrow(D::Minus1, 2, 2)?
        .affine(size_variance as f64, 0.0)?
        .exp()?
        .broadcast_mul(&prior_sizes)?;

    Tensor::cat(&[centers, sizes], D::Minus1)
}

/// Turns rectangular boxes into squares by replacing both sides with the longer one.
pub fn convert_to_square(boxes: &Tensor) -> Result<Tensor> {
    let centers = boxes.narrow(D::Minus1, 0, 2)?;
    let sizes = boxes.narrow(D::Minus1, 2, 2)?;
    let side = sizes
        .max_keepdim(D::Minus1)?
        .broadcast_as(sizes.shape())?
        .contiguous()?;
    Tensor::cat(&[centers, side], D::Minus1)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    use super::*;

    #[test]
    fn zero_offsets_yield_priors() {
        let priors = Tensor::new(&[[0.5f32, 0.5, 0.2, 0.4], [0.1, 0.9, 1.0, 0.5]], &Device::Cpu)
            .unwrap();
        let locations = Tensor::zeros((3, 2, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let boxes = convert_locations_to_boxes(&locations, &priors, 0.1, 0.2).unwrap();
        assert_eq!(boxes.dims(), &[3, 2, 4]);
        for image in boxes.to_vec3::<f32>().unwrap() {
            assert_eq!(image, priors.to_vec2::<f32>().unwrap());
        }
    }

    #[test]
    fn offsets_are_scaled() {
        let priors = Tensor::new(&[[0.5f32, 0.5, 0.2, 0.4]], &Device::Cpu).unwrap();
        let locations = Tensor::new(&[[[1.0f32, -2.0, 5.0, 0.0]]], &Device::Cpu).unwrap();
        let boxes = convert_locations_to_boxes(&locations, &priors, 0.1, 0.2).unwrap();
        let b = boxes.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_abs_diff_eq!(b[0], 1.0 * 0.1 * 0.2 + 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(b[1], -2.0 * 0.1 * 0.4 + 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(b[2], 0.2 * 1.0f32.exp(), epsilon = 1e-6);
        assert_abs_diff_eq!(b[3], 0.4, epsilon = 1e-6);
    }

    #[test]
    fn square() {
        let boxes = Tensor::new(&[[[0.1f32, 0.2, 0.3, 0.4], [0.5, 0.6, 0.8, 0.7]]], &Device::Cpu)
            .unwrap();
        let square = convert_to_square(&boxes).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(square[0], [[0.1, 0.2, 0.4, 0.4], [0.5, 0.6, 0.8, 0.8]]);
    }
}
