//! 2D convolutional layer implementation
//!
//! This module provides a ConvolutionalLayer that cross-correlates a
//! `height × width × depth` signal with a bank of `kh × kw × depth` filters.
//! Forward and backward passes are expressed as single matrix products over
//! im2col unrolled patches.

use crate::error::{NetError, NetResult};
use crate::layers::r#trait::{Gradients, Layer};
use crate::layers::state::{LayerState, PassOrder};
use crate::tensor::{im2col, kernel2col, unvectorise, WeightTensor};
use crate::utils::activations::Activation;
use ndarray::{s, Array2, Array3, Axis};

const NAME: &str = "convolutional";

/// Spatial extent of a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSize {
    pub height: usize,
    pub width: usize,
}

impl KernelSize {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn square(size: usize) -> Self {
        Self::new(size, size)
    }
}

/// Zero padding added symmetrically on each border.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Padding {
    pub height: usize,
    pub width: usize,
}

impl Padding {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }
}

/// 2D convolutional layer with learnable filters.
///
/// # Fields
///
/// * `kernel` - Spatial extent of every filter
/// * `filters` - Number of filters, i.e. the output depth
/// * `depth` - Expected input depth
/// * `stride` - Step of the sliding window
/// * `padding` - Zero padding applied to the input before the correlation
/// * `state` - Weights `WeightTensor(kh, kw, depth, filters)` and biases
///   `WeightTensor(1, 1, depth, filters)`; the bias of filter `k` is the sum of
///   its `depth` entries
///
/// # Example
///
/// ```ignore
/// use rust_convnet::layers::{ConvolutionalLayer, KernelSize, Padding};
/// use rust_convnet::utils::Activation;
///
/// // 1 input channel, 8 filters, 5x5 kernel, stride 1, no padding
/// let layer = ConvolutionalLayer::new(
///     KernelSize::square(5), 8, 1, 1, Padding::default(), Some(Activation::Relu))?;
/// assert_eq!(layer.output_shape((28, 28, 1))?, (24, 24, 8));
/// ```
#[derive(Debug, Clone)]
pub struct ConvolutionalLayer {
    kernel: KernelSize,
    filters: usize,
    depth: usize,
    stride: usize,
    padding: Padding,
    state: LayerState,
}

impl ConvolutionalLayer {
    /// Create a new ConvolutionalLayer with zero weights.
    ///
    /// # Arguments
    ///
    /// * `kernel` - Filter height and width
    /// * `filters` - Number of filters (output depth)
    /// * `depth` - Input depth
    /// * `stride` - Sliding window step
    /// * `padding` - Symmetric zero padding
    /// * `activation` - Optional activation applied to the receptive field
    ///
    /// # Errors
    ///
    /// `InvalidGeometry` when any size or the stride is zero.
    pub fn new(
        kernel: KernelSize,
        filters: usize,
        depth: usize,
        stride: usize,
        padding: Padding,
        activation: Option<Activation>,
    ) -> NetResult<Self> {
        if kernel.height == 0 || kernel.width == 0 || filters == 0 || depth == 0 || stride == 0 {
            return Err(NetError::InvalidGeometry(format!(
                "convolution needs positive sizes: kernel {}x{}, {} filters, depth {}, stride {}",
                kernel.height, kernel.width, filters, depth, stride
            )));
        }
        let state = LayerState::new(
            WeightTensor::new(kernel.height, kernel.width, depth, filters),
            WeightTensor::new(1, 1, depth, filters),
            activation,
        );
        Ok(Self {
            kernel,
            filters,
            depth,
            stride,
            padding,
            state,
        })
    }

    pub fn kernel(&self) -> KernelSize {
        self.kernel
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    /// Output shape for an input of shape `(height, width, depth)`.
    ///
    /// Calculated as `((H − kh + 2ph) / s + 1, (W − kw + 2pw) / s + 1, filters)`.
    /// The stride must divide the padded extent exactly.
    pub fn output_shape(&self, input: (usize, usize, usize)) -> NetResult<(usize, usize, usize)> {
        let (height, width, depth) = input;
        if depth != self.depth {
            return Err(NetError::ShapeMismatch(format!(
                "convolution expects depth {}, got {}",
                self.depth, depth
            )));
        }
        let out_height = sliding_extent(
            height + 2 * self.padding.height,
            self.kernel.height,
            self.stride,
        )?;
        let out_width = sliding_extent(
            width + 2 * self.padding.width,
            self.kernel.width,
            self.stride,
        )?;
        Ok((out_height, out_width, self.filters))
    }

    fn pass(&mut self, upstream: &mut Array3<f32>, order: PassOrder) -> NetResult<Gradients> {
        self.state.require_forwarded(NAME)?;
        let (out_height, out_width, filters) = self
            .state
            .receptive_field()
            .ok_or_else(|| NetError::NoForwardPass(NAME.to_string()))?
            .dim();
        if upstream.dim() != (out_height, out_width, filters) {
            *upstream = unvectorise(upstream, out_height, out_width, filters)?;
        }
        self.state.scale_by_derivative(upstream, order)?;

        let (kh, kw) = (self.kernel.height, self.kernel.width);
        let patch = kh * kw;
        let stride = self.stride;
        let padded = self
            .state
            .input()
            .ok_or_else(|| NetError::NoForwardPass(NAME.to_string()))?;
        let (padded_height, padded_width, depth) = padded.dim();

        let mut delta = Array2::zeros((filters, out_height * out_width));
        for k in 0..filters {
            for col in 0..out_width {
                for row in 0..out_height {
                    delta[[k, col * out_height + row]] = upstream[[row, col, k]];
                }
            }
        }

        // dL/dW: error matrix times the transposed input patches
        let patches = match order {
            PassOrder::First => im2col(padded, kh, kw, stride, out_height, out_width)?,
            PassOrder::Second => im2col(
                &padded.mapv(|v| v * v),
                kh,
                kw,
                stride,
                out_height,
                out_width,
            )?,
        };
        let weight_matrix = delta.dot(&patches.t());
        let mut grad_weights = WeightTensor::new(kh, kw, depth, filters);
        for (k, cube) in grad_weights.iter_mut().enumerate() {
            for c in 0..depth {
                for kc in 0..kw {
                    for kr in 0..kh {
                        cube[[kr, kc, c]] = weight_matrix[[k, c * patch + kc * kh + kr]];
                    }
                }
            }
        }

        let mut grad_bias = WeightTensor::new(1, 1, depth, filters);
        for (k, cube) in grad_bias.iter_mut().enumerate() {
            cube.fill(upstream.index_axis(Axis(2), k).sum());
        }

        // dL/dx: full convolution of the stride-dilated error with flipped kernels
        let dilated_height = (out_height - 1) * stride + 1;
        let dilated_width = (out_width - 1) * stride + 1;
        let mut spread = Array3::zeros((
            dilated_height + 2 * (kh - 1),
            dilated_width + 2 * (kw - 1),
            filters,
        ));
        for k in 0..filters {
            for col in 0..out_width {
                for row in 0..out_height {
                    spread[[kh - 1 + row * stride, kw - 1 + col * stride, k]] =
                        upstream[[row, col, k]];
                }
            }
        }
        let mut flipped = WeightTensor::new(kh, kw, filters, depth);
        for (c, cube) in flipped.iter_mut().enumerate() {
            for k in 0..filters {
                let kernel = self.state.weights.get(k);
                for kc in 0..kw {
                    for kr in 0..kh {
                        cube[[kr, kc, k]] = order.apply(kernel[[kh - 1 - kr, kw - 1 - kc, c]]);
                    }
                }
            }
        }
        let convolution = kernel2col(&flipped).dot(&im2col(
            &spread,
            kh,
            kw,
            1,
            padded_height,
            padded_width,
        )?);

        let (pad_h, pad_w) = (self.padding.height, self.padding.width);
        let height = padded_height - 2 * pad_h;
        let width = padded_width - 2 * pad_w;
        let local_loss = self.state.local_loss.ensure((height, width, depth));
        for d in 0..depth {
            for c in 0..width {
                for r in 0..height {
                    local_loss[[r, c, d]] = convolution[[d, (c + pad_w) * padded_height + r + pad_h]];
                }
            }
        }

        Ok((grad_weights, grad_bias))
    }
}

fn sliding_extent(padded: usize, kernel: usize, stride: usize) -> NetResult<usize> {
    if padded < kernel || (padded - kernel) % stride != 0 {
        return Err(NetError::InvalidGeometry(format!(
            "kernel {} with stride {} does not tile a padded extent of {}",
            kernel, stride, padded
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

impl Layer for ConvolutionalLayer {
    fn forward(&mut self, input: &Array3<f32>) -> NetResult<()> {
        self.state.require_initialized(NAME)?;
        let (out_height, out_width, filters) = self.output_shape(input.dim())?;
        let (height, width, depth) = input.dim();
        let (pad_h, pad_w) = (self.padding.height, self.padding.width);

        let padded = self
            .state
            .input
            .ensure((height + 2 * pad_h, width + 2 * pad_w, depth));
        padded.fill(0.0);
        padded
            .slice_mut(s![pad_h..pad_h + height, pad_w..pad_w + width, ..])
            .assign(input);

        let patches = im2col(
            padded,
            self.kernel.height,
            self.kernel.width,
            self.stride,
            out_height,
            out_width,
        )?;
        let correlation = kernel2col(&self.state.weights).dot(&patches);

        let field = self
            .state
            .receptive_field
            .ensure((out_height, out_width, filters));
        for (k, bias) in self.state.bias_weights.iter().enumerate() {
            let bias = bias.sum();
            for col in 0..out_width {
                for row in 0..out_height {
                    field[[row, col, k]] = correlation[[k, col * out_height + row]] + bias;
                }
            }
        }

        self.state.apply_activation()?;
        self.state.mark_forwarded();
        Ok(())
    }

    fn backward(&mut self, upstream: &mut Array3<f32>) -> NetResult<Gradients> {
        self.pass(upstream, PassOrder::First)
    }

    fn backward_2nd(&mut self, upstream: &mut Array3<f32>) -> NetResult<Gradients> {
        self.pass(upstream, PassOrder::Second)
    }

    fn state(&self) -> &LayerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut LayerState {
        &mut self.state
    }

    fn name(&self) -> &'static str {
        NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::rng::SimpleRng;
    use approx::assert_relative_eq;
    use ndarray::Array;

    fn layer(
        kernel: usize,
        filters: usize,
        depth: usize,
        stride: usize,
        padding: usize,
        activation: Option<Activation>,
    ) -> ConvolutionalLayer {
        let mut layer = ConvolutionalLayer::new(
            KernelSize::square(kernel),
            filters,
            depth,
            stride,
            Padding::new(padding, padding),
            activation,
        )
        .unwrap();
        layer.init_weights(&mut SimpleRng::new(31));
        layer
    }

    fn ramp(shape: (usize, usize, usize)) -> Array3<f32> {
        Array::from_shape_fn(shape, |(r, c, d)| {
            ((r * 7 + c * 3 + d * 5) % 11) as f32 / 11.0 - 0.5
        })
    }

    fn half_square_sum(layer: &ConvolutionalLayer) -> f32 {
        0.5 * layer.output().unwrap().iter().map(|v| v * v).sum::<f32>()
    }

    #[test]
    fn test_output_shape_law() {
        let conv = layer(3, 4, 2, 2, 1, None);
        assert_eq!(conv.output_shape((7, 7, 2)).unwrap(), (4, 4, 4));
        let conv = layer(5, 6, 1, 1, 0, None);
        assert_eq!(conv.output_shape((28, 28, 1)).unwrap(), (24, 24, 6));
    }

    #[test]
    fn test_rejects_non_divisible_geometry() {
        let mut conv = layer(3, 2, 1, 2, 0, None);
        assert!(matches!(
            conv.forward(&Array3::zeros((6, 6, 1))),
            Err(NetError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_rejects_depth_mismatch() {
        let mut conv = layer(3, 2, 3, 1, 0, None);
        assert!(matches!(
            conv.forward(&Array3::zeros((5, 5, 2))),
            Err(NetError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_forward_matches_direct_correlation() {
        let mut conv = layer(2, 2, 2, 1, 1, Some(Activation::Tanh));
        let input = ramp((3, 4, 2));
        conv.forward(&input).unwrap();
        let output = conv.output().unwrap();
        assert_eq!(output.dim(), (4, 5, 2));

        let mut padded = Array3::zeros((5, 6, 2));
        padded.slice_mut(s![1..4, 1..5, ..]).assign(&input);
        for k in 0..2 {
            let bias: f32 = conv.bias_weights().get(k).sum();
            for row in 0..4 {
                for col in 0..5 {
                    let mut sum = bias;
                    for c in 0..2 {
                        for kr in 0..2 {
                            for kc in 0..2 {
                                sum += conv.weights().get(k)[[kr, kc, c]]
                                    * padded[[row + kr, col + kc, c]];
                            }
                        }
                    }
                    assert_relative_eq!(output[[row, col, k]], sum.tanh(), epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut conv = layer(3, 2, 2, 2, 1, Some(Activation::Tanh));
        let input = ramp((5, 5, 2));

        conv.forward(&input).unwrap();
        let mut error = conv.output().unwrap().clone();
        let (grad_w, grad_b) = conv.backward(&mut error).unwrap();
        let propagated = conv.local_loss().unwrap().clone();
        assert_eq!(propagated.dim(), input.dim());

        let eps = 1e-3f32;
        for k in 0..2 {
            for c in 0..2 {
                for kr in 0..3 {
                    for kc in 0..3 {
                        let original = conv.weights().get(k)[[kr, kc, c]];
                        conv.weights_mut().get_mut(k)[[kr, kc, c]] = original + eps;
                        conv.forward(&input).unwrap();
                        let plus = half_square_sum(&conv);
                        conv.weights_mut().get_mut(k)[[kr, kc, c]] = original - eps;
                        conv.forward(&input).unwrap();
                        let minus = half_square_sum(&conv);
                        conv.weights_mut().get_mut(k)[[kr, kc, c]] = original;
                        assert_relative_eq!(
                            grad_w.get(k)[[kr, kc, c]],
                            (plus - minus) / (2.0 * eps),
                            epsilon = 2e-3
                        );
                    }
                }
            }

            let original = conv.bias_weights().get(k)[[0, 0, 1]];
            conv.bias_weights_mut().get_mut(k)[[0, 0, 1]] = original + eps;
            conv.forward(&input).unwrap();
            let plus = half_square_sum(&conv);
            conv.bias_weights_mut().get_mut(k)[[0, 0, 1]] = original - eps;
            conv.forward(&input).unwrap();
            let minus = half_square_sum(&conv);
            conv.bias_weights_mut().get_mut(k)[[0, 0, 1]] = original;
            assert_relative_eq!(
                grad_b.get(k)[[0, 0, 1]],
                (plus - minus) / (2.0 * eps),
                epsilon = 2e-3
            );
            assert_eq!(grad_b.get(k)[[0, 0, 0]], grad_b.get(k)[[0, 0, 1]]);
        }

        for d in 0..2 {
            for c in 0..5 {
                for r in 0..5 {
                    let mut shifted = input.clone();
                    shifted[[r, c, d]] += eps;
                    conv.forward(&shifted).unwrap();
                    let plus = half_square_sum(&conv);
                    shifted[[r, c, d]] -= 2.0 * eps;
                    conv.forward(&shifted).unwrap();
                    let minus = half_square_sum(&conv);
                    assert_relative_eq!(
                        propagated[[r, c, d]],
                        (plus - minus) / (2.0 * eps),
                        epsilon = 2e-3
                    );
                }
            }
        }
    }

    #[test]
    fn test_backward_accepts_vector_shaped_error() {
        let mut conv = layer(2, 3, 1, 2, 0, Some(Activation::Relu));
        conv.forward(&ramp((4, 4, 1))).unwrap();
        let mut error = Array3::from_elem((2 * 2 * 3, 1, 1), 0.1);
        conv.backward(&mut error).unwrap();
        assert_eq!(error.dim(), (2, 2, 3));
        assert_eq!(conv.local_loss().unwrap().dim(), (4, 4, 1));
    }

    #[test]
    fn test_second_order_squares_input_and_kernel() {
        let mut conv = layer(1, 1, 1, 1, 0, None);
        conv.weights_mut().get_mut(0)[[0, 0, 0]] = 3.0;
        let input = Array::from_shape_vec((2, 2, 1), vec![1.0, -2.0, 0.5, 2.0]).unwrap();
        conv.forward(&input).unwrap();

        let mut curvature = Array3::from_elem((2, 2, 1), 1.0);
        let (grad_w, grad_b) = conv.backward_2nd(&mut curvature).unwrap();
        assert_relative_eq!(grad_w.get(0)[[0, 0, 0]], 1.0 + 4.0 + 0.25 + 4.0);
        assert_relative_eq!(grad_b.get(0)[[0, 0, 0]], 4.0);
        for value in conv.local_loss().unwrap().iter() {
            assert_relative_eq!(*value, 9.0);
        }
    }
}
