//! Fully connected layer implementation
//!
//! This module provides a FullyConnectedLayer that performs the transformation
//! `v = Wᵀx + b`, `y = f(v)` on a column-vector signal. Inputs that are not
//! vector shaped (the output of a convolution or pooling layer) are flattened
//! column-major per slice, slice after slice.
//!
//! The linear forward and backward helpers are shared with the softmax output
//! layer, which has the same structure.

use crate::error::{NetError, NetResult};
use crate::layers::r#trait::{Gradients, Layer};
use crate::layers::state::{LayerState, PassOrder};
use crate::tensor::{is_vector_shaped, vectorise, WeightTensor};
use crate::utils::activations::Activation;
use ndarray::{s, Array2, Array3, Axis};

const NAME: &str = "fully connected";

/// Fully connected layer with weights and biases.
///
/// # Fields
///
/// * `inputs` - Number of input features
/// * `outputs` - Number of output units
/// * `state` - Weights `WeightTensor(inputs, outputs, 1, 1)`, i.e. a single
///   `inputs × outputs` matrix, and biases `WeightTensor(outputs, 1, 1, 1)`
///
/// # Example
///
/// ```ignore
/// use rust_convnet::layers::FullyConnectedLayer;
/// use rust_convnet::utils::{Activation, SimpleRng};
///
/// let mut layer = FullyConnectedLayer::new(784, 100, Some(Activation::Tanh))?;
/// layer.init_weights(&mut SimpleRng::new(42));
/// assert_eq!(layer.parameter_count(), 784 * 100 + 100);
/// ```
#[derive(Debug, Clone)]
pub struct FullyConnectedLayer {
    inputs: usize,
    outputs: usize,
    state: LayerState,
}

impl FullyConnectedLayer {
    /// Create a new FullyConnectedLayer with zero weights.
    ///
    /// The layer must be initialized with `init_weights` or loaded before the
    /// first forward pass.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Number of input features
    /// * `outputs` - Number of output units
    /// * `activation` - Optional activation applied to the receptive field
    pub fn new(inputs: usize, outputs: usize, activation: Option<Activation>) -> NetResult<Self> {
        let state = linear_state(inputs, outputs, activation)?;
        Ok(Self {
            inputs,
            outputs,
            state,
        })
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    fn pass(&mut self, upstream: &mut Array3<f32>, order: PassOrder) -> NetResult<Gradients> {
        linear_backward(&mut self.state, upstream, order, true, NAME)
    }
}

impl Layer for FullyConnectedLayer {
    fn forward(&mut self, input: &Array3<f32>) -> NetResult<()> {
        linear_forward(&mut self.state, input, self.inputs, self.outputs, NAME)
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

pub(crate) fn linear_state(
    inputs: usize,
    outputs: usize,
    activation: Option<Activation>,
) -> NetResult<LayerState> {
    if inputs == 0 || outputs == 0 {
        return Err(NetError::InvalidGeometry(format!(
            "linear layer needs positive sizes, got {} -> {}",
            inputs, outputs
        )));
    }
    Ok(LayerState::new(
        WeightTensor::new(inputs, outputs, 1, 1),
        WeightTensor::new(outputs, 1, 1, 1),
        activation,
    ))
}

/// `receptive_field = Wᵀx + b`, then the activation.
pub(crate) fn linear_forward(
    state: &mut LayerState,
    input: &Array3<f32>,
    inputs: usize,
    outputs: usize,
    layer: &str,
) -> NetResult<()> {
    state.require_initialized(layer)?;
    if input.len() != inputs {
        return Err(NetError::ShapeMismatch(format!(
            "{} layer expects {} inputs, got {:?}",
            layer,
            inputs,
            input.dim()
        )));
    }
    if is_vector_shaped(input) {
        state.input.assign(input);
    } else {
        state.input.assign(&vectorise(input));
    }

    let x = state
        .input
        .get()
        .ok_or(NetError::MissingInput)?
        .slice(s![.., 0, 0]);
    let weights = state.weights.get(0).index_axis(Axis(2), 0);
    let bias = state.bias_weights.get(0).slice(s![.., 0, 0]);
    let field = weights.t().dot(&x) + &bias;

    state
        .receptive_field
        .ensure((outputs, 1, 1))
        .slice_mut(s![.., 0, 0])
        .assign(&field);
    state.apply_activation()?;
    state.mark_forwarded();
    Ok(())
}

/// Shared backward pass of the linear layers.
///
/// `scale_by_activation` is false for output layers whose upstream error already
/// is the gradient with respect to the receptive field.
pub(crate) fn linear_backward(
    state: &mut LayerState,
    upstream: &mut Array3<f32>,
    order: PassOrder,
    scale_by_activation: bool,
    layer: &str,
) -> NetResult<Gradients> {
    state.require_forwarded(layer)?;
    let (inputs, outputs, _) = state.weights.entry_shape();
    if upstream.len() != outputs {
        return Err(NetError::ShapeMismatch(format!(
            "{} layer with {} outputs got an error of shape {:?}",
            layer,
            outputs,
            upstream.dim()
        )));
    }
    if !is_vector_shaped(upstream) {
        *upstream = vectorise(upstream);
    }
    if scale_by_activation {
        state.scale_by_derivative(upstream, order)?;
    }

    let delta = upstream.slice(s![.., 0, 0]);
    let x = state
        .input
        .get()
        .ok_or_else(|| NetError::NoForwardPass(layer.to_string()))?
        .slice(s![.., 0, 0])
        .mapv(|v| order.apply(v));
    let weights = state
        .weights
        .get(0)
        .index_axis(Axis(2), 0)
        .mapv(|w| order.apply(w));

    let propagated = weights.dot(&delta);
    state
        .local_loss
        .ensure((inputs, 1, 1))
        .slice_mut(s![.., 0, 0])
        .assign(&propagated);

    let mut grad_weights = WeightTensor::new(inputs, outputs, 1, 1);
    let outer = Array2::from_shape_fn((inputs, outputs), |(i, j)| x[i] * delta[j]);
    grad_weights
        .get_mut(0)
        .index_axis_mut(Axis(2), 0)
        .assign(&outer);

    let mut grad_bias = WeightTensor::new(outputs, 1, 1, 1);
    grad_bias.get_mut(0).slice_mut(s![.., 0, 0]).assign(&delta);

    Ok((grad_weights, grad_bias))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::rng::SimpleRng;
    use approx::assert_relative_eq;
    use ndarray::Array;

    fn column(values: &[f32]) -> Array3<f32> {
        Array::from_shape_vec((values.len(), 1, 1), values.to_vec()).unwrap()
    }

    fn half_square_sum(layer: &FullyConnectedLayer) -> f32 {
        0.5 * layer.output().unwrap().iter().map(|v| v * v).sum::<f32>()
    }

    #[test]
    fn test_forward_is_transposed_product_plus_bias() {
        let mut layer = FullyConnectedLayer::new(2, 2, None).unwrap();
        layer.init_weights(&mut SimpleRng::new(0));
        {
            let w = layer.weights_mut().get_mut(0);
            w[[0, 0, 0]] = 1.0;
            w[[0, 1, 0]] = 2.0;
            w[[1, 0, 0]] = 3.0;
            w[[1, 1, 0]] = 4.0;
        }
        layer.bias_weights_mut().get_mut(0)[[0, 0, 0]] = 0.0;
        layer.bias_weights_mut().get_mut(0)[[1, 0, 0]] = 0.5;
        layer.forward(&column(&[1.0, -1.0])).unwrap();
        let out = layer.output().unwrap();
        assert_relative_eq!(out[[0, 0, 0]], 1.0 - 3.0);
        assert_relative_eq!(out[[1, 0, 0]], 2.0 - 4.0 + 0.5);
    }

    #[test]
    fn test_forward_requires_initialization() {
        let mut layer = FullyConnectedLayer::new(3, 2, None).unwrap();
        assert!(matches!(
            layer.forward(&column(&[1.0, 2.0, 3.0])),
            Err(NetError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_backward_requires_forward() {
        let mut layer = FullyConnectedLayer::new(3, 2, None).unwrap();
        layer.init_weights(&mut SimpleRng::new(1));
        let mut error = column(&[1.0, 1.0]);
        assert!(matches!(
            layer.backward(&mut error),
            Err(NetError::NoForwardPass(_))
        ));
    }

    #[test]
    fn test_flattens_cube_input() {
        let mut layer = FullyConnectedLayer::new(8, 3, Some(Activation::Relu)).unwrap();
        layer.init_weights(&mut SimpleRng::new(5));
        let cube = Array::from_shape_fn((2, 2, 2), |(r, c, s)| (r + c + s) as f32);
        layer.forward(&cube).unwrap();
        assert_eq!(layer.output().unwrap().dim(), (3, 1, 1));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut layer = FullyConnectedLayer::new(3, 2, Some(Activation::Tanh)).unwrap();
        layer.init_weights(&mut SimpleRng::new(9));
        let input = column(&[0.4, -0.7, 0.2]);

        layer.forward(&input).unwrap();
        let mut error = layer.output().unwrap().clone();
        let (grad_w, grad_b) = layer.backward(&mut error).unwrap();
        let propagated = layer.local_loss().unwrap().clone();

        let eps = 1e-3f32;
        for i in 0..3 {
            for j in 0..2 {
                let original = layer.weights().get(0)[[i, j, 0]];
                layer.weights_mut().get_mut(0)[[i, j, 0]] = original + eps;
                layer.forward(&input).unwrap();
                let plus = half_square_sum(&layer);
                layer.weights_mut().get_mut(0)[[i, j, 0]] = original - eps;
                layer.forward(&input).unwrap();
                let minus = half_square_sum(&layer);
                layer.weights_mut().get_mut(0)[[i, j, 0]] = original;

                let numeric = (plus - minus) / (2.0 * eps);
                assert_relative_eq!(grad_w.get(0)[[i, j, 0]], numeric, epsilon = 1e-3);
            }
        }

        for j in 0..2 {
            let original = layer.bias_weights().get(0)[[j, 0, 0]];
            layer.bias_weights_mut().get_mut(0)[[j, 0, 0]] = original + eps;
            layer.forward(&input).unwrap();
            let plus = half_square_sum(&layer);
            layer.bias_weights_mut().get_mut(0)[[j, 0, 0]] = original - eps;
            layer.forward(&input).unwrap();
            let minus = half_square_sum(&layer);
            layer.bias_weights_mut().get_mut(0)[[j, 0, 0]] = original;
            assert_relative_eq!(
                grad_b.get(0)[[j, 0, 0]],
                (plus - minus) / (2.0 * eps),
                epsilon = 1e-3
            );
        }

        for i in 0..3 {
            let mut shifted = input.clone();
            shifted[[i, 0, 0]] += eps;
            layer.forward(&shifted).unwrap();
            let plus = half_square_sum(&layer);
            shifted[[i, 0, 0]] -= 2.0 * eps;
            layer.forward(&shifted).unwrap();
            let minus = half_square_sum(&layer);
            assert_relative_eq!(
                propagated[[i, 0, 0]],
                (plus - minus) / (2.0 * eps),
                epsilon = 1e-3
            );
        }
    }

    #[test]
    fn test_weight_gradient_is_outer_product_of_input_and_error() {
        let mut layer = FullyConnectedLayer::new(3, 2, None).unwrap();
        layer.init_weights(&mut SimpleRng::new(4));
        let x = [0.5, -1.0, 2.0];
        layer.forward(&column(&x)).unwrap();

        let delta = [1.0, -2.0];
        let mut error = column(&delta);
        let (grad_w, _) = layer.backward(&mut error).unwrap();
        assert_eq!(grad_w.entry_shape(), (3, 2, 1));
        for i in 0..3 {
            for j in 0..2 {
                assert_relative_eq!(grad_w.get(0)[[i, j, 0]], x[i] * delta[j]);
            }
        }
    }

    #[test]
    fn test_second_order_squares_inputs_and_weights() {
        let mut layer = FullyConnectedLayer::new(2, 1, None).unwrap();
        layer.init_weights(&mut SimpleRng::new(2));
        layer.weights_mut().get_mut(0)[[0, 0, 0]] = -2.0;
        layer.weights_mut().get_mut(0)[[1, 0, 0]] = 3.0;
        layer.forward(&column(&[-1.5, 0.5])).unwrap();

        let mut curvature = column(&[2.0]);
        let (grad_w, grad_b) = layer.backward_2nd(&mut curvature).unwrap();
        assert_relative_eq!(grad_w.get(0)[[0, 0, 0]], 2.25 * 2.0);
        assert_relative_eq!(grad_w.get(0)[[1, 0, 0]], 0.25 * 2.0);
        assert_relative_eq!(grad_b.get(0)[[0, 0, 0]], 2.0);
        let propagated = layer.local_loss().unwrap();
        assert_relative_eq!(propagated[[0, 0, 0]], 4.0 * 2.0);
        assert_relative_eq!(propagated[[1, 0, 0]], 9.0 * 2.0);
    }
}
