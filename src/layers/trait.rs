//! Layer trait definition for network layers
//!
//! This module defines the core Layer trait that every layer type implements. The
//! trait provides a common interface for forward propagation, first-order
//! backpropagation and second-order (diagonal curvature) backpropagation.

use crate::error::NetResult;
use crate::layers::state::{LayerState, StagedWeights};
use crate::tensor::WeightTensor;
use crate::utils::rng::SimpleRng;
use ndarray::Array3;
use std::io::{BufRead, Write};

/// Gradient (or curvature) of a layer's weights and biases, shaped like the
/// parameters themselves. Both tensors are empty for layers without parameters.
pub type Gradients = (WeightTensor, WeightTensor);

/// Core trait for network layers.
///
/// All layer types (Convolutional, FullyConnected, MaxPooling, Softmax) implement
/// this trait so the network can drive them through `Box<dyn Layer>`.
///
/// # Error buffer discipline
///
/// `backward` and `backward_2nd` receive the upstream error as `&mut Array3<f32>`.
/// The buffer is lent to exactly one layer for the duration of the call; the layer
/// may reshape it and scale it by its activation derivative in place. The error
/// for the previous layer is left in [`Layer::local_loss`].
///
/// # Example
///
/// ```ignore
/// let mut layer = FullyConnectedLayer::new(4, 3, Some(Activation::Tanh));
/// layer.init_weights(&mut SimpleRng::new(42));
/// layer.forward(&input)?;
/// let (grad_w, grad_b) = layer.backward(&mut error)?;
/// ```
pub trait Layer {
    /// Forward propagation through the layer.
    ///
    /// Stores a copy of `input`, computes the receptive field and the activated
    /// output.
    ///
    /// # Errors
    ///
    /// `NotInitialized` when weights were never initialized or loaded, and
    /// `ShapeMismatch` / `InvalidGeometry` when `input` does not fit the layer.
    fn forward(&mut self, input: &Array3<f32>) -> NetResult<()>;

    /// First-order backward pass.
    ///
    /// Returns the gradient of the loss with respect to weights and biases and
    /// writes the error for the previous layer into `local_loss`.
    fn backward(&mut self, upstream: &mut Array3<f32>) -> NetResult<Gradients>;

    /// Second-order backward pass (diagonal Gauss–Newton).
    ///
    /// Same structure as [`Layer::backward`] with activation derivatives, inputs
    /// and weights squared. Returns per-parameter curvature estimates.
    fn backward_2nd(&mut self, upstream: &mut Array3<f32>) -> NetResult<Gradients>;

    fn state(&self) -> &LayerState;

    fn state_mut(&mut self) -> &mut LayerState;

    /// Short human-readable layer kind, used in log and error messages.
    fn name(&self) -> &'static str;

    /// True for output layers whose loss gradient already includes their
    /// activation (softmax paired with the cost seed `hypothesis − label`).
    fn combines_loss(&self) -> bool {
        false
    }

    fn output(&self) -> Option<&Array3<f32>> {
        self.state().output()
    }

    fn receptive_field(&self) -> Option<&Array3<f32>> {
        self.state().receptive_field()
    }

    fn local_loss(&self) -> Option<&Array3<f32>> {
        self.state().local_loss()
    }

    fn weights(&self) -> &WeightTensor {
        &self.state().weights
    }

    fn weights_mut(&mut self) -> &mut WeightTensor {
        &mut self.state_mut().weights
    }

    fn bias_weights(&self) -> &WeightTensor {
        &self.state().bias_weights
    }

    fn bias_weights_mut(&mut self) -> &mut WeightTensor {
        &mut self.state_mut().bias_weights
    }

    fn init_weights(&mut self, rng: &mut SimpleRng) {
        self.state_mut().init_weights(rng);
    }

    fn is_initialized(&self) -> bool {
        self.state().is_initialized()
    }

    fn save_weights(&self, out: &mut dyn Write) -> NetResult<()> {
        self.state().save_weights(out)
    }

    /// Parse this layer's weight records without applying them.
    fn read_weights(&self, input: &mut dyn BufRead) -> NetResult<StagedWeights> {
        self.state().read_weights(input)
    }

    fn commit_weights(&mut self, staged: StagedWeights) {
        self.state_mut().commit_weights(staged);
    }

    /// Get the number of trainable parameters in the layer.
    fn parameter_count(&self) -> usize {
        self.state().weights.element_count() + self.state().bias_weights.element_count()
    }
}
