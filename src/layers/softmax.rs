//! Softmax output layer
//!
//! Structurally a fully connected layer whose activation is the stabilised softmax.
//! The backward passes do not differentiate the softmax: the cost function seeds
//! them with `hypothesis − label`, which already is the gradient of softmax
//! combined with the loss with respect to the receptive field.

use crate::error::NetResult;
use crate::layers::dense::{linear_backward, linear_forward, linear_state};
use crate::layers::r#trait::{Gradients, Layer};
use crate::layers::state::{LayerState, PassOrder};
use crate::utils::activations::Activation;
use ndarray::Array3;

const NAME: &str = "softmax";

/// Output layer producing class probabilities.
#[derive(Debug, Clone)]
pub struct SoftmaxLayer {
    inputs: usize,
    outputs: usize,
    state: LayerState,
}

impl SoftmaxLayer {
    /// Create an `inputs → classes` softmax output layer with zero weights.
    pub fn new(inputs: usize, classes: usize) -> NetResult<Self> {
        let state = linear_state(inputs, classes, Some(Activation::Softmax))?;
        Ok(Self {
            inputs,
            outputs: classes,
            state,
        })
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn classes(&self) -> usize {
        self.outputs
    }
}

impl Layer for SoftmaxLayer {
    fn forward(&mut self, input: &Array3<f32>) -> NetResult<()> {
        linear_forward(&mut self.state, input, self.inputs, self.outputs, NAME)
    }

    fn backward(&mut self, upstream: &mut Array3<f32>) -> NetResult<Gradients> {
        linear_backward(&mut self.state, upstream, PassOrder::First, false, NAME)
    }

    fn backward_2nd(&mut self, upstream: &mut Array3<f32>) -> NetResult<Gradients> {
        linear_backward(&mut self.state, upstream, PassOrder::Second, false, NAME)
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

    fn combines_loss(&self) -> bool {
        true
    }
}
