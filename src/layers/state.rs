//! Per-layer state shared by every layer type
//!
//! A layer owns its parameters plus four signal buffers: the last forwarded input,
//! the receptive field (pre-activation), the output (post-activation) and the local
//! loss handed to the previous layer. Buffers are allocated on first use and only
//! reshaped when the required shape changes.

use crate::error::{NetError, NetResult};
use crate::tensor::{read_cube, write_cube, WeightTensor};
use crate::utils::activations::Activation;
use crate::utils::rng::SimpleRng;
use ndarray::Array3;
use std::io::{BufRead, Write};

/// Standard deviation of the Gaussian used by `init_weights`.
pub const INIT_STD: f32 = 0.1;

/// Lifecycle of a signal buffer relative to the shape a pass needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Never allocated.
    Uninitialized,
    /// Allocated for a different shape.
    Mismatched,
    /// Allocated with the requested shape.
    Ready,
}

/// Lazily allocated signal buffer.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: Option<Array3<f32>>,
}

impl Buffer {
    pub fn new() -> Self {
        Self { data: None }
    }

    pub fn state(&self, shape: (usize, usize, usize)) -> BufferState {
        match &self.data {
            None => BufferState::Uninitialized,
            Some(array) if array.dim() == shape => BufferState::Ready,
            Some(_) => BufferState::Mismatched,
        }
    }

    /// Make the buffer hold `shape`, reusing the allocation where possible.
    ///
    /// Contents are unspecified after a reshape; callers overwrite or fill them.
    pub fn ensure(&mut self, shape: (usize, usize, usize)) -> &mut Array3<f32> {
        match self.state(shape) {
            BufferState::Ready => {}
            BufferState::Mismatched => {
                let needed = shape.0 * shape.1 * shape.2;
                let reshaped = self
                    .data
                    .take()
                    .filter(|old| old.len() == needed && old.is_standard_layout())
                    .and_then(|old| old.into_shape(shape).ok());
                self.data = Some(reshaped.unwrap_or_else(|| Array3::zeros(shape)));
            }
            BufferState::Uninitialized => self.data = Some(Array3::zeros(shape)),
        }
        self.data.get_or_insert_with(|| Array3::zeros(shape))
    }

    /// Copy `src` into the buffer, resizing if needed.
    pub fn assign(&mut self, src: &Array3<f32>) {
        self.ensure(src.dim()).assign(src);
    }

    pub fn get(&self) -> Option<&Array3<f32>> {
        self.data.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut Array3<f32>> {
        self.data.as_mut()
    }
}

/// Which backward pass is running.
///
/// The second-order pass squares activation derivatives, inputs and weights, which
/// yields the diagonal Gauss–Newton approximation of the curvature rather than
/// the exact Hessian diagonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOrder {
    First,
    Second,
}

impl PassOrder {
    /// Identity for the first-order pass, square for the second-order pass.
    #[inline]
    pub fn apply(self, value: f32) -> f32 {
        match self {
            PassOrder::First => value,
            PassOrder::Second => value * value,
        }
    }
}

/// Weights staged by `read_weights` before they are committed to a layer.
#[derive(Debug, Clone)]
pub struct StagedWeights {
    pub weights: WeightTensor,
    pub bias_weights: WeightTensor,
}

/// Parameters and buffers common to every layer.
#[derive(Debug, Clone)]
pub struct LayerState {
    pub weights: WeightTensor,
    pub bias_weights: WeightTensor,
    pub input: Buffer,
    pub receptive_field: Buffer,
    pub output: Buffer,
    pub local_loss: Buffer,
    pub activation: Option<Activation>,
    initialized: bool,
    forwarded: bool,
}

impl LayerState {
    pub fn new(
        weights: WeightTensor,
        bias_weights: WeightTensor,
        activation: Option<Activation>,
    ) -> Self {
        // layers without parameters are usable right away
        let initialized = weights.is_empty();
        Self {
            weights,
            bias_weights,
            input: Buffer::new(),
            receptive_field: Buffer::new(),
            output: Buffer::new(),
            local_loss: Buffer::new(),
            activation,
            initialized,
            forwarded: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn has_forwarded(&self) -> bool {
        self.forwarded
    }

    pub fn mark_forwarded(&mut self) {
        self.forwarded = true;
    }

    pub fn require_initialized(&self, layer: &str) -> NetResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(NetError::NotInitialized(layer.to_string()))
        }
    }

    pub fn require_forwarded(&self, layer: &str) -> NetResult<()> {
        if self.forwarded {
            Ok(())
        } else {
            Err(NetError::NoForwardPass(layer.to_string()))
        }
    }

    /// Draw every weight and bias from `N(0, INIT_STD²)`.
    pub fn init_weights(&mut self, rng: &mut SimpleRng) {
        self.weights.fill_gaussian(rng, INIT_STD);
        self.bias_weights.fill_gaussian(rng, INIT_STD);
        self.initialized = true;
    }

    /// Post-activation signal; the receptive field itself when no activation is set.
    pub fn output(&self) -> Option<&Array3<f32>> {
        match self.activation {
            Some(_) => self.output.get(),
            None => self.receptive_field.get(),
        }
    }

    pub fn receptive_field(&self) -> Option<&Array3<f32>> {
        self.receptive_field.get()
    }

    pub fn local_loss(&self) -> Option<&Array3<f32>> {
        self.local_loss.get()
    }

    pub fn input(&self) -> Option<&Array3<f32>> {
        self.input.get()
    }

    /// Recompute `output = f(receptive_field)` for the attached activation.
    pub fn apply_activation(&mut self) -> NetResult<()> {
        let Some(activation) = self.activation else {
            return Ok(());
        };
        let field = self
            .receptive_field
            .get()
            .ok_or_else(|| NetError::NoForwardPass("receptive field not computed".into()))?;
        let output = self.output.ensure(field.dim());
        activation.compute(field, output)
    }

    /// Multiply `error` in place by the (squared) activation derivative at the
    /// stored pre-activation values. No-op without an activation.
    pub fn scale_by_derivative(&self, error: &mut Array3<f32>, order: PassOrder) -> NetResult<()> {
        let Some(activation) = self.activation else {
            return Ok(());
        };
        let field = self
            .receptive_field
            .get()
            .ok_or_else(|| NetError::NoForwardPass("receptive field not computed".into()))?;
        if field.dim() != error.dim() {
            return Err(NetError::ShapeMismatch(format!(
                "error {:?} does not match receptive field {:?}",
                error.dim(),
                field.dim()
            )));
        }
        error.zip_mut_with(field, |e, &v| *e *= order.apply(activation.derivative(v)));
        Ok(())
    }

    /// Write weight and bias cubes, interleaved per entry. Writes nothing for
    /// parameterless layers.
    pub fn save_weights(&self, out: &mut dyn Write) -> NetResult<()> {
        for (weight, bias) in self.weights.iter().zip(self.bias_weights.iter()) {
            write_cube(out, weight)?;
            write_cube(out, bias)?;
        }
        Ok(())
    }

    /// Parse this layer's records without touching the current weights.
    pub fn read_weights(&self, input: &mut dyn BufRead) -> NetResult<StagedWeights> {
        let mut weights = self.weights.clone();
        let mut bias_weights = self.bias_weights.clone();
        let weight_shape = self.weights.entry_shape();
        let bias_shape = self.bias_weights.entry_shape();
        for n in 0..self.weights.count() {
            weights
                .set(n, read_cube(input, weight_shape)?)
                .map_err(|e| NetError::CorruptWeights(format!("weight entry {n}: {e}")))?;
            bias_weights
                .set(n, read_cube(input, bias_shape)?)
                .map_err(|e| NetError::CorruptWeights(format!("bias entry {n}: {e}")))?;
        }
        Ok(StagedWeights {
            weights,
            bias_weights,
        })
    }

    /// Install weights produced by `read_weights` and mark the layer ready.
    pub fn commit_weights(&mut self, staged: StagedWeights) {
        self.weights = staged.weights;
        self.bias_weights = staged.bias_weights;
        self.initialized = true;
    }
}
