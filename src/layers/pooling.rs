//! Max-pooling layer
//!
//! Downsamples every slice independently by taking the maximum of each window.
//! The forward pass records the winning input position of each window, and
//! errors are routed back only through those positions.

use crate::error::{NetError, NetResult};
use crate::layers::conv2d::KernelSize;
use crate::layers::r#trait::{Gradients, Layer};
use crate::layers::state::{LayerState, PassOrder};
use crate::tensor::{unvectorise, WeightTensor};
use crate::utils::activations::Activation;
use ndarray::Array3;

const NAME: &str = "max pooling";

/// Max-pooling layer without trainable parameters.
#[derive(Debug, Clone)]
pub struct MaxPoolingLayer {
    kernel: KernelSize,
    stride: usize,
    connections: Array3<bool>,
    winners: Array3<(usize, usize)>,
    state: LayerState,
}

impl MaxPoolingLayer {
    pub fn new(kernel: KernelSize, stride: usize, activation: Option<Activation>) -> NetResult<Self> {
        if kernel.height == 0 || kernel.width == 0 || stride == 0 {
            return Err(NetError::InvalidGeometry(format!(
                "pooling needs positive sizes: kernel {}x{}, stride {}",
                kernel.height, kernel.width, stride
            )));
        }
        Ok(Self {
            kernel,
            stride,
            connections: Array3::from_elem((0, 0, 0), false),
            winners: Array3::from_elem((0, 0, 0), (0, 0)),
            state: LayerState::new(WeightTensor::empty(), WeightTensor::empty(), activation),
        })
    }

    pub fn kernel(&self) -> KernelSize {
        self.kernel
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// One flag per input element marking the arg-max of its window.
    pub fn connections(&self) -> &Array3<bool> {
        &self.connections
    }

    /// `((H − kh) / s + 1, (W − kw) / s + 1, depth)`; the stride must divide
    /// `H − kh` and `W − kw`.
    pub fn output_shape(&self, input: (usize, usize, usize)) -> NetResult<(usize, usize, usize)> {
        let (height, width, depth) = input;
        let rows = pooled_extent(height, self.kernel.height, self.stride)?;
        let cols = pooled_extent(width, self.kernel.width, self.stride)?;
        Ok((rows, cols, depth))
    }

    fn pass(&mut self, upstream: &mut Array3<f32>, order: PassOrder) -> NetResult<Gradients> {
        self.state.require_forwarded(NAME)?;
        let (rows, cols, depth) = self
            .state
            .receptive_field()
            .ok_or_else(|| NetError::NoForwardPass(NAME.to_string()))?
            .dim();
        if upstream.dim() != (rows, cols, depth) {
            *upstream = unvectorise(upstream, rows, cols, depth)?;
        }
        if self.winners.dim() != (rows, cols, depth) {
            return Err(NetError::NoForwardPass(NAME.to_string()));
        }

        let mut routed = Array3::zeros(self.connections.dim());
        for ((row, col, d), &(r, c)) in self.winners.indexed_iter() {
            routed[[r, c, d]] += upstream[[row, col, d]];
        }

        // zero marks "not connected", not an activation input
        if let Some(activation) = self.state.activation {
            routed.mapv_inplace(|value: f32| {
                if value == 0.0 {
                    value
                } else {
                    value * order.apply(activation.derivative(value))
                }
            });
        }

        self.state.local_loss.ensure(routed.dim()).assign(&routed);
        Ok((WeightTensor::empty(), WeightTensor::empty()))
    }
}

fn pooled_extent(extent: usize, kernel: usize, stride: usize) -> NetResult<usize> {
    if extent < kernel || (extent - kernel) % stride != 0 {
        return Err(NetError::InvalidGeometry(format!(
            "pooling window {} with stride {} does not tile an extent of {}",
            kernel, stride, extent
        )));
    }
    Ok((extent - kernel) / stride + 1)
}

impl Layer for MaxPoolingLayer {
    fn forward(&mut self, input: &Array3<f32>) -> NetResult<()> {
        let (rows, cols, depth) = self.output_shape(input.dim())?;
        self.state.input.assign(input);

        if self.connections.dim() != input.dim() {
            self.connections = Array3::from_elem(input.dim(), false);
        } else {
            self.connections.fill(false);
        }
        if self.winners.dim() != (rows, cols, depth) {
            self.winners = Array3::from_elem((rows, cols, depth), (0, 0));
        }

        let field = self.state.receptive_field.ensure((rows, cols, depth));
        for d in 0..depth {
            for col in 0..cols {
                for row in 0..rows {
                    let (top, left) = (row * self.stride, col * self.stride);
                    let mut best = (top, left);
                    for kc in 0..self.kernel.width {
                        for kr in 0..self.kernel.height {
                            let (r, c) = (top + kr, left + kc);
                            if input[[r, c, d]] > input[[best.0, best.1, d]] {
                                best = (r, c);
                            }
                        }
                    }
                    field[[row, col, d]] = input[[best.0, best.1, d]];
                    self.connections[[best.0, best.1, d]] = true;
                    self.winners[[row, col, d]] = best;
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
