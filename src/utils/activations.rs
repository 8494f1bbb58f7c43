//! Activation functions for layer outputs
//!
//! Each variant maps a 3-D signal element-wise to an output of the same shape and
//! exposes a scalar derivative that backward passes evaluate at the stored
//! pre-activation values.
//!
//! - `Relu`: `max(0, x)`. Its derivative is the logistic sigmoid `1 / (1 + e^-x)`,
//!   kept as-is so that previously trained weights keep their training dynamics.
//! - `Tanh`: `tanh(x)`, derivative `1 - tanh²(x)`.
//! - `Softmax`: column-vector only, stabilised by subtracting the maximum. Its
//!   derivative `v·(1 - v)` is the Jacobian diagonal only; output layers take
//!   the combined softmax/cross-entropy gradient from the cost function instead.

use crate::error::{NetError, NetResult};
use crate::tensor::is_vector_shaped;
use ndarray::Array3;
use serde::Deserialize;

/// Closed set of activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Tanh,
    Softmax,
}

impl Activation {
    /// Write `f(src)` into `dst`; both must have identical shapes.
    pub fn compute(self, src: &Array3<f32>, dst: &mut Array3<f32>) -> NetResult<()> {
        if src.dim() != dst.dim() {
            return Err(NetError::ShapeMismatch(format!(
                "activation source {:?} and destination {:?} differ",
                src.dim(),
                dst.dim()
            )));
        }
        match self {
            Activation::Relu => dst.zip_mut_with(src, |d, &s| *d = s.max(0.0)),
            Activation::Tanh => dst.zip_mut_with(src, |d, &s| *d = s.tanh()),
            Activation::Softmax => softmax_column(src, dst)?,
        }
        Ok(())
    }

    /// Scalar derivative evaluated at a pre-activation value.
    pub fn derivative(self, value: f32) -> f32 {
        match self {
            Activation::Relu => 1.0 / (1.0 + (-value).exp()),
            Activation::Tanh => {
                let t = value.tanh();
                1.0 - t * t
            }
            Activation::Softmax => value * (1.0 - value),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Softmax => "softmax",
        }
    }

    /// Parse an activation from its configuration name.
    pub fn from_name(name: &str) -> NetResult<Self> {
        match name.to_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "softmax" => Ok(Activation::Softmax),
            other => Err(NetError::InvalidConfig(format!(
                "Invalid activation function '{}'. Must be one of: relu, tanh, softmax",
                other
            ))),
        }
    }
}

/// Numerically stable softmax over an `(n, 1, 1)` signal.
pub fn softmax_column(src: &Array3<f32>, dst: &mut Array3<f32>) -> NetResult<()> {
    if !is_vector_shaped(src) || src.dim() != dst.dim() {
        return Err(NetError::ShapeMismatch(format!(
            "softmax expects matching column vectors, got {:?} and {:?}",
            src.dim(),
            dst.dim()
        )));
    }
    if src.is_empty() {
        return Ok(());
    }
    let max_value = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    dst.zip_mut_with(src, |d, &s| {
        *d = (s - max_value).exp();
        sum += *d;
    });
    let inv_sum = 1.0 / sum;
    dst.mapv_inplace(|v| v * inv_sum);
    Ok(())
}

/// `ln Σ exp(x)` computed without overflow.
pub fn log_sum_exp<'a, I>(values: I) -> f32
where
    I: IntoIterator<Item = &'a f32>,
    I::IntoIter: Clone,
{
    let iter = values.into_iter();
    let max_value = iter.clone().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max_value.is_finite() {
        return max_value;
    }
    let sum: f32 = iter.map(|&v| (v - max_value).exp()).sum();
    max_value + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array};

    const EPSILON: f32 = 1e-6;

    fn column(values: &[f32]) -> Array3<f32> {
        arr1(values).into_shape((values.len(), 1, 1)).unwrap()
    }

    #[test]
    fn test_relu_compute() {
        let src = column(&[-2.0, -0.5, 0.0, 1.5]);
        let mut dst = Array3::zeros(src.dim());
        Activation::Relu.compute(&src, &mut dst).unwrap();
        let values: Vec<f32> = dst.iter().copied().collect();
        assert_eq!(values, vec![0.0, 0.0, 0.0, 1.5]);
    }

    #[test]
    fn test_relu_derivative_is_logistic() {
        assert!((Activation::Relu.derivative(0.0) - 0.5).abs() < EPSILON);
        let expected = 1.0 / (1.0 + (-2.0f32).exp());
        assert!((Activation::Relu.derivative(2.0) - expected).abs() < EPSILON);
    }

    #[test]
    fn test_tanh_on_cube() {
        let src = Array::from_shape_fn((2, 3, 2), |(r, c, s)| r as f32 - c as f32 + s as f32);
        let mut dst = Array3::zeros(src.dim());
        Activation::Tanh.compute(&src, &mut dst).unwrap();
        for (out, inp) in dst.iter().zip(src.iter()) {
            assert!((out - inp.tanh()).abs() < EPSILON);
        }
    }

    #[test]
    fn test_compute_shape_mismatch() {
        let src = Array3::zeros((2, 2, 1));
        let mut dst = Array3::zeros((2, 1, 1));
        assert!(Activation::Tanh.compute(&src, &mut dst).is_err());
    }

    #[test]
    fn test_softmax_rejects_cube() {
        let src = Array3::zeros((2, 2, 1));
        let mut dst = Array3::zeros((2, 2, 1));
        assert!(Activation::Softmax.compute(&src, &mut dst).is_err());
    }

    #[test]
    fn test_softmax_uniform_input() {
        let src = column(&[1.0, 1.0, 1.0]);
        let mut dst = Array3::zeros(src.dim());
        softmax_column(&src, &mut dst).unwrap();
        for &val in dst.iter() {
            assert!((val - 1.0 / 3.0).abs() < EPSILON);
        }
    }

    #[test]
    fn test_log_sum_exp_large_values() {
        let values = [1000.0f32, 1000.0, 1000.0];
        let lse = log_sum_exp(values.iter());
        assert!((lse - (1000.0 + 3.0f32.ln())).abs() < 1e-3);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Activation::from_name("ReLU").unwrap(), Activation::Relu);
        assert_eq!(Activation::from_name("tanh").unwrap(), Activation::Tanh);
        assert!(Activation::from_name("gelu").is_err());
    }
}
