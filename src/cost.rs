//! Cost functions seeding backpropagation
//!
//! Both costs return `hypothesis - label` from [`CostFunction::derivative`]. For a
//! softmax output this is already the gradient with respect to the pre-activation
//! (the softmax Jacobian folded into the loss), so output layers must not multiply
//! it by an activation derivative again.

use crate::error::{NetError, NetResult};
use crate::utils::activations::{log_sum_exp, softmax_column};
use ndarray::{Array1, Array3};
use serde::Deserialize;

/// Closed set of loss functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostFunction {
    /// `½‖label − hypothesis‖²`
    Euclidean,
    /// `−Σ label · ln(hypothesis)`
    CrossEntropy,
}

impl CostFunction {
    /// Loss of a hypothesis (probabilities or raw outputs) against the labels.
    pub fn compute(self, labels: &Array1<f32>, hypothesis: &Array1<f32>) -> NetResult<f32> {
        check_lengths(labels, hypothesis)?;
        let loss = match self {
            CostFunction::Euclidean => {
                0.5 * labels
                    .iter()
                    .zip(hypothesis.iter())
                    .map(|(y, h)| (y - h) * (y - h))
                    .sum::<f32>()
            }
            CostFunction::CrossEntropy => -labels
                .iter()
                .zip(hypothesis.iter())
                .map(|(y, h)| y * trunc_ln(*h))
                .sum::<f32>(),
        };
        Ok(loss)
    }

    /// Loss evaluated on raw logits of a softmax output.
    ///
    /// Cross-entropy uses `Σ label · (lse(z) − z)`, which never forms `ln(softmax(z))`
    /// and so cannot underflow to `-inf`.
    pub fn compute_from_logits(self, labels: &Array1<f32>, logits: &Array1<f32>) -> NetResult<f32> {
        check_lengths(labels, logits)?;
        match self {
            CostFunction::CrossEntropy => {
                let lse = log_sum_exp(logits.iter());
                Ok(labels
                    .iter()
                    .zip(logits.iter())
                    .map(|(y, z)| y * (lse - z))
                    .sum())
            }
            CostFunction::Euclidean => {
                let column = logits.clone().into_shape((logits.len(), 1, 1)).map_err(|e| {
                    NetError::ShapeMismatch(format!("cannot reshape logits: {e}"))
                })?;
                let mut probabilities = Array3::zeros(column.dim());
                softmax_column(&column, &mut probabilities)?;
                let probabilities = Array1::from_iter(probabilities.iter().copied());
                self.compute(labels, &probabilities)
            }
        }
    }

    /// First derivative seed: `hypothesis − label` for both costs.
    pub fn derivative(self, label: f32, hypothesis: f32) -> f32 {
        hypothesis - label
    }

    /// Diagonal curvature seed for second-order backpropagation.
    pub fn second_derivative(self, label: f32, hypothesis: f32) -> f32 {
        match self {
            CostFunction::Euclidean => 1.0,
            CostFunction::CrossEntropy => label - 2.0 * hypothesis + hypothesis * hypothesis,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CostFunction::Euclidean => "euclidean",
            CostFunction::CrossEntropy => "cross_entropy",
        }
    }
}

fn trunc_ln(value: f32) -> f32 {
    value.max(f32::MIN_POSITIVE).ln()
}

fn check_lengths(labels: &Array1<f32>, hypothesis: &Array1<f32>) -> NetResult<()> {
    if labels.len() != hypothesis.len() {
        return Err(NetError::ShapeMismatch(format!(
            "{} labels against a hypothesis of {} values",
            labels.len(),
            hypothesis.len()
        )));
    }
    Ok(())
}
