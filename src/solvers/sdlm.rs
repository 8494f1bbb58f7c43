//! Stochastic diagonal Levenberg–Marquardt
//!
//! SDLM keeps a running estimate of the diagonal of the Gauss–Newton curvature
//! for every weight and scales each weight's step by the inverse of that
//! estimate, damped by `mu`.

use crate::config::{SolverConfig, SolverKind};
use crate::error::NetResult;
use crate::layers::Gradients;
use crate::network::Network;
use crate::solvers::{self, Solver, TrainingReport};
use crate::tensor::WeightTensor;
use log::info;

/// Stochastic diagonal Levenberg–Marquardt solver.
///
/// Per epoch, with ḡ the batch-averaged gradient and ĥ the batch-averaged
/// curvature from the second-order pass:
///
/// ```text
/// h = (1 − γ) * h_prev + γ * ĥ      (h = ĥ on the first epoch)
/// w = w + η / (h + μ) * ḡ
/// ```
///
/// The smoothed curvature persists across the epochs of one `solve` call and
/// is cleared when the next call starts.
#[derive(Debug, Clone)]
pub struct SdlmSolver {
    config: SolverConfig,
    curvature: Option<Vec<Gradients>>,
}

impl SdlmSolver {
    /// Creates an SDLM solver; `config.solver` is forced to [`SolverKind::Sdlm`].
    pub fn new(config: SolverConfig) -> NetResult<Self> {
        let config = SolverConfig {
            solver: SolverKind::Sdlm,
            ..config
        };
        config.validate()?;
        Ok(Self {
            config,
            curvature: None,
        })
    }

    /// Smoothed curvature estimate of the last `solve` call, one
    /// `(weights, biases)` pair per layer.
    pub fn curvature(&self) -> Option<&[Gradients]> {
        self.curvature.as_deref()
    }

    fn smooth(&mut self, current: Vec<Gradients>) -> NetResult<()> {
        let gamma = self.config.gamma;
        match self.curvature.as_mut() {
            None => self.curvature = Some(current),
            Some(previous) => {
                for ((weights, biases), (w, b)) in previous.iter_mut().zip(current.iter()) {
                    weights.zip_apply(w, |old, new| (1.0 - gamma) * old + gamma * new)?;
                    biases.zip_apply(b, |old, new| (1.0 - gamma) * old + gamma * new)?;
                }
            }
        }
        Ok(())
    }

    /// Turn the averaged gradients into steps, in place.
    fn scale_steps(&self, gradients: &mut [Gradients]) -> NetResult<()> {
        let Some(curvature) = self.curvature.as_ref() else {
            return Ok(());
        };
        for ((weights, biases), (hw, hb)) in gradients.iter_mut().zip(curvature.iter()) {
            self.scale_step(weights, hw)?;
            self.scale_step(biases, hb)?;
        }
        Ok(())
    }

    fn scale_step(&self, gradient: &mut WeightTensor, curvature: &WeightTensor) -> NetResult<()> {
        let lr = self.config.learning_rate;
        let mu = self.config.mu;
        gradient.zip_apply(curvature, |g, h| lr / (h + mu) * g)
    }
}

impl Solver for SdlmSolver {
    fn solve(&mut self, network: &mut Network) -> NetResult<TrainingReport> {
        solvers::require_initialized(network)?;
        let mut report = TrainingReport::default();
        self.curvature = None;

        for epoch in 0..self.config.max_epoch {
            solvers::maybe_test(network, &self.config, epoch + 1, &mut report)?;

            let batch = solvers::run_batch(network, self.config.batch_size, true)?;
            let mut steps = batch.gradients;
            if let Some(current) = batch.curvature {
                self.smooth(current)?;
            }
            self.scale_steps(&mut steps)?;
            solvers::apply_steps(network, &steps)?;

            info!("epoch {}: training error = {:.6}", epoch + 1, batch.error);
            report.train_errors.push(batch.error);

            solvers::maybe_snapshot(network, &self.config, epoch + 1, &mut report);
        }
        Ok(report)
    }

    fn config(&self) -> &SolverConfig {
        &self.config
    }
}
