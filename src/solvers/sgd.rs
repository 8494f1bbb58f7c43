//! Mini-batch stochastic gradient descent
//!
//! Each epoch averages the gradients of `batch_size` samples and moves every
//! weight by `learning_rate * gradient`.

use crate::config::{SolverConfig, SolverKind};
use crate::error::NetResult;
use crate::network::Network;
use crate::solvers::{self, Solver, TrainingReport};
use log::info;

/// Mini-batch SGD.
///
/// The update is `w = w + η * ḡ` where ḡ is the batch-averaged gradient. The
/// gradients point along `hypothesis − label`, so η is negative for descent.
///
/// # Example
///
/// ```ignore
/// use rust_convnet::config::SolverConfig;
/// use rust_convnet::solvers::{SgdSolver, Solver};
///
/// let config = SolverConfig { batch_size: 8, max_epoch: 50, ..SolverConfig::default() };
/// let report = SgdSolver::new(config)?.solve(&mut network)?;
/// ```
#[derive(Debug, Clone)]
pub struct SgdSolver {
    config: SolverConfig,
}

impl SgdSolver {
    /// Creates an SGD solver; `config.solver` is forced to [`SolverKind::Sgd`].
    pub fn new(config: SolverConfig) -> NetResult<Self> {
        let config = SolverConfig {
            solver: SolverKind::Sgd,
            ..config
        };
        config.validate()?;
        Ok(Self { config })
    }

    pub fn learning_rate(&self) -> f32 {
        self.config.learning_rate
    }
}

impl Solver for SgdSolver {
    fn solve(&mut self, network: &mut Network) -> NetResult<TrainingReport> {
        solvers::require_initialized(network)?;
        let mut report = TrainingReport::default();
        let lr = self.config.learning_rate;

        for epoch in 0..self.config.max_epoch {
            solvers::maybe_test(network, &self.config, epoch + 1, &mut report)?;

            let mut batch = solvers::run_batch(network, self.config.batch_size, false)?;
            for (weights, biases) in batch.gradients.iter_mut() {
                weights.scale(lr);
                biases.scale(lr);
            }
            solvers::apply_steps(network, &batch.gradients)?;

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
