//! Training loops that update network weights
//!
//! This module provides the Solver trait and the two training loops that drive a
//! [`Network`]: mini-batch SGD and stochastic diagonal Levenberg–Marquardt (SDLM).
//!
//! # Overview
//!
//! Every epoch draws `batch_size` training samples, runs a forward pass and a
//! backpropagation for each, averages the per-layer gradients over the batch and
//! updates the weights in place. SDLM additionally averages the diagonal
//! curvature from the second-order pass and scales the step of every weight by
//! `learning_rate / (curvature + mu)`.
//!
//! Both loops evaluate the average error over `test_size` test samples every
//! `test_interval` epochs and save weights every `snapshot_interval` epochs.
//!
//! # Example
//!
//! ```ignore
//! use rust_convnet::solvers::{Solver, SdlmSolver};
//!
//! let mut solver = SdlmSolver::new(config)?;
//! let report = solver.solve(&mut network)?;
//! println!("final training error {:?}", report.train_errors.last());
//! ```

pub mod sdlm;
pub mod sgd;

pub use sdlm::SdlmSolver;
pub use sgd::SgdSolver;

use crate::config::{SolverConfig, SolverKind};
use crate::error::{NetError, NetResult};
use crate::layers::Gradients;
use crate::network::Network;
use log::{info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

/// Progress observed during one `solve` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    /// Average training error of each epoch's batch.
    pub train_errors: Vec<f32>,
    /// `(epoch, average test error)` for every test evaluation, epochs 1-based.
    pub test_errors: Vec<(usize, f32)>,
    /// Snapshot files written successfully.
    pub snapshots: Vec<PathBuf>,
}

/// Core trait for training loops.
pub trait Solver {
    /// Train `network` for `max_epoch` epochs.
    ///
    /// # Errors
    ///
    /// `NotInitialized` when the network has no initialized weights, plus any
    /// error raised by the sample source or a layer pass. Snapshot failures are
    /// logged and do not stop training.
    fn solve(&mut self, network: &mut Network) -> NetResult<TrainingReport>;

    fn config(&self) -> &SolverConfig;
}

/// Build the solver named by `config.solver`.
pub fn from_config(config: SolverConfig) -> NetResult<Box<dyn Solver>> {
    Ok(match config.solver {
        SolverKind::Sgd => Box::new(SgdSolver::new(config)?),
        SolverKind::Sdlm => Box::new(SdlmSolver::new(config)?),
    })
}

/// Averaged results of one training batch.
pub(crate) struct Batch {
    pub gradients: Vec<Gradients>,
    pub curvature: Option<Vec<Gradients>>,
    pub error: f32,
}

/// Run `batch_size` samples through the network and average their gradients,
/// and their curvature when `with_curvature` is set.
pub(crate) fn run_batch(
    network: &mut Network,
    batch_size: usize,
    with_curvature: bool,
) -> NetResult<Batch> {
    let mut gradients: Option<Vec<Gradients>> = None;
    let mut curvature: Option<Vec<Gradients>> = None;
    let mut error = 0.0f32;

    for _ in 0..batch_size {
        network.load_train_sample()?;
        network.forward()?;
        error += network.error()?;

        let sample_gradients = network.backpropagation()?;
        accumulate(&mut gradients, sample_gradients)?;
        if with_curvature {
            let sample_curvature = network.backpropagation_2nd()?;
            accumulate(&mut curvature, sample_curvature)?;
        }
    }

    let scale = 1.0 / batch_size as f32;
    let mut gradients = gradients.unwrap_or_default();
    average(&mut gradients, scale);
    if let Some(curvature) = curvature.as_mut() {
        average(curvature, scale);
    }
    Ok(Batch {
        gradients,
        curvature,
        error: error * scale,
    })
}

fn accumulate(total: &mut Option<Vec<Gradients>>, sample: Vec<Gradients>) -> NetResult<()> {
    match total {
        None => *total = Some(sample),
        Some(sum) => {
            for ((weights, biases), (w, b)) in sum.iter_mut().zip(sample.iter()) {
                weights.add_assign(w)?;
                biases.add_assign(b)?;
            }
        }
    }
    Ok(())
}

fn average(pairs: &mut [Gradients], scale: f32) {
    for (weights, biases) in pairs.iter_mut() {
        weights.scale(scale);
        biases.scale(scale);
    }
}

/// Add one step per layer to the network weights: `w += step`.
pub(crate) fn apply_steps(network: &mut Network, steps: &[Gradients]) -> NetResult<()> {
    for (index, (weight_step, bias_step)) in steps.iter().enumerate() {
        network
            .weights_mut(index)
            .ok_or_else(|| missing_layer(index))?
            .add_assign(weight_step)?;
        network
            .bias_weights_mut(index)
            .ok_or_else(|| missing_layer(index))?
            .add_assign(bias_step)?;
    }
    Ok(())
}

fn missing_layer(index: usize) -> NetError {
    NetError::ShapeMismatch(format!("no layer at index {}", index))
}

/// Average error over `test_size` test samples.
pub(crate) fn evaluate_test(network: &mut Network, test_size: usize) -> NetResult<f32> {
    let mut error = 0.0f32;
    for _ in 0..test_size {
        network.load_test_sample()?;
        network.forward()?;
        error += network.error()?;
    }
    Ok(error / test_size as f32)
}

/// Evaluate on the test set when `epoch` (1-based) hits the test interval.
pub(crate) fn maybe_test(
    network: &mut Network,
    config: &SolverConfig,
    epoch: usize,
    report: &mut TrainingReport,
) -> NetResult<()> {
    if config.test_interval == 0 || epoch % config.test_interval != 0 {
        return Ok(());
    }
    info!(
        "computing error on {} test samples at epoch {}",
        config.test_size, epoch
    );
    let error = evaluate_test(network, config.test_size)?;
    info!("epoch {}: test error = {:.6}", epoch, error);
    report.test_errors.push((epoch, error));
    Ok(())
}

/// Save weights to `<prefix>_<epoch>` when `epoch` (1-based) hits the snapshot
/// interval. Failures are logged and training continues.
pub(crate) fn maybe_snapshot(
    network: &Network,
    config: &SolverConfig,
    epoch: usize,
    report: &mut TrainingReport,
) {
    if config.snapshot_interval == 0 || epoch % config.snapshot_interval != 0 {
        return;
    }
    let path = PathBuf::from(format!("{}_{}", config.snapshot_prefix, epoch));
    let result = File::create(&path)
        .map_err(NetError::from)
        .and_then(|file| network.save_weights(&mut BufWriter::new(file)));
    match result {
        Ok(()) => {
            info!("saved weights to {}", path.display());
            report.snapshots.push(path);
        }
        Err(e) => warn!("cannot save weights to {}: {}", path.display(), e),
    }
}

pub(crate) fn require_initialized(network: &Network) -> NetResult<()> {
    if network.is_initialized() {
        Ok(())
    } else {
        Err(NetError::NotInitialized("network".to_string()))
    }
}
