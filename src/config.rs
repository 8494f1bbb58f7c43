//! Configuration structures for training
//!
//! This module provides the solver configuration parsed from JSON files. Every
//! field has a default, so a configuration only needs to name what it changes.

use crate::error::{NetError, NetResult};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Which training loop drives the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    /// Mini-batch stochastic gradient descent.
    #[default]
    Sgd,
    /// Stochastic diagonal Levenberg–Marquardt.
    Sdlm,
}

/// Configuration shared by both solvers.
///
/// `mu` and `gamma` are only read by the SDLM solver. Intervals of zero disable
/// the periodic test evaluation or snapshotting.
///
/// Weights move by `+learning_rate · gradient`, where gradients follow the
/// `hypothesis − label` convention, so descending the loss takes a negative
/// learning rate.
///
/// # Example
///
/// ```json
/// {
///   "solver": "sdlm",
///   "batch_size": 16,
///   "learning_rate": -0.02,
///   "mu": 0.05,
///   "gamma": 0.1,
///   "max_epoch": 200,
///   "test_interval": 20,
///   "test_size": 32,
///   "snapshot_interval": 100,
///   "snapshot_prefix": "weights/lenet"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub solver: SolverKind,
    /// Training samples per weight update
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Levenberg–Marquardt damping added to the curvature
    pub mu: f32,
    /// Curvature smoothing factor, weight of the newest estimate
    pub gamma: f32,
    pub max_epoch: usize,
    /// Evaluate on the test set every `test_interval` epochs
    pub test_interval: usize,
    /// Number of test samples per evaluation
    pub test_size: usize,
    /// Save weights every `snapshot_interval` epochs
    pub snapshot_interval: usize,
    /// Snapshots are written to `<snapshot_prefix>_<epoch>`
    pub snapshot_prefix: String,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            solver: SolverKind::Sgd,
            batch_size: 1,
            learning_rate: -0.01,
            mu: 0.02,
            gamma: 0.1,
            max_epoch: 1,
            test_interval: 0,
            test_size: 0,
            snapshot_interval: 0,
            snapshot_prefix: String::new(),
        }
    }
}

impl SolverConfig {
    /// Check the fields every solver relies on; SDLM fields only when
    /// `solver` is [`SolverKind::Sdlm`].
    pub fn validate(&self) -> NetResult<()> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be greater than 0"));
        }
        if !self.learning_rate.is_finite() {
            return Err(invalid("learning_rate must be finite"));
        }
        if self.test_interval > 0 && self.test_size == 0 {
            return Err(invalid(
                "test_size must be greater than 0 when test_interval is set",
            ));
        }
        if self.snapshot_interval > 0 && self.snapshot_prefix.is_empty() {
            return Err(invalid(
                "snapshot_prefix must be set when snapshot_interval is set",
            ));
        }
        if self.solver == SolverKind::Sdlm {
            if !(self.mu > 0.0) {
                return Err(invalid("mu must be positive"));
            }
            if !(0.0..=1.0).contains(&self.gamma) {
                return Err(invalid("gamma must be in range [0.0, 1.0]"));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> NetError {
    NetError::InvalidConfig(message.to_string())
}

/// Loads a solver configuration from a JSON file.
///
/// # Returns
///
/// `Ok(SolverConfig)` on success, or an error if the file cannot be read, the
/// JSON is invalid or a value is out of range.
///
/// # Examples
///
/// ```no_run
/// use rust_convnet::config::load_config;
///
/// let cfg = load_config("config/solver_sdlm.json").unwrap();
/// assert!(cfg.batch_size > 0);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> NetResult<SolverConfig> {
    let contents = fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate a solver configuration from JSON text.
pub fn parse_config(json: &str) -> NetResult<SolverConfig> {
    let config: SolverConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}
