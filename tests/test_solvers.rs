// Tests for the SGD and SDLM training loops.

use approx::assert_relative_eq;
use ndarray::Array3;
use rust_convnet::config::SolverConfig;
use rust_convnet::data::{InMemorySource, Sample};
use rust_convnet::layers::{FullyConnectedLayer, Gradients, Layer};
use rust_convnet::solvers::{SdlmSolver, SgdSolver, Solver};
use rust_convnet::utils::{Activation, SimpleRng};
use rust_convnet::{CostFunction, NetError, Network, WeightTensor};
use std::fs::File;
use std::io::BufReader;
use tempfile::tempdir;

fn column(values: &[f32]) -> Array3<f32> {
    Array3::from_shape_vec((values.len(), 1, 1), values.to_vec()).unwrap()
}

/// One 2 -> 2 layer trained on a single sample, so every batch sees the same
/// gradient.
fn single_sample_network(activation: Option<Activation>) -> Network {
    let sample = Sample::one_hot(column(&[1.0, 0.5]), 0, 2).unwrap();
    let names = vec!["a".to_string(), "b".to_string()];
    let source = InMemorySource::new(vec![sample.clone()], vec![sample], names, 1).unwrap();
    let mut network = Network::new(Box::new(source), CostFunction::Euclidean);
    network.append_layer(Box::new(FullyConnectedLayer::new(2, 2, activation).unwrap()));
    network.init_weights(&mut SimpleRng::new(21));
    network
}

fn weights(network: &Network) -> (WeightTensor, WeightTensor) {
    let layer = network.layer(0).unwrap();
    (layer.weights().clone(), layer.bias_weights().clone())
}

fn assert_tensors_close(actual: &WeightTensor, expected: &WeightTensor) {
    assert!(actual.same_layout(expected));
    for (a, e) in actual.iter().zip(expected.iter()) {
        for (x, y) in a.iter().zip(e.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-6);
        }
    }
}

#[test]
fn test_sgd_update_law() {
    let mut network = single_sample_network(None);
    network.load_train_sample().unwrap();
    network.forward().unwrap();
    let expected_error = network.error().unwrap();
    let gradients = network.backpropagation().unwrap();
    let (mut expected_w, mut expected_b) = weights(&network);

    let lr = -0.1;
    expected_w
        .zip_apply(&gradients[0].0, |w, g| w + lr * g)
        .unwrap();
    expected_b
        .zip_apply(&gradients[0].1, |b, g| b + lr * g)
        .unwrap();

    let config = SolverConfig {
        batch_size: 3,
        learning_rate: lr,
        max_epoch: 1,
        ..SolverConfig::default()
    };
    let report = SgdSolver::new(config)
        .unwrap()
        .solve(&mut network)
        .unwrap();

    assert_eq!(report.train_errors.len(), 1);
    assert_relative_eq!(report.train_errors[0], expected_error, epsilon = 1e-6);
    let (actual_w, actual_b) = weights(&network);
    assert_tensors_close(&actual_w, &expected_w);
    assert_tensors_close(&actual_b, &expected_b);
}

#[test]
fn test_sgd_with_negative_rate_descends() {
    let mut network = single_sample_network(None);
    let config = SolverConfig {
        batch_size: 1,
        learning_rate: -0.1,
        max_epoch: 60,
        ..SolverConfig::default()
    };
    let report = SgdSolver::new(config)
        .unwrap()
        .solve(&mut network)
        .unwrap();
    let first = report.train_errors[0];
    let last = *report.train_errors.last().unwrap();
    assert!(last < first * 0.1, "error went from {} to {}", first, last);
}

#[test]
fn test_sdlm_update_law() {
    let mut network = single_sample_network(None);
    network.load_train_sample().unwrap();
    network.forward().unwrap();
    let gradients = network.backpropagation().unwrap();
    let curvature = network.backpropagation_2nd().unwrap();
    let (mut expected_w, mut expected_b) = weights(&network);

    // linear layer under a Euclidean loss: curvature is x² for weights, 1 for biases
    assert_relative_eq!(curvature[0].0.get(0)[[1, 0, 0]], 0.25);
    assert_relative_eq!(curvature[0].1.get(0)[[0, 0, 0]], 1.0);

    let (lr, mu) = (-0.2, 0.05);
    let mut step_w = gradients[0].0.clone();
    step_w
        .zip_apply(&curvature[0].0, |g, h| lr / (h + mu) * g)
        .unwrap();
    let mut step_b = gradients[0].1.clone();
    step_b
        .zip_apply(&curvature[0].1, |g, h| lr / (h + mu) * g)
        .unwrap();
    expected_w.add_assign(&step_w).unwrap();
    expected_b.add_assign(&step_b).unwrap();

    let config = SolverConfig {
        batch_size: 2,
        learning_rate: lr,
        mu,
        gamma: 0.3,
        max_epoch: 1,
        ..SolverConfig::default()
    };
    SdlmSolver::new(config)
        .unwrap()
        .solve(&mut network)
        .unwrap();

    let (actual_w, actual_b) = weights(&network);
    assert_tensors_close(&actual_w, &expected_w);
    assert_tensors_close(&actual_b, &expected_b);
}

fn curvature_at_current_weights(network: &mut Network) -> (WeightTensor, WeightTensor) {
    network.load_train_sample().unwrap();
    network.forward().unwrap();
    network.backpropagation().unwrap();
    network.backpropagation_2nd().unwrap().remove(0)
}

fn sdlm_config(gamma: f32, max_epoch: usize) -> SolverConfig {
    SolverConfig {
        learning_rate: -0.5,
        gamma,
        max_epoch,
        ..SolverConfig::default()
    }
}

/// Curvature of the first two SDLM epochs on a fresh network.
fn two_epoch_curvatures(gamma: f32) -> (Gradients, Gradients) {
    let mut network = single_sample_network(Some(Activation::Tanh));
    let first = curvature_at_current_weights(&mut network);
    SdlmSolver::new(sdlm_config(gamma, 1))
        .unwrap()
        .solve(&mut network)
        .unwrap();
    let second = curvature_at_current_weights(&mut network);
    (first, second)
}

#[test]
fn test_sdlm_gamma_one_keeps_latest_curvature() {
    let (_, (expected_w, expected_b)) = two_epoch_curvatures(1.0);

    let mut network = single_sample_network(Some(Activation::Tanh));
    let mut solver = SdlmSolver::new(sdlm_config(1.0, 2)).unwrap();
    solver.solve(&mut network).unwrap();

    let curvature = solver.curvature().unwrap();
    assert_tensors_close(&curvature[0].0, &expected_w);
    assert_tensors_close(&curvature[0].1, &expected_b);
}

#[test]
fn test_sdlm_smoothing_blends_epochs() {
    let ((mut expected_w, _), (second_w, _)) = two_epoch_curvatures(0.25);
    expected_w
        .zip_apply(&second_w, |old, new| 0.75 * old + 0.25 * new)
        .unwrap();

    let mut network = single_sample_network(Some(Activation::Tanh));
    let mut solver = SdlmSolver::new(sdlm_config(0.25, 2)).unwrap();
    solver.solve(&mut network).unwrap();

    assert_tensors_close(&solver.curvature().unwrap()[0].0, &expected_w);
}

#[test]
fn test_sdlm_curvature_restarts_with_each_solve() {
    let mut network = single_sample_network(Some(Activation::Tanh));
    let mut solver = SdlmSolver::new(sdlm_config(0.25, 1)).unwrap();
    solver.solve(&mut network).unwrap();

    let (expected_w, expected_b) = curvature_at_current_weights(&mut network);
    solver.solve(&mut network).unwrap();

    let curvature = solver.curvature().unwrap();
    assert_tensors_close(&curvature[0].0, &expected_w);
    assert_tensors_close(&curvature[0].1, &expected_b);
}

#[test]
fn test_periodic_test_evaluation() {
    let mut network = single_sample_network(None);
    let config = SolverConfig {
        max_epoch: 6,
        test_interval: 2,
        test_size: 3,
        ..SolverConfig::default()
    };
    let report = SgdSolver::new(config)
        .unwrap()
        .solve(&mut network)
        .unwrap();
    let epochs: Vec<usize> = report.test_errors.iter().map(|(e, _)| *e).collect();
    assert_eq!(epochs, vec![2, 4, 6]);
    assert!(report.test_errors.iter().all(|(_, err)| err.is_finite()));
}

#[test]
fn test_snapshots_are_written_and_loadable() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("snap");
    let mut network = single_sample_network(None);
    let config = SolverConfig {
        max_epoch: 4,
        snapshot_interval: 2,
        snapshot_prefix: prefix.to_string_lossy().into_owned(),
        ..SolverConfig::default()
    };
    let report = SdlmSolver::new(config)
        .unwrap()
        .solve(&mut network)
        .unwrap();

    assert_eq!(report.snapshots.len(), 2);
    assert!(report.snapshots[0].ends_with("snap_2"));
    assert!(report.snapshots[1].ends_with("snap_4"));

    let mut restored = single_sample_network(None);
    restored
        .load_weights(&mut BufReader::new(File::open(&report.snapshots[1]).unwrap()))
        .unwrap();
    assert_eq!(weights(&restored), weights(&network));
}

#[test]
fn test_failed_snapshot_does_not_stop_training() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("missing").join("snap");
    let mut network = single_sample_network(None);
    let config = SolverConfig {
        max_epoch: 2,
        snapshot_interval: 1,
        snapshot_prefix: prefix.to_string_lossy().into_owned(),
        ..SolverConfig::default()
    };
    let report = SgdSolver::new(config)
        .unwrap()
        .solve(&mut network)
        .unwrap();
    assert_eq!(report.train_errors.len(), 2);
    assert!(report.snapshots.is_empty());
}

#[test]
fn test_solve_requires_initialized_network() {
    let sample = Sample::one_hot(column(&[1.0, 0.5]), 0, 2).unwrap();
    let names = vec!["a".to_string(), "b".to_string()];
    let source = InMemorySource::new(vec![sample], Vec::new(), names, 1).unwrap();
    let mut network = Network::new(Box::new(source), CostFunction::Euclidean);
    network.append_layer(Box::new(FullyConnectedLayer::new(2, 2, None).unwrap()));

    let result = SgdSolver::new(SolverConfig::default())
        .unwrap()
        .solve(&mut network);
    assert!(matches!(result, Err(NetError::NotInitialized(_))));
}
