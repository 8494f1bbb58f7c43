// train_cnn.rs
// Trains a small convolutional network on a synthetic "bars" dataset: 8x8 images
// holding either one vertical or one horizontal bar plus Gaussian noise.
//
// Usage:
//   train_cnn [solver.json] [architecture.json]
//
// Defaults:
//   config/solver_sdlm.json
//   config/architectures/bars.json
//
// Set RUST_LOG=info (or debug) to see per-epoch errors and per-layer passes.

use log::{error, info};
use ndarray::Array3;
use rust_convnet::architecture::{build_network, load_architecture, ArchitectureConfig};
use rust_convnet::config::load_config;
use rust_convnet::data::{InMemorySource, Sample};
use rust_convnet::solvers;
use rust_convnet::utils::SimpleRng;
use rust_convnet::NetResult;
use std::env;
use std::fs;
use std::path::Path;
use std::process;

const TRAIN_SAMPLES: usize = 256;
const TEST_SAMPLES: usize = 64;
const NOISE_STD: f32 = 0.05;
const SEED: u64 = 7;

fn bar_image(height: usize, width: usize, vertical: bool, rng: &mut SimpleRng) -> Array3<f32> {
    let mut image = Array3::from_shape_fn((height, width, 1), |_| NOISE_STD * rng.next_gaussian());
    if vertical {
        let col = rng.gen_usize(width);
        for row in 0..height {
            image[[row, col, 0]] += 1.0;
        }
    } else {
        let row = rng.gen_usize(height);
        for col in 0..width {
            image[[row, col, 0]] += 1.0;
        }
    }
    image
}

fn bar_samples(
    count: usize,
    height: usize,
    width: usize,
    rng: &mut SimpleRng,
) -> NetResult<Vec<Sample>> {
    (0..count)
        .map(|i| {
            let class = i % 2;
            Sample::one_hot(bar_image(height, width, class == 0, rng), class, 2)
        })
        .collect()
}

fn run(solver_path: &str, architecture_path: &str) -> NetResult<()> {
    let solver_config = load_config(solver_path)?;
    let architecture: ArchitectureConfig = load_architecture(architecture_path)?;
    let [height, width, _] = architecture.input_shape;

    let mut rng = SimpleRng::new(SEED);
    let train = bar_samples(TRAIN_SAMPLES, height, width, &mut rng)?;
    let test = bar_samples(TEST_SAMPLES, height, width, &mut rng)?;
    let names = vec!["vertical".to_string(), "horizontal".to_string()];
    let source = InMemorySource::new(train, test.clone(), names, SEED)?;

    let mut network = build_network(&architecture, Box::new(source))?;
    network.init_weights(&mut rng);
    info!(
        "network: {} layers, {} parameters, cost {}",
        network.len(),
        network.parameter_count(),
        network.cost().name()
    );

    if solver_config.snapshot_interval > 0 {
        if let Some(parent) = Path::new(&solver_config.snapshot_prefix).parent() {
            fs::create_dir_all(parent)?;
        }
    }

    info!(
        "training: solver={:?} epochs={} batch={} lr={}",
        solver_config.solver,
        solver_config.max_epoch,
        solver_config.batch_size,
        solver_config.learning_rate
    );
    let mut solver = solvers::from_config(solver_config)?;
    let report = solver.solve(&mut network)?;
    if let Some(last) = report.train_errors.last() {
        info!("final training error = {:.6}", last);
    }

    let mut correct = 0usize;
    for sample in &test {
        network.set_input(sample.image.clone());
        network.forward()?;
        let predicted = network.predicted_class()?;
        if sample.labels[predicted] > 0.5 {
            correct += 1;
        }
    }
    let accuracy = 100.0 * correct as f32 / test.len() as f32;
    println!("Test accuracy: {:.2}% ({}/{})", accuracy, correct, test.len());
    Ok(())
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let solver_path = args
        .get(1)
        .map(String::as_str)
        .unwrap_or("config/solver_sdlm.json");
    let architecture_path = args
        .get(2)
        .map(String::as_str)
        .unwrap_or("config/architectures/bars.json");

    if let Err(e) = run(solver_path, architecture_path) {
        error!("training failed: {}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
