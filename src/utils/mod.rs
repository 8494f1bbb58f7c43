//! Shared utilities: activation functions and random number generation.

pub mod activations;
pub mod rng;

pub use activations::Activation;
pub use rng::SimpleRng;
