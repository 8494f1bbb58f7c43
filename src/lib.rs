//! Convolutional Network Training Library
//!
//! This library provides the pieces needed to train small convolutional networks
//! on the CPU with first- and second-order backpropagation.
//!
//! # Modules
//!
//! - `tensor`: 4-D weight storage and the im2col/kernel2col lowering helpers
//! - `layers`: Layer trait and implementations (convolutional, max pooling,
//!   fully connected, softmax)
//! - `cost`: Euclidean and cross-entropy losses
//! - `network`: Ordered layer stack with forward/backward orchestration and
//!   weight persistence
//! - `data`: Sample sources feeding the network
//! - `solvers`: SGD and SDLM training loops
//! - `utils`: Shared utilities (RNG, activation functions)
//! - `config`: Solver configuration structures
//! - `architecture`: Architecture configuration and network building
//! - `error`: Crate error type

pub mod architecture;
pub mod config;
pub mod cost;
pub mod data;
pub mod error;
pub mod layers;
pub mod network;
pub mod solvers;
pub mod tensor;
pub mod utils;

pub use cost::CostFunction;
pub use error::{NetError, NetResult};
pub use network::Network;
pub use tensor::WeightTensor;
