//! Layer abstractions for convolutional networks
//!
//! This module provides the Layer trait, the state every layer shares, and the
//! four layer kinds a network is stacked from.

mod r#trait;
pub mod conv2d;
pub mod dense;
pub mod pooling;
pub mod softmax;
pub mod state;

// Re-export the Layer trait for convenience
pub use conv2d::{ConvolutionalLayer, KernelSize, Padding};
pub use dense::FullyConnectedLayer;
pub use pooling::MaxPoolingLayer;
pub use r#trait::{Gradients, Layer};
pub use softmax::SoftmaxLayer;
pub use state::{Buffer, BufferState, LayerState, PassOrder, StagedWeights};
