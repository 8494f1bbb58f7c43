//! Architecture configuration structures
//!
//! This module provides configuration structures for defining network architectures
//! via JSON configuration files. Layer shapes are propagated from the declared input
//! shape, so every connection is checked before any weight is allocated.

use crate::cost::CostFunction;
use crate::data::SampleSource;
use crate::error::{NetError, NetResult};
use crate::layers::{
    ConvolutionalLayer, FullyConnectedLayer, KernelSize, Layer, MaxPoolingLayer, Padding,
    SoftmaxLayer,
};
use crate::network::Network;
use crate::utils::activations::Activation;
use log::debug;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Configuration for a single layer in the network.
///
/// Defines the layer type and its parameters. Different layer types read different fields:
///
/// - **convolutional**: `kernel_size`, `filters`, optional `stride` (default 1),
///   `padding` (default 0), `depth` (defaults to the input depth) and `activation`
/// - **max_pooling**: `kernel_size`, optional `stride` (defaults to `kernel_size`)
///   and `activation`
/// - **fully_connected**: `outputs`, optional `inputs` (defaults to the flattened
///   input size) and `activation`
/// - **softmax**: `classes`, optional `inputs`
///
/// # Examples
///
/// ```json
/// {
///   "layer_type": "convolutional",
///   "kernel_size": 5,
///   "filters": 6,
///   "stride": 1,
///   "padding": 2,
///   "activation": "tanh"
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Type of layer: "convolutional", "max_pooling", "fully_connected" or "softmax"
    pub layer_type: String,
    /// Activation applied to the receptive field: "relu", "tanh" or "softmax"
    pub activation: Option<String>,

    // Convolution and pooling parameters
    /// Square kernel size
    pub kernel_size: Option<usize>,
    /// Number of filters for a convolutional layer
    pub filters: Option<usize>,
    /// Expected input depth for a convolutional layer
    pub depth: Option<usize>,
    pub stride: Option<usize>,
    /// Symmetric zero padding for a convolutional layer
    pub padding: Option<usize>,

    // Fully connected and softmax parameters
    pub inputs: Option<usize>,
    pub outputs: Option<usize>,
    /// Number of classes for a softmax layer
    pub classes: Option<usize>,
}

/// Configuration for the entire network.
///
/// # Example
///
/// ```json
/// {
///   "input_shape": [28, 28, 1],
///   "cost": "cross_entropy",
///   "layers": [
///     { "layer_type": "convolutional", "kernel_size": 5, "filters": 6, "activation": "tanh" },
///     { "layer_type": "max_pooling", "kernel_size": 2 },
///     { "layer_type": "fully_connected", "outputs": 32, "activation": "relu" },
///     { "layer_type": "softmax", "classes": 10 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ArchitectureConfig {
    /// `[height, width, depth]` of every input image
    pub input_shape: [usize; 3],
    pub cost: CostFunction,
    /// Sequence of layer configurations, applied in order
    pub layers: Vec<LayerConfig>,
}

impl ArchitectureConfig {
    /// Shape produced by the last layer for the configured input.
    pub fn output_shape(&self) -> NetResult<(usize, usize, usize)> {
        Ok(build_layers(self)?.1)
    }
}

/// Loads an architecture configuration from a JSON file.
///
/// Reads the file at `path`, deserializes it and validates every layer and every
/// connection between consecutive layers.
///
/// # Examples
///
/// ```no_run
/// use rust_convnet::architecture::load_architecture;
///
/// let arch = load_architecture("config/architectures/lenet.json").unwrap();
/// assert!(!arch.layers.is_empty());
/// ```
pub fn load_architecture<P: AsRef<Path>>(path: P) -> NetResult<ArchitectureConfig> {
    let contents = fs::read_to_string(path)?;
    parse_architecture(&contents)
}

/// Parse and validate an architecture from JSON text.
pub fn parse_architecture(json: &str) -> NetResult<ArchitectureConfig> {
    let config: ArchitectureConfig = serde_json::from_str(json)?;
    validate_architecture(&config)?;
    Ok(config)
}

/// Validates an architecture configuration.
///
/// Checks that:
/// - Architecture has at least one layer and a non-empty input shape
/// - Each layer has the required fields for its type
/// - Each layer accepts the shape produced by the previous one
fn validate_architecture(config: &ArchitectureConfig) -> NetResult<()> {
    build_layers(config).map(|_| ())
}

/// Validates a single layer configuration without looking at its input.
fn validate_layer(layer: &LayerConfig, index: usize) -> NetResult<()> {
    let require = |field: Option<usize>, name: &str| -> NetResult<()> {
        match field {
            None => Err(invalid(index, format!(
                "{} layer requires '{}'",
                layer.layer_type, name
            ))),
            Some(0) => Err(invalid(index, format!("{} must be greater than 0", name))),
            Some(_) => Ok(()),
        }
    };
    let positive = |field: Option<usize>, name: &str| -> NetResult<()> {
        if field == Some(0) {
            Err(invalid(index, format!("{} must be greater than 0", name)))
        } else {
            Ok(())
        }
    };

    match layer.layer_type.to_lowercase().as_str() {
        "convolutional" => {
            require(layer.kernel_size, "kernel_size")?;
            require(layer.filters, "filters")?;
            positive(layer.stride, "stride")?;
            positive(layer.depth, "depth")?;
        }
        "max_pooling" => {
            require(layer.kernel_size, "kernel_size")?;
            positive(layer.stride, "stride")?;
        }
        "fully_connected" => {
            require(layer.outputs, "outputs")?;
            positive(layer.inputs, "inputs")?;
        }
        "softmax" => {
            require(layer.classes, "classes")?;
            positive(layer.inputs, "inputs")?;
            if layer.activation.is_some() {
                return Err(invalid(index, "softmax layer takes no activation".to_string()));
            }
        }
        other => {
            return Err(invalid(
                index,
                format!(
                    "Invalid layer type '{}'. Must be one of: convolutional, max_pooling, fully_connected, softmax",
                    other
                ),
            ));
        }
    }
    if let Some(name) = &layer.activation {
        Activation::from_name(name).map_err(|e| invalid(index, e.to_string()))?;
    }
    Ok(())
}

/// Builds the layers of an architecture and the shape of the last output.
///
/// Every layer is created with zero weights; call [`Network::init_weights`] or
/// load weights before training.
pub fn build_layers(
    config: &ArchitectureConfig,
) -> NetResult<(Vec<Box<dyn Layer>>, (usize, usize, usize))> {
    if config.layers.is_empty() {
        return Err(NetError::InvalidConfig(
            "Architecture must have at least one layer".to_string(),
        ));
    }
    let [height, width, depth] = config.input_shape;
    if height == 0 || width == 0 || depth == 0 {
        return Err(NetError::InvalidConfig(format!(
            "input_shape must be positive, got {:?}",
            config.input_shape
        )));
    }

    let mut shape = (height, width, depth);
    let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(config.layers.len());
    for (index, layer_config) in config.layers.iter().enumerate() {
        validate_layer(layer_config, index)?;
        let (layer, next) = build_layer(layer_config, index, shape)?;
        debug!(
            "layer {} ({}): {:?} -> {:?}",
            index,
            layer.name(),
            shape,
            next
        );
        layers.push(layer);
        shape = next;
    }
    Ok((layers, shape))
}

fn build_layer(
    layer: &LayerConfig,
    index: usize,
    input: (usize, usize, usize),
) -> NetResult<(Box<dyn Layer>, (usize, usize, usize))> {
    let activation = layer
        .activation
        .as_deref()
        .map(Activation::from_name)
        .transpose()?;
    let kernel = layer.kernel_size.unwrap_or(0);

    let built: NetResult<(Box<dyn Layer>, (usize, usize, usize))> = match layer.layer_type.to_lowercase().as_str() {
        "convolutional" => {
            let padding = layer.padding.unwrap_or(0);
            let conv = ConvolutionalLayer::new(
                KernelSize::square(kernel),
                layer.filters.unwrap_or(0),
                layer.depth.unwrap_or(input.2),
                layer.stride.unwrap_or(1),
                Padding::new(padding, padding),
                activation,
            )?;
            let output = conv
                .output_shape(input)
                .map_err(|e| connection(index, input, e))?;
            Ok((Box::new(conv), output))
        }
        "max_pooling" => {
            let pool = MaxPoolingLayer::new(
                KernelSize::square(kernel),
                layer.stride.unwrap_or(kernel),
                activation,
            )?;
            let output = pool
                .output_shape(input)
                .map_err(|e| connection(index, input, e))?;
            Ok((Box::new(pool), output))
        }
        "fully_connected" => {
            let inputs = expected_inputs(layer, index, input)?;
            let outputs = layer.outputs.unwrap_or(0);
            let dense = FullyConnectedLayer::new(inputs, outputs, activation)?;
            Ok((Box::new(dense), (outputs, 1, 1)))
        }
        "softmax" => {
            let inputs = expected_inputs(layer, index, input)?;
            let classes = layer.classes.unwrap_or(0);
            let softmax = SoftmaxLayer::new(inputs, classes)?;
            Ok((Box::new(softmax), (classes, 1, 1)))
        }
        other => Err(invalid(index, format!("Invalid layer type '{}'", other))),
    };
    built.map_err(|e| match e {
        NetError::InvalidGeometry(message) => invalid(index, message),
        other => other,
    })
}

fn expected_inputs(
    layer: &LayerConfig,
    index: usize,
    input: (usize, usize, usize),
) -> NetResult<usize> {
    let flattened = input.0 * input.1 * input.2;
    match layer.inputs {
        Some(inputs) if inputs != flattened => Err(invalid(
            index,
            format!(
                "Layer connection mismatch: expects {} inputs but previous output {:?} has {}",
                inputs, input, flattened
            ),
        )),
        _ => Ok(flattened),
    }
}

fn connection(index: usize, input: (usize, usize, usize), error: NetError) -> NetError {
    invalid(
        index,
        format!("Layer connection mismatch for input {:?}: {}", input, error),
    )
}

fn invalid(index: usize, message: String) -> NetError {
    NetError::InvalidConfig(format!("Layer {}: {}", index, message))
}

/// Builds a network from an architecture configuration.
///
/// # Errors
///
/// `InvalidConfig` when a layer is invalid or when the final output size does
/// not match the number of classes the source reports (a source with zero
/// classes is unlabeled and skips the check).
///
/// # Examples
///
/// ```no_run
/// use rust_convnet::architecture::{build_network, load_architecture};
/// # fn source() -> Box<dyn rust_convnet::data::SampleSource> { unimplemented!() }
///
/// let config = load_architecture("config/architectures/lenet.json").unwrap();
/// let network = build_network(&config, source()).unwrap();
/// assert_eq!(network.len(), config.layers.len());
/// ```
pub fn build_network(
    config: &ArchitectureConfig,
    source: Box<dyn SampleSource>,
) -> NetResult<Network> {
    let (layers, (rows, cols, slices)) = build_layers(config)?;
    let classes = source.num_classes();
    if classes > 0 && rows * cols * slices != classes {
        return Err(NetError::InvalidConfig(format!(
            "network produces {} outputs but the source has {} classes",
            rows * cols * slices,
            classes
        )));
    }

    let mut network = Network::new(source, config.cost);
    for layer in layers {
        network.append_layer(layer);
    }
    Ok(network)
}
