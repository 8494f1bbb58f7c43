//! Network orchestrator
//!
//! A [`Network`] owns a linear stack of layers, a sample source and a cost
//! function. It drives forward passes left to right and both backward passes
//! right to left, handing each layer's local loss to the layer before it.

use crate::cost::CostFunction;
use crate::data::SampleSource;
use crate::error::{NetError, NetResult};
use crate::layers::{Gradients, Layer, PassOrder};
use crate::tensor::WeightTensor;
use crate::utils::rng::SimpleRng;
use log::debug;
use ndarray::{Array1, Array3};
use std::io::{BufRead, Write};

/// Linear stack of layers trained against one sample source.
///
/// # Example
///
/// ```ignore
/// let mut net = Network::new(Box::new(source), CostFunction::CrossEntropy);
/// net.append_layer(Box::new(FullyConnectedLayer::new(4, 3, Some(Activation::Relu))?));
/// net.append_layer(Box::new(SoftmaxLayer::new(3, 2)?));
/// net.init_weights(&mut SimpleRng::new(42));
///
/// net.load_train_sample()?;
/// net.forward()?;
/// let gradients = net.backpropagation()?;
/// ```
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
    source: Box<dyn SampleSource>,
    cost: CostFunction,
    input: Option<Array3<f32>>,
    labels: Array1<f32>,
}

impl Network {
    pub fn new(source: Box<dyn SampleSource>, cost: CostFunction) -> Self {
        Self {
            layers: Vec::new(),
            source,
            cost,
            input: None,
            labels: Array1::zeros(0),
        }
    }

    pub fn append_layer(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> Option<&dyn Layer> {
        self.layers.get(index).map(|layer| &**layer)
    }

    pub fn cost(&self) -> CostFunction {
        self.cost
    }

    pub fn label_name(&self, id: usize) -> Option<&str> {
        self.source.label_name(id)
    }

    pub fn num_classes(&self) -> usize {
        self.source.num_classes()
    }

    /// Total number of trainable parameters across all layers.
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.parameter_count()).sum()
    }

    /// Draw fresh random weights for every layer.
    pub fn init_weights(&mut self, rng: &mut SimpleRng) {
        for layer in &mut self.layers {
            layer.init_weights(rng);
        }
    }

    /// True when the stack is non-empty and every layer is ready.
    pub fn is_initialized(&self) -> bool {
        !self.layers.is_empty() && self.layers.iter().all(|layer| layer.is_initialized())
    }

    /// Load weights written by [`Network::save_weights`].
    ///
    /// All records are parsed before any layer changes, so a failed load leaves
    /// the network untouched.
    pub fn load_weights(&mut self, input: &mut dyn BufRead) -> NetResult<()> {
        if self.layers.is_empty() {
            return Err(NetError::EmptyNetwork);
        }
        let staged = self
            .layers
            .iter()
            .map(|layer| layer.read_weights(&mut *input))
            .collect::<NetResult<Vec<_>>>()?;
        for (layer, weights) in self.layers.iter_mut().zip(staged) {
            layer.commit_weights(weights);
        }
        Ok(())
    }

    /// Write every layer's weights in declaration order.
    pub fn save_weights(&self, out: &mut dyn Write) -> NetResult<()> {
        if self.layers.is_empty() {
            return Err(NetError::EmptyNetwork);
        }
        if !self.is_initialized() {
            return Err(NetError::NotInitialized("network".to_string()));
        }
        for layer in &self.layers {
            layer.save_weights(out)?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn load_train_sample(&mut self) -> NetResult<()> {
        let sample = self.source.next_train_sample()?;
        self.input = Some(sample.image);
        self.labels = sample.labels;
        Ok(())
    }

    pub fn load_test_sample(&mut self) -> NetResult<()> {
        let sample = self.source.next_test_sample()?;
        self.input = Some(sample.image);
        self.labels = sample.labels;
        Ok(())
    }

    /// Use a custom image as input; the current labels are cleared.
    pub fn set_input(&mut self, image: Array3<f32>) {
        self.input = Some(image);
        self.labels = Array1::zeros(0);
    }

    pub fn input(&self) -> Option<&Array3<f32>> {
        self.input.as_ref()
    }

    pub fn labels(&self) -> &Array1<f32> {
        &self.labels
    }

    /// Output of the last layer.
    pub fn hypothesis(&self) -> NetResult<&Array3<f32>> {
        let last = self.layers.last().ok_or(NetError::EmptyNetwork)?;
        last.output()
            .ok_or_else(|| NetError::NoForwardPass(last.name().to_string()))
    }

    pub fn output(&self, index: usize) -> Option<&Array3<f32>> {
        self.layers.get(index).and_then(|layer| layer.output())
    }

    pub fn receptive_field(&self, index: usize) -> Option<&Array3<f32>> {
        self.layers.get(index).and_then(|layer| layer.receptive_field())
    }

    pub fn weights_mut(&mut self, index: usize) -> Option<&mut WeightTensor> {
        self.layers.get_mut(index).map(|layer| layer.weights_mut())
    }

    pub fn bias_weights_mut(&mut self, index: usize) -> Option<&mut WeightTensor> {
        self.layers.get_mut(index).map(|layer| layer.bias_weights_mut())
    }

    /// Index of the most probable class for the current input.
    pub fn predicted_class(&self) -> NetResult<usize> {
        let hypothesis = self.hypothesis()?;
        hypothesis
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (idx, &value)| match best {
                Some((_, top)) if top >= value => best,
                _ => Some((idx, value)),
            })
            .map(|(idx, _)| idx)
            .ok_or_else(|| NetError::ShapeMismatch("empty hypothesis".to_string()))
    }

    /// Feed the current input through every layer.
    pub fn forward(&mut self) -> NetResult<()> {
        let input = self.input.as_ref().ok_or(NetError::MissingInput)?;
        let (first, _) = self.layers.split_first_mut().ok_or(NetError::EmptyNetwork)?;
        first.forward(input)?;
        debug!("forward {} -> {:?}", first.name(), first.output().map(|o| o.dim()));

        for idx in 1..self.layers.len() {
            let (done, rest) = self.layers.split_at_mut(idx);
            let previous = &done[idx - 1];
            let signal = previous
                .output()
                .ok_or_else(|| NetError::NoForwardPass(previous.name().to_string()))?;
            let layer = &mut rest[0];
            layer.forward(signal)?;
            debug!("forward {} -> {:?}", layer.name(), layer.output().map(|o| o.dim()));
        }
        Ok(())
    }

    /// Scalar loss of the current sample.
    ///
    /// For an output layer that combines its activation with the loss, the loss is
    /// evaluated on its receptive field through log-sum-exp.
    pub fn error(&self) -> NetResult<f32> {
        if self.labels.is_empty() {
            return Err(NetError::MissingLabels);
        }
        let last = self.layers.last().ok_or(NetError::EmptyNetwork)?;
        let not_forwarded = || NetError::NoForwardPass(last.name().to_string());
        if last.combines_loss() {
            let field = last.receptive_field().ok_or_else(not_forwarded)?;
            let logits = Array1::from_iter(field.iter().copied());
            self.cost.compute_from_logits(&self.labels, &logits)
        } else {
            let output = last.output().ok_or_else(not_forwarded)?;
            let hypothesis = Array1::from_iter(output.iter().copied());
            self.cost.compute(&self.labels, &hypothesis)
        }
    }

    /// First-order backpropagation; one gradient pair per layer, in layer order.
    pub fn backpropagation(&mut self) -> NetResult<Vec<Gradients>> {
        self.backward_pass(PassOrder::First)
    }

    /// Second-order backpropagation producing diagonal Gauss–Newton curvature
    /// estimates, one pair per layer, in layer order.
    pub fn backpropagation_2nd(&mut self) -> NetResult<Vec<Gradients>> {
        self.backward_pass(PassOrder::Second)
    }

    fn backward_pass(&mut self, order: PassOrder) -> NetResult<Vec<Gradients>> {
        if self.labels.is_empty() {
            return Err(NetError::MissingLabels);
        }
        let hypothesis = self.hypothesis()?;
        if hypothesis.len() != self.labels.len() {
            return Err(NetError::ShapeMismatch(format!(
                "{} labels against a hypothesis of shape {:?}",
                self.labels.len(),
                hypothesis.dim()
            )));
        }

        let cost = self.cost;
        let mut loss = Array3::zeros((self.labels.len(), 1, 1));
        for (idx, (&label, &h)) in self.labels.iter().zip(hypothesis.iter()).enumerate() {
            loss[[idx, 0, 0]] = match order {
                PassOrder::First => cost.derivative(label, h),
                PassOrder::Second => cost.second_derivative(label, h),
            };
        }

        let mut gradients = Vec::with_capacity(self.layers.len());
        for idx in (0..self.layers.len()).rev() {
            let layer = &mut self.layers[idx];
            let pair = match order {
                PassOrder::First => layer.backward(&mut loss)?,
                PassOrder::Second => layer.backward_2nd(&mut loss)?,
            };
            debug!(
                "backward {:?} {} -> {} weight entries",
                order,
                layer.name(),
                pair.0.count()
            );
            gradients.push(pair);
            if idx > 0 {
                let local = layer
                    .local_loss()
                    .ok_or_else(|| NetError::NoForwardPass(layer.name().to_string()))?;
                loss.clone_from(local);
            }
        }
        gradients.reverse();
        Ok(gradients)
    }
}
