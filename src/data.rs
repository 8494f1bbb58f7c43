//! Sample sources feeding the network
//!
//! The network never reads datasets directly. It asks a [`SampleSource`] for the
//! next training or test sample, each an image cube plus a one-hot label vector.

use crate::error::{NetError, NetResult};
use crate::utils::rng::SimpleRng;
use ndarray::{Array1, Array3};

/// One input image with its label vector.
///
/// `labels` is one-hot over the classes, or empty for unlabeled input.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Array3<f32>,
    pub labels: Array1<f32>,
}

impl Sample {
    pub fn new(image: Array3<f32>, labels: Array1<f32>) -> Self {
        Self { image, labels }
    }

    /// Sample whose label vector is one-hot at `class` among `classes`.
    pub fn one_hot(image: Array3<f32>, class: usize, classes: usize) -> NetResult<Self> {
        if class >= classes {
            return Err(NetError::Source(format!(
                "class {} out of range for {} classes",
                class, classes
            )));
        }
        let mut labels = Array1::zeros(classes);
        labels[class] = 1.0;
        Ok(Self { image, labels })
    }

    pub fn unlabeled(image: Array3<f32>) -> Self {
        Self {
            image,
            labels: Array1::zeros(0),
        }
    }
}

/// Supplier of training and test samples.
pub trait SampleSource {
    fn next_train_sample(&mut self) -> NetResult<Sample>;

    fn next_test_sample(&mut self) -> NetResult<Sample>;

    /// Human-readable name of class `id`, if known.
    fn label_name(&self, id: usize) -> Option<&str>;

    fn num_classes(&self) -> usize;
}

/// Sample source backed by vectors, drawing uniformly at random.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    train: Vec<Sample>,
    test: Vec<Sample>,
    label_names: Vec<String>,
    rng: SimpleRng,
}

impl InMemorySource {
    /// Build a source over `train` and `test`. Every labeled sample must carry
    /// one entry per name in `label_names`.
    pub fn new(
        train: Vec<Sample>,
        test: Vec<Sample>,
        label_names: Vec<String>,
        seed: u64,
    ) -> NetResult<Self> {
        let classes = label_names.len();
        if let Some(bad) = train
            .iter()
            .chain(test.iter())
            .find(|s| !s.labels.is_empty() && s.labels.len() != classes)
        {
            return Err(NetError::Source(format!(
                "sample has {} labels, expected {}",
                bad.labels.len(),
                classes
            )));
        }
        Ok(Self {
            train,
            test,
            label_names,
            rng: SimpleRng::new(seed),
        })
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn test_len(&self) -> usize {
        self.test.len()
    }

    fn draw(samples: &[Sample], rng: &mut SimpleRng, set: &str) -> NetResult<Sample> {
        if samples.is_empty() {
            return Err(NetError::Source(format!("{} set is empty", set)));
        }
        Ok(samples[rng.gen_usize(samples.len())].clone())
    }
}

impl SampleSource for InMemorySource {
    fn next_train_sample(&mut self) -> NetResult<Sample> {
        Self::draw(&self.train, &mut self.rng, "training")
    }

    fn next_test_sample(&mut self) -> NetResult<Sample> {
        Self::draw(&self.test, &mut self.rng, "test")
    }

    fn label_name(&self, id: usize) -> Option<&str> {
        self.label_names.get(id).map(String::as_str)
    }

    fn num_classes(&self) -> usize {
        self.label_names.len()
    }
}
