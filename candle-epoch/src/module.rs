//! LightModule trait for trainable models.

use candle::{DType, Result, Tensor, Var};
use std::collections::HashMap;

/// Output from a training or validation step.
pub struct StepOutput {
    /// The scalar loss tensor for backpropagation.
    pub loss: Tensor,
    /// Optional per-batch metrics (e.g., accuracy, perplexity).
    pub metrics: HashMap<String, f64>,
    /// Weight of each metric in the epoch average. Metrics without one weigh 1.
    pub weights: HashMap<String, f64>,
}

impl StepOutput {
    pub fn new(loss: Tensor) -> Self {
        Self {
            loss,
            metrics: HashMap::new(),
            weights: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// A metric averaged over `weight` examples, so the epoch result weighs each batch by
    /// its size rather than counting every batch once.
    pub fn with_weighted_metric(mut self, name: impl Into<String>, value: f64, weight: f64) -> Self {
        let name = name.into();
        self.weights.insert(name.clone(), weight);
        self.metrics.insert(name, value);
        self
    }

    pub fn weight(&self, name: &str) -> f64 {
        self.weights.get(name).copied().unwrap_or(1.0)
    }

    /// The loss as an `f64`. Fails if the loss is not a scalar.
    pub fn loss_value(&self) -> Result<f64> {
        self.loss.to_dtype(DType::F64)?.to_scalar::<f64>()
    }
}

/// Trait for models that can be trained with [`Trainer`](crate::Trainer).
///
/// The model performs the forward pass and loss computation; the trainer owns
/// backpropagation, the optimizer update and metric bookkeeping.
pub trait LightModule {
    type Batch;

    /// Compute loss and metrics for a training batch.
    fn training_step(&mut self, batch: Self::Batch, batch_idx: usize) -> Result<StepOutput>;

    /// Compute loss and metrics for a validation batch. Must not touch parameters.
    fn validation_step(&self, batch: Self::Batch, batch_idx: usize) -> Result<StepOutput>;

    /// Return all trainable parameters.
    fn parameters(&self) -> Vec<Var>;

    /// Parameters under stable names, used as checkpoint keys.
    ///
    /// The default numbers the vars returned by [`parameters`](Self::parameters), which is only
    /// stable as long as that order is. Models backed by a `VarMap` should return its names.
    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param.{i}"), var))
            .collect()
    }
}
