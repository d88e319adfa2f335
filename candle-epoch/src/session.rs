//! The training session: one model, its optimizer, and the metrics of the running epoch.

use crate::checkpoint::{Checkpoint, CheckpointStore, MODEL_PREFIX, OPTIMIZER_PREFIX};
use crate::error::{Result, TrainError};
use crate::metrics::MetricSet;
use crate::module::LightModule;
use crate::optim::OptimizerState;
use candle::{Device, Tensor};
use std::collections::HashMap;

/// Owns the trainable state (model parameters plus optimizer internals) and the
/// train/eval metric accumulators.
///
/// Only [`Trainer::train_step`](crate::Trainer::train_step) and [`restore`](Self::restore)
/// mutate the trainable state.
pub struct TrainingSession<M, O> {
    pub(crate) model: M,
    pub(crate) optimizer: O,
    pub(crate) epoch: usize,
    pub(crate) train_metrics: MetricSet,
    pub(crate) val_metrics: MetricSet,
}

impl<M, O> TrainingSession<M, O> {
    pub fn new(model: M, optimizer: O) -> Self {
        Self {
            model,
            optimizer,
            epoch: 0,
            train_metrics: MetricSet::new(),
            val_metrics: MetricSet::new(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn train_metrics(&self) -> &MetricSet {
        &self.train_metrics
    }

    pub fn val_metrics(&self) -> &MetricSet {
        &self.val_metrics
    }

    pub fn reset_metrics(&mut self) {
        self.train_metrics.reset();
        self.val_metrics.reset();
    }

    pub fn into_parts(self) -> (M, O) {
        (self.model, self.optimizer)
    }
}

impl<M, O> TrainingSession<M, O>
where
    M: LightModule,
    O: OptimizerState,
{
    /// Deep-copies parameters and optimizer state into a checkpoint tagged with the current epoch.
    pub fn snapshot(&self) -> Result<Checkpoint> {
        let mut tensors = HashMap::new();
        for (name, var) in self.model.named_parameters() {
            tensors.insert(format!("{MODEL_PREFIX}{name}"), var.as_tensor().copy()?);
        }
        for (name, t) in self.optimizer.state_tensors()? {
            tensors.insert(format!("{OPTIMIZER_PREFIX}{name}"), t);
        }
        Ok(Checkpoint::new(self.epoch, tensors))
    }

    /// Replaces the live state with `checkpoint`.
    ///
    /// Every parameter is checked and converted first, then the optimizer state is loaded
    /// (all-or-nothing), and only then are parameters overwritten. A failure in the first
    /// two stages leaves the session untouched.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let params = self.model.named_parameters();
        let mut staged = Vec::with_capacity(params.len());
        for (name, var) in params {
            let key = format!("{MODEL_PREFIX}{name}");
            let src = checkpoint
                .get(&key)
                .ok_or_else(|| mismatch(format!("checkpoint has no tensor `{key}`")))?;
            if src.dims() != var.dims() {
                return Err(mismatch(format!(
                    "`{key}` has shape {:?} in the checkpoint but {:?} in the model",
                    src.dims(),
                    var.dims()
                )));
            }
            let src = src.to_device(var.device())?.to_dtype(var.dtype())?;
            staged.push((var, src));
        }

        let optimizer_state = checkpoint.with_prefix(OPTIMIZER_PREFIX);
        self.optimizer
            .load_state_tensors(&optimizer_state)
            .map_err(|e| mismatch(e.to_string()))?;

        for (var, src) in staged {
            var.set(&src)?;
        }
        self.epoch = checkpoint.epoch();
        self.reset_metrics();
        tracing::debug!(epoch = self.epoch, "restored training session");
        Ok(())
    }

    /// Restores the newest checkpoint in `store`, if any. Returns its epoch.
    pub fn restore_latest<S>(&mut self, store: &S, device: &Device) -> Result<Option<usize>>
    where
        S: CheckpointStore + ?Sized,
    {
        match store.latest(device)? {
            Some(checkpoint) => {
                self.restore(&checkpoint)?;
                Ok(Some(checkpoint.epoch()))
            }
            None => Ok(None),
        }
    }

    /// Copies of every named parameter, for comparisons in tests and tooling.
    pub fn parameter_values(&self) -> Result<HashMap<String, Tensor>> {
        self.model
            .named_parameters()
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect()
    }
}

fn mismatch(message: String) -> TrainError {
    TrainError::storage("<checkpoint>", message)
}
