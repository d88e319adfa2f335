//! Callback system for training hooks.
//!
//! Callbacks are the reporting side of the loop: they observe steps and epoch results but
//! never touch the trainable state.

mod history;

pub use history::History;

use crate::error::Result;
use crate::metrics::MetricValues;
use crate::{StepOutput, Trainer};

/// Metric results of one completed epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochMetrics {
    /// 1-based epoch number.
    pub epoch: usize,
    pub train: MetricValues,
    /// `None` when the epoch ran without an evaluation split.
    pub val: Option<MetricValues>,
}

impl EpochMetrics {
    pub fn train_loss(&self) -> Option<f64> {
        self.train.get("loss").copied()
    }

    pub fn val_loss(&self) -> Option<f64> {
        self.val.as_ref().and_then(|v| v.get("loss").copied())
    }

    /// Looks up `name` in the train metrics, or in the eval metrics when prefixed with `val_`.
    pub fn get(&self, name: &str) -> Option<f64> {
        match name.strip_prefix("val_") {
            Some(rest) => self.val.as_ref().and_then(|v| v.get(rest).copied()),
            None => self.train.get(name).copied(),
        }
    }
}

impl std::fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "epoch {}", self.epoch)?;
        for (name, value) in &self.train {
            write!(f, " {name}={value:.4}")?;
        }
        if let Some(val) = &self.val {
            for (name, value) in val {
                write!(f, " val_{name}={value:.4}")?;
            }
        }
        Ok(())
    }
}

pub trait Callback: Send {
    fn on_fit_start(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> Result<()> {
        Ok(())
    }
}
