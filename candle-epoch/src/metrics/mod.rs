//! Metrics for tracking training progress.

use candle::{DType, Result, Tensor, D};
use std::collections::BTreeMap;

/// Metric values keyed by name, sorted for stable reporting.
pub type MetricValues = BTreeMap<String, f64>;

pub trait Metric {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()>;
    fn compute(&self) -> f64;
    fn reset(&mut self);
}

/// Running mean over scalar observations, optionally weighted.
///
/// `result()` is `0.0` when nothing has been observed since the last reset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mean {
    sum: f64,
    weight: f64,
    count: u64,
}

impl Mean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, observation: f64) {
        self.update_weighted(observation, 1.0);
    }

    /// Adds `observation` as if it had been seen `weight` times, e.g. a batch average
    /// weighted by the batch size. Observations with a non-positive weight are ignored.
    pub fn update_weighted(&mut self, observation: f64, weight: f64) {
        if weight <= 0.0 || weight.is_nan() {
            return;
        }
        self.sum += observation * weight;
        self.weight += weight;
        self.count += 1;
    }

    pub fn result(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.weight
        }
    }

    /// Number of observations, regardless of weight.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.weight = 0.0;
        self.count = 0;
    }
}

/// A named collection of [`Mean`]s, one per reported quantity.
#[derive(Clone, Debug, Default)]
pub struct MetricSet {
    means: BTreeMap<String, Mean>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, value: f64) {
        self.record_weighted(name, value, 1.0);
    }

    pub fn record_weighted(&mut self, name: &str, value: f64, weight: f64) {
        match self.means.get_mut(name) {
            Some(mean) => mean.update_weighted(value, weight),
            None => {
                let mut mean = Mean::new();
                mean.update_weighted(value, weight);
                self.means.insert(name.to_string(), mean);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Mean> {
        self.means.get(name)
    }

    /// Current mean of every metric that received at least one observation.
    pub fn results(&self) -> MetricValues {
        self.means
            .iter()
            .filter(|(_, mean)| !mean.is_empty())
            .map(|(name, mean)| (name.clone(), mean.result()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.means.values().all(Mean::is_empty)
    }

    pub fn reset(&mut self) {
        for mean in self.means.values_mut() {
            mean.reset();
        }
    }
}

/// Fraction of examples whose arg-max prediction equals the integer label.
///
/// Counts examples rather than batches, so an undersized final batch is weighted correctly.
#[derive(Clone, Debug, Default)]
pub struct SparseCategoricalAccuracy {
    correct: u64,
    total: u64,
}

impl SparseCategoricalAccuracy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for SparseCategoricalAccuracy {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let (correct, total) = count_correct(preds, targets)?;
        self.correct += correct;
        self.total += total;
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Batch accuracy of `logits` (`[batch, classes]`) against `labels` (`[batch]`).
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f64> {
    let (correct, total) = count_correct(logits, labels)?;
    if total == 0 {
        return Ok(0.0);
    }
    Ok(correct as f64 / total as f64)
}

fn count_correct(logits: &Tensor, labels: &Tensor) -> Result<(u64, u64)> {
    let total = labels.dims1()?;
    let preds = logits.argmax(D::Minus1)?;
    let labels = labels.to_dtype(preds.dtype())?;
    let correct = preds
        .eq(&labels)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok((correct as u64, total as u64))
}
