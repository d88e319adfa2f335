//! Epoch history recorder.

use super::{Callback, EpochMetrics};
use crate::error::Result;
use crate::{StepOutput, Trainer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Record {
    epochs: Vec<EpochMetrics>,
    batch_ends: usize,
}

/// Records every epoch report and counts finished train steps.
///
/// Clones share one record, so keep a clone before handing the callback to a trainer.
#[derive(Clone, Debug, Default)]
pub struct History {
    record: Arc<Mutex<Record>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epochs(&self) -> Vec<EpochMetrics> {
        self.lock().epochs.clone()
    }

    pub fn last(&self) -> Option<EpochMetrics> {
        self.lock().epochs.last().cloned()
    }

    /// Train steps observed across all fits.
    pub fn batch_ends(&self) -> usize {
        self.lock().batch_ends
    }

    pub fn clear(&self) {
        let mut record = self.lock();
        record.epochs.clear();
        record.batch_ends = 0;
    }

    fn lock(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Callback for History {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<()> {
        self.lock().epochs.push(metrics.clone());
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> Result<()> {
        self.lock().batch_ends += 1;
        Ok(())
    }
}
