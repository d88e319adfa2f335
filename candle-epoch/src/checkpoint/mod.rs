//! Checkpoint snapshots, save cadence and storage backends.

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use crate::error::{Result, TrainError};
use candle::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;

pub const MODEL_PREFIX: &str = "model.";
pub const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Decides after which epochs the trainer persists its state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointCadence {
    #[default]
    Never,
    /// Due after every epoch whose 1-based number is a multiple of the interval.
    EveryNEpochs(NonZeroUsize),
}

impl CheckpointCadence {
    pub fn every(k: usize) -> Result<Self> {
        NonZeroUsize::new(k)
            .map(Self::EveryNEpochs)
            .ok_or_else(|| TrainError::config("checkpoint interval must be at least 1"))
    }

    /// `epoch` is the 1-based number of the epoch that just completed.
    pub fn is_due(&self, epoch: usize) -> bool {
        match self {
            Self::Never => false,
            Self::EveryNEpochs(k) => epoch % k.get() == 0,
        }
    }
}

/// Immutable snapshot of a session's parameters and optimizer state.
///
/// Tensors are deep copies, so later in-place updates of the live vars do not leak in.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    epoch: usize,
    tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    pub fn new(epoch: usize, tensors: HashMap<String, Tensor>) -> Self {
        Self { epoch, tensors }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensors whose names start with `prefix`, with the prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> HashMap<String, Tensor> {
        self.tensors
            .iter()
            .filter_map(|(name, t)| name.strip_prefix(prefix).map(|n| (n.to_string(), t.clone())))
            .collect()
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let tensors = self
            .tensors
            .iter()
            .map(|(name, t)| Ok((name.clone(), t.to_device(device)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self::new(self.epoch, tensors))
    }
}

/// Where a checkpoint ended up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCheckpoint {
    /// Monotonically increasing per store, starting at 1.
    pub save_index: u64,
    pub epoch: usize,
    pub location: String,
}

/// Durable storage for checkpoints.
pub trait CheckpointStore: Send {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<SavedCheckpoint>;

    /// The most recently saved checkpoint, loaded onto `device`.
    fn latest(&self, device: &Device) -> Result<Option<Checkpoint>>;
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for Box<S> {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<SavedCheckpoint> {
        (**self).save(checkpoint)
    }

    fn latest(&self, device: &Device) -> Result<Option<Checkpoint>> {
        (**self).latest(device)
    }
}
