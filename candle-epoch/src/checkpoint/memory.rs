//! Checkpoints kept in process memory.

use super::{Checkpoint, CheckpointStore, SavedCheckpoint};
use crate::error::Result;
use candle::Device;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Entries = Vec<(SavedCheckpoint, Checkpoint)>;

/// Keeps checkpoints in memory. Useful for tests and short experiments.
///
/// Clones share the same storage, so a handle kept outside the trainer sees every save.
#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointStore {
    saved: Arc<Mutex<Entries>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.saved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Epoch numbers of every save, in save order.
    pub fn saved_epochs(&self) -> Vec<usize> {
        self.entries().iter().map(|(s, _)| s.epoch).collect()
    }

    pub fn get(&self, save_index: u64) -> Option<Checkpoint> {
        self.entries()
            .iter()
            .find(|(s, _)| s.save_index == save_index)
            .map(|(_, c)| c.clone())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<SavedCheckpoint> {
        let mut entries = self.entries();
        let save_index = entries.len() as u64 + 1;
        let saved = SavedCheckpoint {
            save_index,
            epoch: checkpoint.epoch(),
            location: format!("memory:{save_index}"),
        };
        entries.push((saved.clone(), checkpoint.clone()));
        Ok(saved)
    }

    fn latest(&self, device: &Device) -> Result<Option<Checkpoint>> {
        let entries = self.entries();
        entries.last().map(|(_, c)| c.to_device(device)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Tensor;
    use std::collections::HashMap;

    #[test]
    fn clones_share_saves() -> Result<()> {
        let handle = MemoryCheckpointStore::new();
        let mut store = handle.clone();
        let mut tensors = HashMap::new();
        tensors.insert("model.w".to_string(), Tensor::new(&[1f32], &Device::Cpu)?);

        store.save(&Checkpoint::new(2, tensors.clone()))?;
        store.save(&Checkpoint::new(4, tensors))?;

        assert_eq!(handle.saved_epochs(), vec![2, 4]);
        assert_eq!(handle.latest(&Device::Cpu)?.map(|c| c.epoch()), Some(4));
        assert_eq!(handle.get(1).map(|c| c.epoch()), Some(2));
        Ok(())
    }
}
