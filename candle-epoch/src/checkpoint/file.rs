//! Safetensors checkpoints on disk with a JSON index.

use super::{Checkpoint, CheckpointStore, SavedCheckpoint};
use crate::error::{Result, TrainError};
use candle::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "checkpoint.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    entries: Vec<SavedCheckpoint>,
}

impl CheckpointIndex {
    fn next_save_index(&self) -> u64 {
        self.entries.last().map_or(1, |e| e.save_index + 1)
    }
}

/// Stores checkpoints as `<dir>/<prefix>-<save_index>.safetensors`.
///
/// Every file, including `checkpoint.json`, is written to a `.tmp` sibling and renamed into
/// place, so an interrupted save never replaces a good checkpoint with a partial one.
pub struct FileCheckpointStore {
    dir: PathBuf,
    prefix: String,
    keep_last: Option<usize>,
    index: CheckpointIndex,
}

impl FileCheckpointStore {
    /// Opens (creating if needed) a checkpoint directory and reads its index.
    pub fn open(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| TrainError::storage(&dir, e))?;

        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let raw = fs::read_to_string(&index_path).map_err(|e| TrainError::storage(&index_path, e))?;
            serde_json::from_str(&raw).map_err(|e| TrainError::storage(&index_path, e))?
        } else {
            CheckpointIndex::default()
        };

        Ok(Self {
            dir,
            prefix: prefix.into(),
            keep_last: None,
            index,
        })
    }

    /// Only keep the `n` most recent checkpoint files. `0` is treated as 1.
    pub fn keep_last(mut self, n: usize) -> Self {
        self.keep_last = Some(n.max(1));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[SavedCheckpoint] {
        &self.index.entries
    }

    fn write_index(&self, index: &CheckpointIndex) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        let json = serde_json::to_string_pretty(index).map_err(|e| TrainError::storage(&path, e))?;
        fs::write(&tmp, json).map_err(|e| TrainError::storage(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| TrainError::storage(&path, e))?;
        Ok(())
    }

    /// Splits off the entries that fall outside `keep_last`, oldest first.
    fn split_expired(&self, entries: &mut Vec<SavedCheckpoint>) -> Vec<SavedCheckpoint> {
        match self.keep_last {
            Some(keep) if entries.len() > keep => {
                let excess = entries.len() - keep;
                entries.drain(..excess).collect()
            }
            _ => Vec::new(),
        }
    }

    fn remove_files(&self, expired: &[SavedCheckpoint]) {
        for entry in expired {
            let path = self.dir.join(&entry.location);
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove old checkpoint");
            }
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<SavedCheckpoint> {
        let save_index = self.index.next_save_index();
        let filename = format!("{}-{}.safetensors", self.prefix, save_index);
        let path = self.dir.join(&filename);
        let tmp = self.dir.join(format!("{filename}.tmp"));

        candle::safetensors::save(checkpoint.tensors(), &tmp).map_err(|e| TrainError::storage(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| TrainError::storage(&path, e))?;

        let saved = SavedCheckpoint {
            save_index,
            epoch: checkpoint.epoch(),
            location: filename,
        };
        // Old files go only after the new index is on disk, so the index on disk never
        // names a deleted file.
        let mut entries = self.index.entries.clone();
        entries.push(saved.clone());
        let expired = self.split_expired(&mut entries);
        let index = CheckpointIndex { entries };
        self.write_index(&index)?;
        self.index = index;
        self.remove_files(&expired);

        tracing::debug!(path = %path.display(), epoch = saved.epoch, "wrote checkpoint");
        Ok(saved)
    }

    fn latest(&self, device: &Device) -> Result<Option<Checkpoint>> {
        let Some(entry) = self.index.entries.last() else {
            return Ok(None);
        };
        let path = self.dir.join(&entry.location);
        let tensors = candle::safetensors::load(&path, device).map_err(|e| TrainError::storage(&path, e))?;
        Ok(Some(Checkpoint::new(entry.epoch, tensors)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Tensor;
    use std::collections::HashMap;

    fn checkpoint(epoch: usize, value: f32) -> Result<Checkpoint> {
        let mut tensors = HashMap::new();
        tensors.insert("model.w".to_string(), Tensor::new(&[value, value], &Device::Cpu)?);
        Ok(Checkpoint::new(epoch, tensors))
    }

    #[test]
    fn save_indices_are_monotonic_and_latest_wins() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| TrainError::storage("tempdir", e))?;
        let mut store = FileCheckpointStore::open(dir.path(), "ckpt")?;
        assert!(store.latest(&Device::Cpu)?.is_none());

        let first = store.save(&checkpoint(2, 1.0)?)?;
        let second = store.save(&checkpoint(4, 2.0)?)?;
        assert_eq!(first.save_index, 1);
        assert_eq!(second.save_index, 2);
        assert_eq!(second.location, "ckpt-2.safetensors");

        let latest = store.latest(&Device::Cpu)?.expect("latest checkpoint");
        assert_eq!(latest.epoch(), 4);
        let w = latest.get("model.w").expect("w").to_vec1::<f32>()?;
        assert_eq!(w, vec![2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn index_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| TrainError::storage("tempdir", e))?;
        {
            let mut store = FileCheckpointStore::open(dir.path(), "ckpt")?;
            store.save(&checkpoint(1, 1.0)?)?;
        }
        let mut store = FileCheckpointStore::open(dir.path(), "ckpt")?;
        assert_eq!(store.entries().len(), 1);
        let saved = store.save(&checkpoint(2, 1.0)?)?;
        assert_eq!(saved.save_index, 2);
        assert!(!dir.path().join("ckpt-2.safetensors.tmp").exists());
        Ok(())
    }

    #[test]
    fn keep_last_prunes_old_files() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| TrainError::storage("tempdir", e))?;
        let mut store = FileCheckpointStore::open(dir.path(), "ckpt")?.keep_last(2);
        for epoch in 1..=4 {
            store.save(&checkpoint(epoch, epoch as f32)?)?;
        }
        assert_eq!(store.entries().len(), 2);
        assert!(!dir.path().join("ckpt-1.safetensors").exists());
        assert!(!dir.path().join("ckpt-2.safetensors").exists());
        assert!(dir.path().join("ckpt-4.safetensors").exists());
        Ok(())
    }

    #[test]
    fn corrupt_index_is_a_storage_error() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| TrainError::storage("tempdir", e))?;
        fs::write(dir.path().join(INDEX_FILE), "not json").map_err(|e| TrainError::storage("index", e))?;
        let err = FileCheckpointStore::open(dir.path(), "ckpt").err().expect("open should fail");
        assert!(err.is_storage());
        Ok(())
    }

    #[test]
    fn failed_index_write_keeps_the_previous_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| TrainError::storage("tempdir", e))?;
        let mut store = FileCheckpointStore::open(dir.path(), "ckpt")?.keep_last(1);
        store.save(&checkpoint(2, 1.0)?)?;

        // A directory where the index temp file goes makes the next index write fail.
        let blocker = dir.path().join(format!("{INDEX_FILE}.tmp"));
        fs::create_dir(&blocker).map_err(|e| TrainError::storage(&blocker, e))?;
        let err = store.save(&checkpoint(4, 2.0)?).err().expect("index write should fail");
        assert!(err.is_storage());

        assert!(dir.path().join("ckpt-1.safetensors").exists());
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.latest(&Device::Cpu)?.expect("latest").epoch(), 2);

        let reopened = FileCheckpointStore::open(dir.path(), "ckpt")?;
        let latest = reopened.latest(&Device::Cpu)?.expect("latest");
        assert_eq!(latest.epoch(), 2);
        assert_eq!(latest.get("model.w").expect("w").to_vec1::<f32>()?, vec![1.0, 1.0]);
        Ok(())
    }
}
