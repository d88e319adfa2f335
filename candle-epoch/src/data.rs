//! Batch sources: the data pipeline side of the epoch loop.

use crate::error::{Result, TrainError};
use candle::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Inputs paired with labels along the leading (example) dimension.
#[derive(Clone, Debug)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn new(inputs: Tensor, labels: Tensor) -> Result<Self> {
        let n = leading_dim(&inputs, "inputs")?;
        let m = leading_dim(&labels, "labels")?;
        if n != m {
            return Err(TrainError::data(format!(
                "batch has {n} inputs but {m} labels"
            )));
        }
        Ok(Self { inputs, labels })
    }

    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn leading_dim(t: &Tensor, what: &str) -> Result<usize> {
    t.dims()
        .first()
        .copied()
        .ok_or_else(|| TrainError::data(format!("{what} must have an example dimension, got a scalar")))
}

/// An ordered, finite, restartable sequence of batches.
///
/// Every call to [`batches`](Self::batches) starts a new pass over the split.
pub trait BatchSource {
    type Batch;

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Self::Batch>> + '_>;
}

impl<B: Clone> BatchSource for Vec<B> {
    type Batch = B;

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<B>> + '_> {
        Box::new(self.iter().cloned().map(Ok::<B, TrainError>))
    }
}

impl<S: BatchSource + ?Sized> BatchSource for &mut S {
    type Batch = S::Batch;

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Self::Batch>> + '_> {
        (**self).batches()
    }
}

/// What to do with a final batch smaller than the batch size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Remainder {
    #[default]
    Keep,
    Drop,
}

/// Slices in-memory tensors into fixed-size batches, optionally reshuffled every pass.
pub struct DataLoader {
    inputs: Tensor,
    labels: Tensor,
    batch_size: usize,
    shuffle: bool,
    remainder: Remainder,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(inputs: Tensor, labels: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainError::config("batch_size must be at least 1"));
        }
        let Batch { inputs, labels } = Batch::new(inputs, labels)?;
        Ok(Self {
            inputs,
            labels,
            batch_size,
            shuffle: false,
            remainder: Remainder::Keep,
            rng: StdRng::from_os_rng(),
        })
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Fixes the shuffle order sequence, for reproducible runs.
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn remainder(mut self, remainder: Remainder) -> Self {
        self.remainder = remainder;
        self
    }

    pub fn num_examples(&self) -> usize {
        self.inputs.dims()[0]
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches yielded by one pass.
    pub fn num_batches(&self) -> usize {
        let n = self.num_examples();
        match self.remainder {
            Remainder::Drop => n / self.batch_size,
            Remainder::Keep => n.div_ceil(self.batch_size),
        }
    }

    fn order(&mut self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.num_examples() as u32).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        order
    }
}

impl BatchSource for DataLoader {
    type Batch = Batch;

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let order = self.order();
        let num_batches = self.num_batches();
        let batch_size = self.batch_size;
        let inputs = &self.inputs;
        let labels = &self.labels;

        let chunks: Vec<Vec<u32>> = order
            .chunks(batch_size)
            .take(num_batches)
            .map(<[u32]>::to_vec)
            .collect();

        Box::new(chunks.into_iter().map(move |idxs| -> Result<Batch> {
            let len = idxs.len();
            let idxs = Tensor::from_vec(idxs, len, inputs.device())?;
            let inputs = inputs.index_select(&idxs, 0)?;
            let labels = labels.index_select(&idxs.to_device(labels.device())?, 0)?;
            Ok(Batch { inputs, labels })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{Device, Tensor};

    fn loader(n: usize, batch_size: usize) -> Result<DataLoader> {
        let dev = Device::Cpu;
        let inputs = Tensor::arange(0f32, n as f32, &dev)?.reshape((n, 1))?;
        let labels = Tensor::arange(0u32, n as u32, &dev)?;
        DataLoader::new(inputs, labels, batch_size)
    }

    #[test]
    fn drop_remainder_floors() -> Result<()> {
        let mut dl = loader(23, 5)?.remainder(Remainder::Drop);
        assert_eq!(dl.num_batches(), 4);
        let sizes = dl.batches().map(|b| b.map(|b| b.len())).collect::<Result<Vec<_>>>()?;
        assert_eq!(sizes, vec![5, 5, 5, 5]);
        Ok(())
    }

    #[test]
    fn keep_remainder_yields_short_tail() -> Result<()> {
        let mut dl = loader(23, 5)?;
        assert_eq!(dl.num_batches(), 5);
        let sizes = dl.batches().map(|b| b.map(|b| b.len())).collect::<Result<Vec<_>>>()?;
        assert_eq!(sizes, vec![5, 5, 5, 5, 3]);
        Ok(())
    }

    #[test]
    fn unshuffled_keeps_order_and_pairs() -> Result<()> {
        let mut dl = loader(6, 4)?;
        let batches = dl.batches().collect::<Result<Vec<_>>>()?;
        assert_eq!(batches[0].labels.to_vec1::<u32>()?, vec![0, 1, 2, 3]);
        assert_eq!(batches[1].labels.to_vec1::<u32>()?, vec![4, 5]);
        Ok(())
    }

    #[test]
    fn shuffled_pass_is_a_permutation() -> Result<()> {
        let mut dl = loader(20, 3)?.shuffle(true).seed(7);
        for _ in 0..2 {
            let mut seen = Vec::new();
            for batch in dl.batches() {
                let batch = batch?;
                let xs = batch.inputs.flatten_all()?.to_vec1::<f32>()?;
                let ys = batch.labels.to_vec1::<u32>()?;
                for (x, y) in xs.iter().zip(&ys) {
                    assert_eq!(*x as u32, *y);
                }
                seen.extend(ys);
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..20).collect::<Vec<u32>>());
        }
        Ok(())
    }

    #[test]
    fn mismatched_lengths_are_data_errors() -> Result<()> {
        let dev = Device::Cpu;
        let inputs = Tensor::zeros((4, 2), candle::DType::F32, &dev)?;
        let labels = Tensor::zeros(3, candle::DType::U32, &dev)?;
        let err = DataLoader::new(inputs, labels, 2).err().expect("mismatch");
        assert!(err.is_data());
        Ok(())
    }

    #[test]
    fn zero_batch_size_is_config_error() -> Result<()> {
        assert!(matches!(loader(4, 0), Err(TrainError::Config(_))));
        Ok(())
    }

    #[test]
    fn vec_source_restarts() -> Result<()> {
        let mut v = vec![1, 2, 3];
        let first = v.batches().collect::<Result<Vec<_>>>()?;
        let second = v.batches().collect::<Result<Vec<_>>>()?;
        assert_eq!(first, second);
        Ok(())
    }
}
