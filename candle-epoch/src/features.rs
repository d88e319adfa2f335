//! Dense encodings of structured (tabular) rows.
//!
//! Categorical columns map a row to a bucket id; indicator columns one-hot that id.
//! Hashed and crossed ids are reduced modulo the bucket count in `u64`, so any bucket
//! count up to `u64::MAX` is valid for ids. Dense one-hot encodings are capped at
//! [`MAX_DENSE_ELEMENTS`].

use crate::error::{Result, TrainError};
use candle::{Device, Tensor};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Largest number of `f32` elements a dense encoding may hold.
pub const MAX_DENSE_ELEMENTS: usize = isize::MAX as usize / std::mem::size_of::<f32>();

#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl FeatureValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    fn as_key(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Str(s) => s.clone(),
        }
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

pub type Row = HashMap<String, FeatureValue>;

#[derive(Clone, Debug, PartialEq)]
pub enum CategoricalColumn {
    /// Known values map to their position; unknown values to one of `num_oov_buckets`
    /// extra buckets, or to no bucket when there are none.
    Vocabulary {
        key: String,
        vocabulary: Vec<String>,
        num_oov_buckets: u64,
    },
    HashBucket { key: String, buckets: u64 },
    /// Numeric value bucketed by sorted boundaries: `boundaries.len() + 1` buckets.
    Bucketized { key: String, boundaries: Vec<f64> },
    Crossed {
        columns: Vec<CategoricalColumn>,
        buckets: u64,
    },
}

impl CategoricalColumn {
    pub fn vocabulary(key: impl Into<String>, vocabulary: &[&str]) -> Self {
        Self::Vocabulary {
            key: key.into(),
            vocabulary: vocabulary.iter().map(|v| v.to_string()).collect(),
            num_oov_buckets: 0,
        }
    }

    pub fn hash_bucket(key: impl Into<String>, buckets: u64) -> Result<Self> {
        check_buckets(buckets)?;
        Ok(Self::HashBucket {
            key: key.into(),
            buckets,
        })
    }

    pub fn bucketized(key: impl Into<String>, boundaries: Vec<f64>) -> Result<Self> {
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TrainError::config("bucket boundaries must be strictly increasing"));
        }
        Ok(Self::Bucketized {
            key: key.into(),
            boundaries,
        })
    }

    pub fn crossed(columns: Vec<CategoricalColumn>, buckets: u64) -> Result<Self> {
        check_buckets(buckets)?;
        if columns.len() < 2 {
            return Err(TrainError::config("a crossed column needs at least two columns"));
        }
        Ok(Self::Crossed { columns, buckets })
    }

    pub fn num_buckets(&self) -> u64 {
        match self {
            Self::Vocabulary {
                vocabulary,
                num_oov_buckets,
                ..
            } => vocabulary.len() as u64 + num_oov_buckets,
            Self::HashBucket { buckets, .. } | Self::Crossed { buckets, .. } => *buckets,
            Self::Bucketized { boundaries, .. } => boundaries.len() as u64 + 1,
        }
    }

    /// The bucket of `row`, or `None` for an out-of-vocabulary value without OOV buckets.
    pub fn id(&self, row: &Row) -> Result<Option<u64>> {
        match self {
            Self::Vocabulary {
                key,
                vocabulary,
                num_oov_buckets,
            } => {
                let value = lookup(row, key)?.as_key();
                if let Some(pos) = vocabulary.iter().position(|v| *v == value) {
                    return Ok(Some(pos as u64));
                }
                if *num_oov_buckets == 0 {
                    return Ok(None);
                }
                let oov = fingerprint(&[value.as_bytes()]) % num_oov_buckets;
                Ok(Some(vocabulary.len() as u64 + oov))
            }
            Self::HashBucket { key, buckets } => {
                let value = lookup(row, key)?.as_key();
                Ok(Some(fingerprint(&[value.as_bytes()]) % buckets))
            }
            Self::Bucketized { key, boundaries } => {
                let value = lookup(row, key)?.as_f64().ok_or_else(|| {
                    TrainError::data(format!("feature `{key}` must be numeric to bucketize"))
                })?;
                Ok(Some(boundaries.partition_point(|b| *b <= value) as u64))
            }
            Self::Crossed { columns, buckets } => {
                let mut parts = Vec::with_capacity(columns.len());
                for (i, column) in columns.iter().enumerate() {
                    let Some(id) = column.id(row)? else {
                        return Ok(None);
                    };
                    let mut part = (i as u64).to_le_bytes().to_vec();
                    part.extend_from_slice(&id.to_le_bytes());
                    parts.push(part);
                }
                let parts: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
                Ok(Some(fingerprint(&parts) % buckets))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FeatureColumn {
    Numeric { key: String },
    /// One-hot encoding of a categorical column.
    Indicator(CategoricalColumn),
}

impl FeatureColumn {
    pub fn numeric(key: impl Into<String>) -> Self {
        Self::Numeric { key: key.into() }
    }

    pub fn indicator(column: CategoricalColumn) -> Self {
        Self::Indicator(column)
    }

    /// Width of this column in the dense output. Fails if the one-hot would be wider than
    /// [`MAX_DENSE_ELEMENTS`].
    pub fn width(&self) -> Result<usize> {
        match self {
            Self::Numeric { .. } => Ok(1),
            Self::Indicator(column) => {
                let buckets = column.num_buckets();
                usize::try_from(buckets)
                    .ok()
                    .filter(|&w| w <= MAX_DENSE_ELEMENTS)
                    .ok_or_else(|| {
                        TrainError::config(format!(
                            "indicator over {buckets} buckets is too wide to materialize"
                        ))
                    })
            }
        }
    }

    fn write(&self, row: &Row, out: &mut [f32]) -> Result<()> {
        match self {
            Self::Numeric { key } => {
                out[0] = lookup(row, key)?.as_f64().ok_or_else(|| {
                    TrainError::data(format!("feature `{key}` must be numeric"))
                })? as f32;
            }
            Self::Indicator(column) => {
                if let Some(id) = column.id(row)? {
                    out[id as usize] = 1.0;
                }
            }
        }
        Ok(())
    }
}

/// Encodes `rows` into a `[rows.len(), total_width]` f32 tensor, columns concatenated in order.
pub fn dense_features(columns: &[FeatureColumn], rows: &[Row], device: &Device) -> Result<Tensor> {
    let widths = columns
        .iter()
        .map(FeatureColumn::width)
        .collect::<Result<Vec<_>>>()?;
    let total = widths
        .iter()
        .try_fold(0usize, |acc, &w| acc.checked_add(w))
        .filter(|&t| t <= MAX_DENSE_ELEMENTS)
        .ok_or_else(|| TrainError::config("combined feature width is too large to materialize"))?;
    let len = rows
        .len()
        .checked_mul(total)
        .filter(|&n| n <= MAX_DENSE_ELEMENTS)
        .ok_or_else(|| {
            TrainError::config(format!(
                "{} rows of width {total} are too large to materialize",
                rows.len()
            ))
        })?;

    let mut data: Vec<f32> = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|e| TrainError::config(format!("cannot allocate {len} dense features: {e}")))?;
    data.resize(len, 0.0);
    for (row, out) in rows.iter().zip(data.chunks_mut(total.max(1))) {
        let mut offset = 0;
        for (column, width) in columns.iter().zip(&widths) {
            column.write(row, &mut out[offset..offset + width])?;
            offset += width;
        }
    }
    Ok(Tensor::from_vec(data, (rows.len(), total), device)?)
}

fn lookup<'a>(row: &'a Row, key: &str) -> Result<&'a FeatureValue> {
    row.get(key)
        .ok_or_else(|| TrainError::data(format!("row has no feature `{key}`")))
}

fn check_buckets(buckets: u64) -> Result<()> {
    if buckets == 0 {
        return Err(TrainError::config("hash bucket count must be at least 1"));
    }
    Ok(())
}

/// Stable 64-bit fingerprint of the concatenated, length-prefixed parts.
fn fingerprint(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}
