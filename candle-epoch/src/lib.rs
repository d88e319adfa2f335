//! Epoch-based supervised training for Candle.
//!
//! A [`Trainer`] drives a [`TrainingSession`] (model, optimizer and metric accumulators)
//! through train and eval passes, reports per-epoch metrics to [`Callback`]s, and saves
//! [`Checkpoint`]s on a fixed [`CheckpointCadence`].

pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod metrics;
pub mod module;
pub mod optim;
pub mod session;
pub mod trainer;

pub use callbacks::{Callback, EpochMetrics, History};
pub use checkpoint::{
    Checkpoint, CheckpointCadence, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    SavedCheckpoint,
};
pub use config::TrainerConfig;
pub use data::{Batch, BatchSource, DataLoader, Remainder};
pub use error::{Result, TrainError};
pub use metrics::{Mean, Metric, MetricSet, MetricValues, SparseCategoricalAccuracy};
pub use module::{LightModule, StepOutput};
pub use optim::{Adam, OptimizerState, ParamsAdam};
pub use session::TrainingSession;
pub use trainer::{FitSummary, Phase, Trainer};

pub use candle::{Module, ModuleT};
