//! Training loop implementation.

use crate::callbacks::EpochMetrics;
use crate::checkpoint::{CheckpointCadence, CheckpointStore, SavedCheckpoint};
use crate::data::BatchSource;
use crate::error::{Result, TrainError};
use crate::metrics::{MetricSet, MetricValues};
use crate::optim::OptimizerState;
use crate::session::TrainingSession;
use crate::{Callback, LightModule, StepOutput, TrainerConfig};
use candle_nn::Optimizer;

/// Where the epoch loop currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Training,
    Evaluating,
    Reporting,
    Checkpointing,
    Terminal,
}

/// What a call to [`Trainer::fit`] did.
#[derive(Clone, Debug, Default)]
pub struct FitSummary {
    pub history: Vec<EpochMetrics>,
    pub checkpoints: Vec<SavedCheckpoint>,
    pub train_steps: usize,
}

impl FitSummary {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.history.last()
    }
}

pub struct Trainer {
    config: TrainerConfig,
    callbacks: Vec<Box<dyn Callback>>,
    checkpoint_store: Option<Box<dyn CheckpointStore>>,
    phase: Phase,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            callbacks: Vec::new(),
            checkpoint_store: None,
            phase: Phase::Idle,
        }
    }

    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Where checkpoints go when the configured cadence says one is due.
    pub fn with_checkpoint_store(mut self, store: impl CheckpointStore + 'static) -> Self {
        self.checkpoint_store = Some(Box::new(store));
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn checkpoint_store(&self) -> Option<&dyn CheckpointStore> {
        self.checkpoint_store.as_deref()
    }

    /// Restores the newest checkpoint of the configured store onto the configured device.
    pub fn restore_latest<M, O>(&self, session: &mut TrainingSession<M, O>) -> Result<Option<usize>>
    where
        M: LightModule,
        O: OptimizerState,
    {
        match self.checkpoint_store.as_deref() {
            Some(store) => session.restore_latest(store, &self.config.device),
            None => Ok(None),
        }
    }

    /// Trains `session` until it has completed `max_epochs` epochs.
    ///
    /// Each epoch makes one pass over `train_data` with train steps, one pass over
    /// `val_data` (if any) with eval steps, reports, and checkpoints when due. Metrics are
    /// reset at the start of the call and after every epoch. Any error aborts the loop.
    pub fn fit<M, O, S>(
        &mut self,
        session: &mut TrainingSession<M, O>,
        mut train_data: S,
        mut val_data: Option<S>,
    ) -> Result<FitSummary>
    where
        M: LightModule,
        O: Optimizer + OptimizerState,
        S: BatchSource<Batch = M::Batch>,
    {
        self.config.validate()?;
        if self.config.checkpoint_cadence != CheckpointCadence::Never && self.checkpoint_store.is_none() {
            tracing::warn!("checkpoint cadence is set but no checkpoint store is configured");
        }

        session.reset_metrics();
        let mut summary = FitSummary::default();
        self.notify(|cb, t| cb.on_fit_start(t))?;

        while session.epoch < self.config.max_epochs {
            let epoch = session.epoch + 1;
            self.notify(|cb, t| cb.on_epoch_start(t, epoch))?;

            self.phase = Phase::Training;
            for (batch_idx, batch) in train_data.batches().enumerate() {
                let output = self.train_step(session, batch?, batch_idx)?;
                summary.train_steps += 1;
                self.log_step(epoch, batch_idx, &session.train_metrics);
                self.notify(|cb, t| cb.on_train_batch_end(t, batch_idx, &output))?;
            }

            self.phase = Phase::Evaluating;
            if let Some(val) = val_data.as_mut() {
                for (batch_idx, batch) in val.batches().enumerate() {
                    self.eval_step(session, batch?, batch_idx)?;
                }
            }
            session.epoch = epoch;

            self.phase = Phase::Reporting;
            let metrics = EpochMetrics {
                epoch,
                train: session.train_metrics.results(),
                val: val_data.as_ref().map(|_| session.val_metrics.results()),
            };
            tracing::info!(max_epochs = self.config.max_epochs, "{metrics}");
            self.notify(|cb, t| cb.on_epoch_end(t, epoch, &metrics))?;

            self.phase = Phase::Checkpointing;
            if let Some(saved) = self.checkpoint_if_due(session, epoch)? {
                summary.checkpoints.push(saved);
            }

            summary.history.push(metrics);
            session.reset_metrics();
        }

        self.phase = Phase::Terminal;
        self.notify(|cb, t| cb.on_fit_end(t))?;
        Ok(summary)
    }

    /// One optimization step: forward and loss in the model, then backward and update.
    ///
    /// The loss must be a finite scalar; otherwise the step fails before the optimizer runs
    /// and the parameters are left as they were.
    pub fn train_step<M, O>(
        &self,
        session: &mut TrainingSession<M, O>,
        batch: M::Batch,
        batch_idx: usize,
    ) -> Result<StepOutput>
    where
        M: LightModule,
        O: Optimizer,
    {
        let output = session.model.training_step(batch, batch_idx)?;
        let loss = output.loss_value()?;
        if !loss.is_finite() {
            return Err(TrainError::Compute(candle::Error::Msg(format!(
                "non-finite loss {loss} at batch {batch_idx}"
            ))));
        }
        session.optimizer.backward_step(&output.loss)?;
        record(&mut session.train_metrics, loss, &output);
        Ok(output)
    }

    /// Forward and loss only. Never computes gradients or touches parameters.
    pub fn eval_step<M, O>(
        &self,
        session: &mut TrainingSession<M, O>,
        batch: M::Batch,
        batch_idx: usize,
    ) -> Result<StepOutput>
    where
        M: LightModule,
    {
        let output = session.model.validation_step(batch, batch_idx)?;
        let loss = output.loss_value()?;
        record(&mut session.val_metrics, loss, &output);
        Ok(output)
    }

    /// A standalone evaluation pass with its own metrics.
    pub fn validate<M, S>(&self, model: &M, mut data: S) -> Result<MetricValues>
    where
        M: LightModule,
        S: BatchSource<Batch = M::Batch>,
    {
        let mut metrics = MetricSet::new();
        for (batch_idx, batch) in data.batches().enumerate() {
            let output = model.validation_step(batch?, batch_idx)?;
            record(&mut metrics, output.loss_value()?, &output);
        }
        Ok(metrics.results())
    }

    fn checkpoint_if_due<M, O>(
        &mut self,
        session: &TrainingSession<M, O>,
        epoch: usize,
    ) -> Result<Option<SavedCheckpoint>>
    where
        M: LightModule,
        O: OptimizerState,
    {
        if !self.config.checkpoint_cadence.is_due(epoch) {
            return Ok(None);
        }
        let Some(store) = self.checkpoint_store.as_mut() else {
            return Ok(None);
        };
        let checkpoint = session.snapshot()?;
        let saved = store.save(&checkpoint)?;
        tracing::info!(
            epoch,
            save_index = saved.save_index,
            location = %saved.location,
            "saved checkpoint"
        );
        Ok(Some(saved))
    }

    fn log_step(&self, epoch: usize, batch_idx: usize, metrics: &MetricSet) {
        let n = self.config.log_every_n_steps;
        if n == 0 || (batch_idx + 1) % n != 0 {
            return;
        }
        let loss = metrics.get("loss").map_or(0.0, |m| m.result());
        tracing::info!(epoch, step = batch_idx + 1, loss, "train");
    }

    /// Runs `f` on every callback, handing each one a shared view of the trainer.
    fn notify<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn Callback, &Trainer) -> Result<()>,
    {
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let result = callbacks.iter_mut().try_for_each(|cb| f(cb.as_mut(), self));
        self.callbacks = callbacks;
        result
    }
}

fn record(metrics: &mut MetricSet, loss: f64, output: &StepOutput) {
    metrics.record("loss", loss);
    for (name, value) in &output.metrics {
        metrics.record_weighted(name, *value, output.weight(name));
    }
}
