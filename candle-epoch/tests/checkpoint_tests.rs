mod common;

use anyhow::Result;
use candle::{Device, Tensor};
use candle_epoch::{
    Adam, Checkpoint, CheckpointStore, FileCheckpointStore, LightModule, MemoryCheckpointStore,
    ParamsAdam, Trainer, TrainerConfig, TrainingSession,
};
use candle_nn::Optimizer;
use common::{linear_halves, values, LinearModel};
use std::collections::HashMap;

fn adam_session(device: &Device) -> Result<TrainingSession<LinearModel, Adam>> {
    let model = LinearModel::new(device)?;
    let params = ParamsAdam {
        lr: 0.05,
        ..Default::default()
    };
    let optimizer = Adam::new(model.parameters(), params)?;
    Ok(TrainingSession::new(model, optimizer))
}

fn config(max_epochs: usize) -> Result<TrainerConfig> {
    Ok(TrainerConfig::new()
        .max_epochs(max_epochs)
        .log_every_n_steps(0)
        .checkpoint_every(2)?)
}

#[test]
fn resume_from_checkpoint_reproduces_uninterrupted_run() -> Result<()> {
    let device = Device::Cpu;

    let store = MemoryCheckpointStore::new();
    let mut full = adam_session(&device)?;
    let mut trainer = Trainer::new(config(6)?).with_checkpoint_store(store.clone());
    let uninterrupted = trainer.fit(&mut full, linear_halves(&device)?, Some(linear_halves(&device)?))?;
    assert_eq!(store.saved_epochs(), vec![2, 4, 6]);

    // Restore the epoch-2 checkpoint into a session that has never trained.
    let mut resumed = adam_session(&device)?;
    resumed.restore(&store.get(1).expect("first checkpoint"))?;
    assert_eq!(resumed.epoch(), 2);
    assert_eq!(resumed.optimizer().step_count(), 4);

    let mut trainer = Trainer::new(config(6)?);
    let continued = trainer.fit(&mut resumed, linear_halves(&device)?, Some(linear_halves(&device)?))?;

    assert_eq!(continued.history.len(), 4);
    assert_eq!(values(&resumed.model().w)?, values(&full.model().w)?);
    assert_eq!(values(&resumed.model().b)?, values(&full.model().b)?);
    assert_eq!(continued.last(), uninterrupted.last());
    Ok(())
}

#[test]
fn file_store_round_trip_through_trainer() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;

    let mut session = adam_session(&device)?;
    let store = FileCheckpointStore::open(dir.path(), "ckpt")?;
    let mut trainer = Trainer::new(config(5)?).with_checkpoint_store(store);
    let summary = trainer.fit(&mut session, linear_halves(&device)?, None)?;

    let saved: Vec<_> = summary.checkpoints.iter().map(|s| s.location.as_str()).collect();
    assert_eq!(saved, vec!["ckpt-1.safetensors", "ckpt-2.safetensors"]);
    assert!(dir.path().join("checkpoint.json").exists());

    // A new trainer over the same directory finds the epoch-4 checkpoint.
    let reopened = FileCheckpointStore::open(dir.path(), "ckpt")?;
    let trainer = Trainer::new(config(5)?).with_checkpoint_store(reopened);
    let mut restored = adam_session(&device)?;
    assert_eq!(trainer.restore_latest(&mut restored)?, Some(4));
    assert_eq!(restored.epoch(), 4);

    let checkpoint = trainer
        .checkpoint_store()
        .expect("store")
        .latest(&device)?
        .expect("latest");
    assert_eq!(
        checkpoint.get("model.w").expect("w").flatten_all()?.to_vec1::<f32>()?,
        values(&restored.model().w)?
    );
    assert!(checkpoint.get("optimizer.step").is_some());
    Ok(())
}

#[test]
fn mismatched_checkpoint_leaves_state_untouched() -> Result<()> {
    let device = Device::Cpu;
    let mut session = adam_session(&device)?;
    let mut trainer = Trainer::new(TrainerConfig::new().max_epochs(1).log_every_n_steps(0));
    trainer.fit(&mut session, linear_halves(&device)?, None)?;

    let w_before = values(&session.model().w)?;
    let b_before = values(&session.model().b)?;
    let good = session.snapshot()?;

    // Right parameter names, wrong weight shape.
    let mut tensors: HashMap<String, Tensor> = good.tensors().clone();
    tensors.insert("model.w".to_string(), Tensor::zeros((1, 3), candle::DType::F32, &device)?);
    tensors.insert("model.b".to_string(), Tensor::new(9f32, &device)?);
    let err = session.restore(&Checkpoint::new(7, tensors)).err().expect("shape mismatch");
    assert!(err.is_storage());

    // Parameters fit but optimizer state is missing.
    let mut tensors: HashMap<String, Tensor> = good.tensors().clone();
    tensors.retain(|name, _| name.starts_with("model."));
    tensors.insert("model.b".to_string(), Tensor::new(9f32, &device)?);
    let err = session.restore(&Checkpoint::new(7, tensors)).err().expect("no optimizer state");
    assert!(err.is_storage());

    assert_eq!(values(&session.model().w)?, w_before);
    assert_eq!(values(&session.model().b)?, b_before);
    assert_eq!(session.epoch(), 1);
    assert_eq!(session.optimizer().step_count(), 2);
    Ok(())
}

#[test]
fn snapshot_is_isolated_from_later_updates() -> Result<()> {
    let device = Device::Cpu;
    let mut session = adam_session(&device)?;
    let snapshot = session.snapshot()?;

    let mut trainer = Trainer::new(TrainerConfig::new().max_epochs(3).log_every_n_steps(0));
    trainer.fit(&mut session, linear_halves(&device)?, None)?;
    assert_ne!(values(&session.model().w)?, vec![0.0, 0.0]);

    let w = snapshot.get("model.w").expect("w").flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(w, vec![0.0, 0.0]);

    session.restore(&snapshot)?;
    assert_eq!(values(&session.model().w)?, vec![0.0, 0.0]);
    assert_eq!(session.epoch(), 0);
    assert_eq!(session.optimizer().step_count(), 0);
    Ok(())
}

#[test]
fn empty_store_restores_nothing() -> Result<()> {
    let device = Device::Cpu;
    let mut session = adam_session(&device)?;
    let store = MemoryCheckpointStore::new();
    assert_eq!(session.restore_latest(&store, &device)?, None);
    assert_eq!(session.epoch(), 0);
    Ok(())
}
