// Trains a small convnet on MNIST, checkpointing every few epochs, then restores the
// latest checkpoint into a fresh model and evaluates it.
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{DType, Device, Tensor, Var, D};
use candle_epoch::metrics::accuracy;
use candle_epoch::{
    Adam, Batch, BatchSource, DataLoader, FileCheckpointStore, LightModule, Metric, ParamsAdam,
    SparseCategoricalAccuracy, StepOutput, Trainer, TrainerConfig, TrainingSession,
};
use candle_nn::{loss, ops, Conv2d, Dropout, Linear, ModuleT, Optimizer, VarBuilder, VarMap};
use clap::Parser;
use std::path::PathBuf;
use std::sync::PoisonError;
use tracing_subscriber::EnvFilter;

const LABELS: usize = 10;

#[derive(Parser, Debug)]
#[command(about = "Train an MNIST convnet with candle-epoch")]
struct Args {
    #[arg(long, default_value_t = 5)]
    epochs: usize,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    #[arg(long, default_value_t = 0.001)]
    learning_rate: f64,

    /// Save a checkpoint after every k-th epoch.
    #[arg(long, default_value_t = 2)]
    checkpoint_every: usize,

    #[arg(long, default_value = "training_checkpoints")]
    checkpoint_dir: PathBuf,

    /// Continue from the newest checkpoint in `checkpoint_dir`.
    #[arg(long)]
    resume: bool,

    #[arg(long, default_value_t = 50)]
    log_every_n_steps: usize,

    #[arg(long)]
    cpu: bool,
}

struct ConvNet {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
    varmap: VarMap,
}

impl ConvNet {
    fn new(dev: &Device) -> candle::Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let conv1 = candle_nn::conv2d(1, 32, 5, Default::default(), vs.pp("c1"))?;
        let conv2 = candle_nn::conv2d(32, 64, 5, Default::default(), vs.pp("c2"))?;
        let fc1 = candle_nn::linear(1024, 1024, vs.pp("fc1"))?;
        let fc2 = candle_nn::linear(1024, LABELS, vs.pp("fc2"))?;
        let dropout = Dropout::new(0.5);
        Ok(Self {
            conv1,
            conv2,
            fc1,
            fc2,
            dropout,
            varmap,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle::Result<Tensor> {
        let (b_sz, _img_dim) = xs.dims2()?;
        let xs = xs
            .reshape((b_sz, 1, 28, 28))?
            .apply(&self.conv1)?
            .max_pool2d(2)?
            .apply(&self.conv2)?
            .max_pool2d(2)?
            .flatten_from(1)?
            .apply(&self.fc1)?
            .relu()?;
        self.dropout.forward_t(&xs, train)?.apply(&self.fc2)
    }

    fn step(&self, batch: &Batch, train: bool) -> candle::Result<StepOutput> {
        let logits = self.forward_t(&batch.inputs, train)?;
        let log_sm = ops::log_softmax(&logits, D::Minus1)?;
        let loss = loss::nll(&log_sm, &batch.labels)?;
        let acc = accuracy(&logits, &batch.labels)?;
        Ok(StepOutput::new(loss).with_weighted_metric("accuracy", acc, batch.len() as f64))
    }
}

impl LightModule for ConvNet {
    type Batch = Batch;

    fn training_step(&mut self, batch: Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        self.step(&batch, true)
    }

    fn validation_step(&self, batch: Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        self.step(&batch, false)
    }

    fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    // Checkpoint keys follow the var builder paths ("c1.weight", "fc2.bias", ...).
    fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap_or_else(PoisonError::into_inner);
        let mut named: Vec<_> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }
}

fn new_session(dev: &Device, lr: f64) -> Result<TrainingSession<ConvNet, Adam>> {
    let model = ConvNet::new(dev)?;
    let params = ParamsAdam {
        lr,
        ..Default::default()
    };
    // Optimizer slots are positional, so build them in the stable name order.
    let vars = model.named_parameters().into_iter().map(|(_, var)| var).collect();
    let optimizer = Adam::new(vars, params)?;
    Ok(TrainingSession::new(model, optimizer))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let dev = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    tracing::info!(device = ?dev, "starting");

    let m = candle_datasets::vision::mnist::load()?;
    tracing::info!(train = ?m.train_images.shape(), test = ?m.test_images.shape(), "loaded mnist");

    let train_images = m.train_images.to_device(&dev)?;
    let train_labels = m.train_labels.to_dtype(DType::U32)?.to_device(&dev)?;
    let test_images = m.test_images.to_device(&dev)?;
    let test_labels = m.test_labels.to_dtype(DType::U32)?.to_device(&dev)?;

    let train = DataLoader::new(train_images, train_labels, args.batch_size)?.shuffle(true);
    let test = DataLoader::new(test_images.clone(), test_labels.clone(), args.batch_size)?;

    let config = TrainerConfig::new()
        .max_epochs(args.epochs)
        .device(dev.clone())
        .log_every_n_steps(args.log_every_n_steps)
        .checkpoint_every(args.checkpoint_every)?;
    let store = FileCheckpointStore::open(&args.checkpoint_dir, "ckpt")?;
    let mut trainer = Trainer::new(config).with_checkpoint_store(store);

    let mut session = new_session(&dev, args.learning_rate)?;
    if args.resume {
        match trainer.restore_latest(&mut session)? {
            Some(epoch) => tracing::info!(epoch, "resumed from checkpoint"),
            None => tracing::info!("no checkpoint found, starting from scratch"),
        }
    }

    trainer.fit(&mut session, train, Some(test))?;

    // Evaluate the newest checkpoint in a model that never saw training.
    let mut restored = new_session(&dev, args.learning_rate)?;
    let Some(epoch) = trainer.restore_latest(&mut restored)? else {
        tracing::warn!("no checkpoint was written, skipping restored evaluation");
        return Ok(());
    };

    let eval = DataLoader::new(test_images.clone(), test_labels.clone(), args.batch_size)?;
    let results = trainer.validate(restored.model(), eval)?;
    tracing::info!(epoch, ?results, "restored checkpoint evaluated");

    // Per-example accuracy, so the short final batch is weighted correctly.
    let mut eval_accuracy = SparseCategoricalAccuracy::new();
    let mut eval = DataLoader::new(test_images, test_labels, args.batch_size)?;
    for batch in eval.batches() {
        let batch = batch?;
        let logits = restored.model().forward_t(&batch.inputs, false)?;
        eval_accuracy.update(&logits, &batch.labels)?;
    }
    println!(
        "accuracy of the epoch {} checkpoint: {:.2}%",
        epoch,
        100.0 * eval_accuracy.compute()
    );

    Ok(())
}
