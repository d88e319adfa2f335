#![allow(dead_code)]

use anyhow::Result;
use candle::{Device, Tensor, Var};
use candle_epoch::{LightModule, StepOutput};
use candle_nn::{Linear, Module};

#[derive(Clone)]
pub struct Batch {
    pub xs: Tensor,
    pub ys: Tensor,
}

pub struct LinearModel {
    linear: Linear,
    pub w: Var,
    pub b: Var,
}

impl LinearModel {
    pub fn new(device: &Device) -> Result<Self> {
        Self::with_weights(&[[0f32, 0.]], 0., device)
    }

    pub fn with_weights(w: &[[f32; 2]; 1], b: f32, device: &Device) -> Result<Self> {
        let w = Var::new(w, device)?;
        let b = Var::new(b, device)?;
        let linear = Linear::new(w.as_tensor().clone(), Some(b.as_tensor().clone()));
        Ok(Self { linear, w, b })
    }

    fn loss(&self, batch: &Batch) -> candle::Result<Tensor> {
        let ys = self.linear.forward(&batch.xs)?;
        ys.sub(&batch.ys)?.sqr()?.sum_all()
    }
}

impl LightModule for LinearModel {
    type Batch = Batch;

    fn training_step(&mut self, batch: Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        Ok(StepOutput::new(self.loss(&batch)?))
    }

    fn validation_step(&self, batch: Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        Ok(StepOutput::new(self.loss(&batch)?))
    }

    fn parameters(&self) -> Vec<Var> {
        vec![self.w.clone(), self.b.clone()]
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![("w".to_string(), self.w.clone()), ("b".to_string(), self.b.clone())]
    }
}

/// Samples of y = 3x + z - 2.
pub fn linear_samples(device: &Device) -> Result<(Tensor, Tensor)> {
    let w_gen = Tensor::new(&[[3f32, 1.]], device)?;
    let b_gen = Tensor::new(-2f32, device)?;
    let gen = Linear::new(w_gen, Some(b_gen));
    let sample_xs = Tensor::new(&[[2f32, 1.], [7., 4.], [-4., 12.], [5., 8.]], device)?;
    let sample_ys = gen.forward(&sample_xs)?;
    Ok((sample_xs, sample_ys))
}

pub fn linear_batch(device: &Device) -> Result<Vec<Batch>> {
    let (xs, ys) = linear_samples(device)?;
    Ok(vec![Batch { xs, ys }])
}

/// The same samples split into two batches of two.
pub fn linear_halves(device: &Device) -> Result<Vec<Batch>> {
    let (xs, ys) = linear_samples(device)?;
    Ok(vec![
        Batch {
            xs: xs.narrow(0, 0, 2)?,
            ys: ys.narrow(0, 0, 2)?,
        },
        Batch {
            xs: xs.narrow(0, 2, 2)?,
            ys: ys.narrow(0, 2, 2)?,
        },
    ])
}

pub fn values(var: &Var) -> Result<Vec<f32>> {
    Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?)
}
