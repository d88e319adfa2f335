//! Optimizers whose internal state can be checkpointed.

use candle::backprop::GradStore;
use candle::{DType, Result, Tensor, Var};
use candle_nn::{Optimizer, SGD};
use std::collections::HashMap;

/// Exposes optimizer internals (moment estimates, step counters) as named tensors.
pub trait OptimizerState {
    fn state_tensors(&self) -> Result<HashMap<String, Tensor>>;

    /// Replaces the optimizer state. Implementations must validate every tensor before
    /// changing anything, so a failed load leaves the optimizer as it was.
    fn load_state_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()>;
}

impl OptimizerState for SGD {
    fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::new())
    }

    fn load_state_tensors(&mut self, _tensors: &HashMap<String, Tensor>) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
        }
    }
}

struct AdamSlot {
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// Adam with bias correction.
///
/// `step` computes every new parameter and moment tensor before assigning any of them,
/// so an error part-way through leaves parameters and moments untouched.
pub struct Adam {
    slots: Vec<AdamSlot>,
    step_t: usize,
    params: ParamsAdam,
}

impl Adam {
    pub fn params(&self) -> &ParamsAdam {
        &self.params
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let slots = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let m = var.zeros_like()?;
                let v = var.zeros_like()?;
                Ok(AdamSlot { var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            step_t: 0,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let t = self.step_t + 1;
        let ParamsAdam { lr, beta1, beta2, eps } = self.params;
        let scale_m = 1.0 / (1.0 - beta1.powi(t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(t as i32));

        let mut staged = Vec::with_capacity(self.slots.len());
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(g) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let m = ((&slot.m * beta1)? + (g * (1.0 - beta1))?)?;
            let v = ((&slot.v * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&m * scale_m)?;
            let v_hat = (&v * scale_v)?;
            let delta = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let theta = (slot.var.as_tensor() - (delta * lr)?)?;
            staged.push((idx, theta, m, v));
        }

        for (idx, theta, m, v) in staged {
            let slot = &mut self.slots[idx];
            slot.var.set(&theta)?;
            slot.m = m;
            slot.v = v;
        }
        self.step_t = t;
        Ok(())
    }
}

impl OptimizerState for Adam {
    fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::with_capacity(2 * self.slots.len() + 1);
        for (i, slot) in self.slots.iter().enumerate() {
            tensors.insert(format!("m.{i}"), slot.m.copy()?);
            tensors.insert(format!("v.{i}"), slot.v.copy()?);
        }
        let device = self
            .slots
            .first()
            .map_or(candle::Device::Cpu, |s| s.var.device().clone());
        tensors.insert("step".to_string(), Tensor::new(self.step_t as f64, &device)?);
        Ok(tensors)
    }

    fn load_state_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let step = tensors
            .get("step")
            .ok_or_else(|| candle::Error::Msg("missing optimizer tensor `step`".to_string()))?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;

        let mut staged = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            let m = fetch_like(tensors, &format!("m.{i}"), &slot.m)?;
            let v = fetch_like(tensors, &format!("v.{i}"), &slot.v)?;
            staged.push((m, v));
        }

        for (slot, (m, v)) in self.slots.iter_mut().zip(staged) {
            slot.m = m;
            slot.v = v;
        }
        self.step_t = step as usize;
        Ok(())
    }
}

fn fetch_like(tensors: &HashMap<String, Tensor>, name: &str, like: &Tensor) -> Result<Tensor> {
    let t = tensors
        .get(name)
        .ok_or_else(|| candle::Error::Msg(format!("missing optimizer tensor `{name}`")))?;
    if t.dims() != like.dims() {
        candle::bail!(
            "optimizer tensor `{name}` has shape {:?}, expected {:?}",
            t.dims(),
            like.dims()
        );
    }
    t.to_device(like.device())?.to_dtype(like.dtype())
}
