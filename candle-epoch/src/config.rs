//! Trainer configuration.

use crate::checkpoint::CheckpointCadence;
use crate::error::{Result, TrainError};
use candle::Device;

#[derive(Clone, Debug)]
pub struct TrainerConfig {
    /// Total number of epochs a session is trained to, counting epochs restored from a checkpoint.
    pub max_epochs: usize,
    pub device: Device,
    /// Log the running train loss every n steps; 0 disables step logging.
    pub log_every_n_steps: usize,
    pub checkpoint_cadence: CheckpointCadence,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1000,
            device: Device::Cpu,
            log_every_n_steps: 50,
            checkpoint_cadence: CheckpointCadence::Never,
        }
    }
}

impl TrainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_epochs(mut self, epochs: usize) -> Self {
        self.max_epochs = epochs;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn log_every_n_steps(mut self, n: usize) -> Self {
        self.log_every_n_steps = n;
        self
    }

    pub fn checkpoint_cadence(mut self, cadence: CheckpointCadence) -> Self {
        self.checkpoint_cadence = cadence;
        self
    }

    /// Checkpoint after every `k`th epoch. Fails for `k == 0`.
    pub fn checkpoint_every(self, k: usize) -> Result<Self> {
        let cadence = CheckpointCadence::every(k)?;
        Ok(self.checkpoint_cadence(cadence))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_epochs == 0 {
            return Err(TrainError::config("max_epochs must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() -> Result<()> {
        let config = TrainerConfig::new()
            .max_epochs(5)
            .log_every_n_steps(0)
            .checkpoint_every(2)?;
        assert_eq!(config.max_epochs, 5);
        assert_eq!(config.log_every_n_steps, 0);
        assert!(config.checkpoint_cadence.is_due(4));
        assert!(config.validate().is_ok());
        Ok(())
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(
            TrainerConfig::new().checkpoint_every(0),
            Err(TrainError::Config(_))
        ));
        assert!(TrainerConfig::new().max_epochs(0).validate().is_err());
    }
}
