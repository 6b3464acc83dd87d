//! Epoch-level training controls, all monitoring a loss that should decrease.
use std::path::PathBuf;

use tch::nn;

use crate::config::{ReduceLrConfig, TrainConfig};
use crate::error::Result;

/// Tracks the lowest value seen and how many epochs passed since.
#[derive(Debug, Clone)]
struct Plateau {
    best: f64,
    wait: usize,
    min_delta: f64,
}

impl Plateau {
    fn new() -> Plateau {
        Plateau::with_min_delta(0.0)
    }

    fn with_min_delta(min_delta: f64) -> Plateau {
        Plateau { best: f64::INFINITY, wait: 0, min_delta: min_delta.abs() }
    }

    /// Returns true when `loss` beats the best value by more than `min_delta`.
    fn observe(&mut self, loss: f64) -> bool {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            true
        } else {
            self.wait += 1;
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    plateau: Plateau,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> EarlyStopping {
        EarlyStopping { patience, plateau: Plateau::new() }
    }

    /// Returns true once `patience` epochs went by without improvement.
    pub fn should_stop(&mut self, loss: f64) -> bool {
        self.plateau.observe(loss);
        self.plateau.wait >= self.patience
    }
}

#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    config: ReduceLrConfig,
    plateau: Plateau,
}

impl ReduceLrOnPlateau {
    pub fn new(config: ReduceLrConfig) -> ReduceLrOnPlateau {
        ReduceLrOnPlateau { config, plateau: Plateau::with_min_delta(config.min_delta) }
    }

    /// The reduced learning rate, if this epoch triggers a reduction.
    pub fn update(&mut self, loss: f64, lr: f64) -> Option<f64> {
        self.plateau.observe(loss);
        if self.plateau.wait < self.config.patience || lr <= self.config.min_lr {
            return None;
        }
        self.plateau.wait = 0;
        Some((lr * self.config.factor).max(self.config.min_lr))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepDecay {
    pub drop: f64,
    pub every: usize,
}

impl StepDecay {
    pub fn new(every: usize) -> StepDecay {
        StepDecay { drop: 0.8, every }
    }

    /// Learning rate for the epoch (0-based) about to start.
    pub fn lr(&self, epoch: usize, lr: f64) -> f64 {
        if (epoch + 1) % self.every == 0 {
            lr * self.drop
        } else {
            lr
        }
    }
}

/// Writes the variables whenever the monitored loss improves.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    path: PathBuf,
    plateau: Plateau,
    saved: bool,
}

impl BestCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> BestCheckpoint {
        BestCheckpoint { path: path.into(), plateau: Plateau::new(), saved: false }
    }

    pub fn update(&mut self, vs: &nn::VarStore, loss: f64) -> Result<bool> {
        if !self.plateau.observe(loss) {
            return Ok(false);
        }
        vs.save(&self.path)?;
        self.saved = true;
        tracing::debug!(path = %self.path.display(), loss, "saved best weights");
        Ok(true)
    }

    pub fn best(&self) -> f64 {
        self.plateau.best
    }

    /// Loads the best weights back, if any were written.
    pub fn restore(&self, vs: &mut nn::VarStore) -> Result<bool> {
        if !self.saved {
            return Ok(false);
        }
        vs.load(&self.path)?;
        Ok(true)
    }
}

/// Every callback a training run uses, built from its config.
#[derive(Debug, Clone)]
pub struct Callbacks {
    pub early_stopping: Option<EarlyStopping>,
    pub reduce_lr: Option<ReduceLrOnPlateau>,
    pub step_decay: Option<StepDecay>,
    pub checkpoint: Option<BestCheckpoint>,
}

impl Callbacks {
    pub fn from_config(config: &TrainConfig) -> Callbacks {
        Callbacks {
            early_stopping: config.early_stopping_patience.map(EarlyStopping::new),
            reduce_lr: config.reduce_lr.map(ReduceLrOnPlateau::new),
            step_decay: config.step_decay_every.map(StepDecay::new),
            checkpoint: config.checkpoint.clone().map(BestCheckpoint::new),
        }
    }
}
