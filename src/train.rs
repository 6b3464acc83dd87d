use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::{nn, nn::OptimizerConfig};
use tqdm::tqdm;

use crate::callbacks::Callbacks;
use crate::config::{OptimizerKind, OutputActivation, TrainConfig, VaeConfig};
use crate::data::Dataset;
use crate::error::{Result, VaeError};
use crate::loss::{pixel_accuracy, LossSummary, VaeLoss};
use crate::vae::VariationalAutoencoder;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub lr: f64,
    pub train: LossSummary,
    pub train_accuracy: f64,
    pub valid: Option<LossSummary>,
    pub valid_accuracy: Option<f64>,
}

impl EpochRecord {
    /// Validation loss when there is a validation set, training loss otherwise.
    pub fn monitored(&self) -> f64 {
        self.valid.map_or(self.train.total, |v| v.total)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
    pub stopped_early: bool,
}

impl History {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn optimizer(vs: &nn::VarStore, kind: OptimizerKind, lr: f64) -> Result<nn::Optimizer> {
    let opt = match kind {
        OptimizerKind::RmsProp => {
            nn::RmsProp { alpha: 0.9, eps: 1e-7, ..Default::default() }.build(vs, lr)?
        }
        OptimizerKind::Adam { amsgrad } => {
            nn::Adam { eps: 1e-7, amsgrad, ..Default::default() }.build(vs, lr)?
        }
    };
    Ok(opt)
}

pub struct Trainer<'a> {
    vs: &'a mut nn::VarStore,
    model: &'a dyn VariationalAutoencoder,
    loss: VaeLoss,
    config: TrainConfig,
    activation: OutputActivation,
    opt: nn::Optimizer,
    lr: f64,
}

impl<'a> Trainer<'a> {
    pub fn new(
        vs: &'a mut nn::VarStore,
        model: &'a dyn VariationalAutoencoder,
        loss: VaeLoss,
        config: &VaeConfig,
    ) -> Result<Trainer<'a>> {
        let train = config.train.clone();
        let opt = optimizer(vs, train.optimizer, train.learning_rate)?;
        Ok(Trainer {
            vs,
            model,
            loss,
            lr: train.learning_rate,
            config: train,
            activation: config.activation,
            opt,
        })
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
        self.opt.set_lr(lr);
    }

    fn train_epoch(&mut self, data: &Dataset) -> Result<(LossSummary, f64)> {
        let n = data.len() as f64;
        let mut summary = LossSummary::default();
        let mut accuracy = 0.0;
        for (xs, ys) in data.training_batches(self.config.batch_size, self.vs.device()) {
            let output = self.model.forward_t(&xs, true);
            let terms = self.loss.compute(&output, &ys);
            self.opt.backward_step(&terms.total);

            let weight = xs.size()[0] as f64 / n;
            summary.add_weighted(&terms.summary()?, weight);
            let hits = pixel_accuracy(&ys, &output.reconstruction.detach(), self.activation);
            accuracy += weight * f64::try_from(&hits)?;
        }
        Ok((summary, accuracy))
    }

    /// Loss terms and accuracy over `data` in inference mode.
    pub fn evaluate(&self, data: &Dataset) -> Result<(LossSummary, f64)> {
        let n = data.len() as f64;
        let mut summary = LossSummary::default();
        let mut accuracy = 0.0;
        for (xs, ys) in data.batches(self.config.batch_size, false, self.vs.device()) {
            let (batch, hits) = tch::no_grad(|| -> Result<(LossSummary, f64)> {
                let output = self.model.forward_t(&xs, false);
                let batch = self.loss.compute(&output, &ys).summary()?;
                let hits = f64::try_from(&pixel_accuracy(&ys, &output.reconstruction, self.activation))?;
                Ok((batch, hits))
            })?;
            let weight = xs.size()[0] as f64 / n;
            summary.add_weighted(&batch, weight);
            accuracy += weight * hits;
        }
        Ok((summary, accuracy))
    }

    pub fn fit(&mut self, train: &Dataset, valid: Option<&Dataset>) -> Result<History> {
        if train.len() < 2 {
            return Err(VaeError::EmptyDataset(format!(
                "training needs at least 2 samples for batch statistics, got {}",
                train.len()
            )));
        }
        let mut callbacks = Callbacks::from_config(&self.config);
        let mut history = History::default();
        tracing::info!(
            samples = train.len(),
            validation = valid.map_or(0, |v| v.len()),
            epochs = self.config.epochs,
            batch_size = self.config.batch_size,
            lr = self.lr,
            "training"
        );

        for epoch in tqdm(0..self.config.epochs) {
            if let Some(decay) = callbacks.step_decay {
                let lr = decay.lr(epoch, self.lr);
                if lr != self.lr {
                    tracing::info!(epoch, lr, "step decay");
                    self.set_lr(lr);
                }
            }

            let (train_loss, train_accuracy) = self.train_epoch(train)?;
            let (valid_loss, valid_accuracy) = match valid {
                Some(data) => {
                    let (loss, accuracy) = self.evaluate(data)?;
                    (Some(loss), Some(accuracy))
                }
                None => (None, None),
            };
            let record = EpochRecord {
                epoch,
                lr: self.lr,
                train: train_loss,
                train_accuracy,
                valid: valid_loss,
                valid_accuracy,
            };
            tracing::info!(
                epoch = epoch + 1,
                loss = record.train.total,
                kl = record.train.kl,
                accuracy = record.train_accuracy,
                val_loss = ?record.valid.map(|v| v.total),
                "epoch finished"
            );
            let monitored = record.monitored();
            history.epochs.push(record);

            if let Some(checkpoint) = callbacks.checkpoint.as_mut() {
                checkpoint.update(self.vs, monitored)?;
            }
            if let Some(reduce) = callbacks.reduce_lr.as_mut() {
                if let Some(lr) = reduce.update(monitored, self.lr) {
                    tracing::info!(epoch = epoch + 1, lr, "reducing learning rate");
                    self.set_lr(lr);
                }
            }
            if let Some(stop) = callbacks.early_stopping.as_mut() {
                if stop.should_stop(monitored) {
                    tracing::info!(epoch = epoch + 1, "early stopping");
                    history.stopped_early = true;
                    break;
                }
            }
        }

        if let Some(checkpoint) = &callbacks.checkpoint {
            if checkpoint.restore(self.vs)? {
                tracing::info!(loss = checkpoint.best(), "restored best weights");
            }
        }
        Ok(history)
    }
}
