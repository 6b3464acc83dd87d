//! The composite VAE objective: weighted reconstruction, KL to the prior and,
//! for 2D models trained against a reference texture, style and
//! total-variation penalties on the reconstruction.
use serde::{Deserialize, Serialize};
use tch::{Kind, Reduction, Tensor};

use crate::config::{OutputActivation, ReconstructionKind, VaeConfig};
use crate::error::Result;
use crate::style::StyleLoss;
use crate::vae::VaeOutput;

const BCE_EPSILON: f64 = 1e-7;

/// Element-wise reconstruction error averaged over every element, times `weight`.
pub fn reconstruction_loss(kind: ReconstructionKind, recon: &Tensor, target: &Tensor, weight: f64) -> Tensor {
    let loss = match kind {
        ReconstructionKind::Bce => recon
            .clamp(BCE_EPSILON, 1.0 - BCE_EPSILON)
            .binary_cross_entropy::<Tensor>(target, None, Reduction::Mean),
        ReconstructionKind::Mse => recon.mse_loss(target, Reduction::Mean),
        ReconstructionKind::Mae => recon.l1_loss(target, Reduction::Mean),
    };
    loss * weight
}

/// KL divergence of `N(mean, exp(logvar))` to the standard normal, summed over
/// the latent axis, averaged over the batch and multiplied by `weight`.
pub fn kl_normal(mean: &Tensor, logvar: &Tensor, weight: f64) -> Tensor {
    let per_dim: Tensor = -0.5 * (1i64 + logvar - mean.square() - logvar.exp());
    per_dim.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float).mean(Kind::Float) * weight
}

/// Sum of absolute differences between neighbouring pixels of `[B, C, H, W]` images.
pub fn total_variation(images: &Tensor) -> Tensor {
    let size = images.size();
    let (h, w) = (size[2], size[3]);
    let dh = images.narrow(2, 1, h - 1) - images.narrow(2, 0, h - 1);
    let dw = images.narrow(3, 1, w - 1) - images.narrow(3, 0, w - 1);
    dh.abs().sum(Kind::Float) + dw.abs().sum(Kind::Float)
}

/// Agreement between prediction and target.
///
/// Multi-channel samples are compared by their argmax over channels, single
/// channel samples by thresholding at the activation's midpoint.
pub fn pixel_accuracy(target: &Tensor, recon: &Tensor, activation: OutputActivation) -> Tensor {
    let hits = if target.size()[1] > 1 {
        target.argmax(1, false).eq_tensor(&recon.argmax(1, false))
    } else {
        let threshold = activation.threshold();
        target.gt(threshold).eq_tensor(&recon.gt(threshold))
    };
    hits.to_kind(Kind::Float).mean(Kind::Float)
}

/// Weighted terms of one evaluation. `total` is what gets differentiated.
#[derive(Debug)]
pub struct ElboTerms {
    pub reconstruction: Tensor,
    pub kl: Tensor,
    pub style: Option<Tensor>,
    pub tv: Option<Tensor>,
    pub total: Tensor,
}

impl ElboTerms {
    pub fn summary(&self) -> Result<LossSummary> {
        let scalar = |t: &Option<Tensor>| -> Result<f64> {
            match t {
                Some(t) => Ok(f64::try_from(t)?),
                None => Ok(0.0),
            }
        };
        Ok(LossSummary {
            reconstruction: f64::try_from(&self.reconstruction)?,
            kl: f64::try_from(&self.kl)?,
            style: scalar(&self.style)?,
            tv: scalar(&self.tv)?,
            total: f64::try_from(&self.total)?,
        })
    }
}

/// Plain numbers for logging and the training history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossSummary {
    pub reconstruction: f64,
    pub kl: f64,
    pub style: f64,
    pub tv: f64,
    pub total: f64,
}

impl LossSummary {
    pub fn add_weighted(&mut self, other: &LossSummary, weight: f64) {
        self.reconstruction += weight * other.reconstruction;
        self.kl += weight * other.kl;
        self.style += weight * other.style;
        self.tv += weight * other.tv;
        self.total += weight * other.total;
    }
}

#[derive(Debug)]
pub struct VaeLoss {
    kind: ReconstructionKind,
    reconstruction_weight: f64,
    kl_weight: f64,
    style: Option<(StyleLoss, f64, f64)>,
}

impl VaeLoss {
    /// `style` is only used when the config carries a style section.
    pub fn new(config: &VaeConfig, style: Option<StyleLoss>) -> VaeLoss {
        let style = match (style, &config.loss.style) {
            (Some(loss), Some(c)) => Some((loss, c.style_weight, c.tv_weight)),
            _ => None,
        };
        VaeLoss {
            kind: config.loss.reconstruction,
            reconstruction_weight: config.reconstruction_weight(),
            kl_weight: config.loss.kl_weight,
            style,
        }
    }

    pub fn compute(&self, output: &VaeOutput, target: &Tensor) -> ElboTerms {
        let reconstruction =
            reconstruction_loss(self.kind, &output.reconstruction, target, self.reconstruction_weight);
        let kl = kl_normal(&output.posterior.mean, &output.posterior.logvar, self.kl_weight);
        let mut total = &reconstruction + &kl;
        let (mut style, mut tv) = (None, None);
        if let Some((loss, style_weight, tv_weight)) = &self.style {
            let s = loss.loss(&output.reconstruction) * *style_weight;
            let t = total_variation(&output.reconstruction) * *tv_weight;
            total = total + &s + &t;
            style = Some(s);
            tv = Some(t);
        }
        ElboTerms { reconstruction, kl, style, tv, total }
    }
}
