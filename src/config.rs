use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::error::{Result, VaeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Fully connected encoder and decoder.
    Dense,
    /// Strided convolutions with relu activations.
    Conv,
    /// Convolutions followed by batch normalization.
    ConvNorm,
    /// `conv-norm` without the hidden dense layer.
    ConvNormLite,
    /// Column kernels `(k, 1)` that only mix along the first spatial axis.
    ConvColumn,
    /// Inception blocks with average-pool downsampling.
    Inception,
    /// MobileNetV2 inverted residual blocks.
    Mobilenet,
    /// Volumetric convolutions over `[C, H, W, D]` inputs.
    Conv3d,
}

impl Variant {
    pub fn spatial_rank(&self) -> usize {
        match self {
            Variant::Conv3d => 3,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputActivation {
    Sigmoid,
    Tanh,
    Linear,
}

impl OutputActivation {
    pub fn apply(&self, xs: &Tensor) -> Tensor {
        match self {
            OutputActivation::Sigmoid => xs.sigmoid(),
            OutputActivation::Tanh => xs.tanh(),
            OutputActivation::Linear => xs.shallow_clone(),
        }
    }

    /// Decision threshold used when binarizing single channel outputs.
    pub fn threshold(&self) -> f64 {
        match self {
            OutputActivation::Tanh => 0.0,
            _ => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconstructionKind {
    Bce,
    Mse,
    Mae,
}

/// Shape of a single sample, channels first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub channels: i64,
    pub spatial: Vec<i64>,
}

impl InputShape {
    pub fn new(channels: i64, spatial: &[i64]) -> InputShape {
        InputShape { channels, spatial: spatial.to_vec() }
    }

    pub fn dims(&self) -> Vec<i64> {
        let mut dims = vec![self.channels];
        dims.extend_from_slice(&self.spatial);
        dims
    }

    pub fn batch_dims(&self, batch: i64) -> Vec<i64> {
        let mut dims = vec![batch];
        dims.extend(self.dims());
        dims
    }

    pub fn numel(&self) -> i64 {
        self.dims().iter().product()
    }

    /// Rows times columns. Volumes ignore their depth here.
    pub fn area(&self) -> i64 {
        self.spatial.iter().take(2).product()
    }

    pub fn check(&self, xs: &Tensor) -> Result<()> {
        let actual = xs.size();
        if actual.len() != self.spatial.len() + 2 || actual[1..] != self.dims()[..] {
            return Err(VaeError::Shape { expected: self.batch_dims(-1), actual });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleConfig {
    /// Pretrained VGG16 weights in the `tch` vision layout.
    pub vgg_weights: PathBuf,
    /// Image whose texture statistics the generated samples should match.
    pub reference: PathBuf,
    pub style_weight: f64,
    pub tv_weight: f64,
}

impl StyleConfig {
    pub fn new(vgg_weights: impl Into<PathBuf>, reference: impl Into<PathBuf>) -> StyleConfig {
        StyleConfig {
            vgg_weights: vgg_weights.into(),
            reference: reference.into(),
            style_weight: 0.0,
            tv_weight: 2e-2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub reconstruction: ReconstructionKind,
    /// Multiplier of the reconstruction term. `None` scales by the input area.
    pub reconstruction_weight: Option<f64>,
    pub kl_weight: f64,
    pub style: Option<StyleConfig>,
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig {
            reconstruction: ReconstructionKind::Bce,
            reconstruction_weight: None,
            kl_weight: 1.0,
            style: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum OptimizerKind {
    RmsProp,
    Adam { amsgrad: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceLrConfig {
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
    /// Smaller decreases of the monitored loss do not count as progress.
    pub min_delta: f64,
}

impl Default for ReduceLrConfig {
    fn default() -> Self {
        ReduceLrConfig { factor: 0.5, patience: 5, min_lr: 5e-7, min_delta: 1e-4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: i64,
    pub epochs: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub validation_split: Option<f64>,
    pub early_stopping_patience: Option<usize>,
    pub reduce_lr: Option<ReduceLrConfig>,
    /// Multiply the learning rate by 0.8 every this many epochs.
    pub step_decay_every: Option<usize>,
    /// Best weights are written here and restored once training ends.
    pub checkpoint: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            batch_size: 100,
            epochs: 1,
            learning_rate: 1e-3,
            optimizer: OptimizerKind::RmsProp,
            validation_split: None,
            early_stopping_patience: Some(10),
            reduce_lr: Some(ReduceLrConfig::default()),
            step_decay_every: Some(20),
            checkpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaeConfig {
    pub variant: Variant,
    pub input_shape: InputShape,
    pub latent_dim: i64,
    pub hidden_dim: i64,
    /// Widths of the stacked dense layers of the `dense` variant.
    pub dense_widths: Vec<i64>,
    pub filters: Vec<i64>,
    pub kernels: Vec<i64>,
    pub strides: Vec<i64>,
    pub dropout: f64,
    pub activation: OutputActivation,
    /// Weight of the running statistics, not of the new batch.
    pub batch_norm_momentum: f64,
    /// Channel width of the first inception stage.
    pub base_width: i64,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub train: TrainConfig,
}

impl VaeConfig {
    pub fn for_variant(variant: Variant) -> VaeConfig {
        let input_shape = match variant {
            Variant::Inception | Variant::Mobilenet => InputShape::new(2, &[100, 100]),
            Variant::Conv3d => InputShape::new(3, &[100, 100, 10]),
            _ => InputShape::new(2, &[45, 45]),
        };
        let mut config = VaeConfig {
            variant,
            input_shape,
            latent_dim: 200,
            hidden_dim: 1024,
            dense_widths: vec![4096, 2048],
            filters: vec![2, 64, 64, 64],
            kernels: vec![2, 2, 3, 3],
            strides: vec![1, 2, 1, 1],
            dropout: 0.0,
            activation: OutputActivation::Sigmoid,
            batch_norm_momentum: 0.99,
            base_width: 32,
            loss: LossConfig::default(),
            train: TrainConfig::default(),
        };
        match variant {
            Variant::ConvColumn => {
                config.strides = vec![1, 1, 1, 1];
                config.loss.reconstruction = ReconstructionKind::Mae;
                config.loss.reconstruction_weight = Some(1.0);
            }
            Variant::Inception => {
                config.latent_dim = 100;
                config.dropout = 0.1;
                config.train.optimizer = OptimizerKind::Adam { amsgrad: true };
                config.train.step_decay_every = None;
            }
            Variant::Mobilenet => {
                config.train.step_decay_every = Some(200);
            }
            Variant::Conv3d => {
                config.filters = vec![64, 64, 64];
                config.kernels = vec![3, 3, 3];
                config.strides = vec![2, 1, 1];
            }
            _ => {}
        }
        config
    }

    pub fn with_input_shape(mut self, input_shape: InputShape) -> VaeConfig {
        self.input_shape = input_shape;
        self
    }

    pub fn reconstruction_weight(&self) -> f64 {
        self.loss
            .reconstruction_weight
            .unwrap_or(self.input_shape.area() as f64)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(VaeError::Config(msg));

        let rank = self.variant.spatial_rank();
        if self.input_shape.spatial.len() != rank {
            return fail(format!(
                "{:?} expects {rank} spatial dims, got {:?}",
                self.variant, self.input_shape.spatial
            ));
        }
        if self.input_shape.channels <= 0 || self.input_shape.spatial.iter().any(|&d| d <= 0) {
            return fail(format!("input shape must be positive, got {:?}", self.input_shape.dims()));
        }
        if self.latent_dim <= 0 {
            return fail(format!("latent_dim must be positive, got {}", self.latent_dim));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return fail(format!("dropout must lie in [0, 1), got {}", self.dropout));
        }
        if !(0.0..1.0).contains(&self.batch_norm_momentum) {
            return fail(format!(
                "batch_norm_momentum must lie in [0, 1), got {}",
                self.batch_norm_momentum
            ));
        }

        match self.variant {
            Variant::Dense => {
                if self.hidden_dim <= 0 || self.dense_widths.iter().any(|&w| w <= 0) {
                    return fail("dense widths must be positive".to_string());
                }
            }
            Variant::Conv
            | Variant::ConvNorm
            | Variant::ConvNormLite
            | Variant::ConvColumn
            | Variant::Conv3d => {
                if self.filters.is_empty() {
                    return fail("filters must not be empty".to_string());
                }
                if self.filters.len() != self.kernels.len() || self.filters.len() != self.strides.len() {
                    return fail(format!(
                        "filters, kernels and strides must have equal lengths, got {}, {} and {}",
                        self.filters.len(),
                        self.kernels.len(),
                        self.strides.len()
                    ));
                }
                let layers = self.filters.iter().chain(&self.kernels).chain(&self.strides);
                if layers.into_iter().any(|&v| v <= 0) {
                    return fail("filters, kernels and strides must be positive".to_string());
                }
                if self.variant != Variant::ConvNormLite && self.variant != Variant::Conv3d && self.hidden_dim <= 0 {
                    return fail(format!("hidden_dim must be positive, got {}", self.hidden_dim));
                }
            }
            Variant::Inception => {
                if self.base_width < 2 {
                    return fail(format!("base_width must be at least 2, got {}", self.base_width));
                }
                if self.input_shape.spatial.iter().any(|&d| d < 16) {
                    return fail("inception inputs need at least 16 pixels per side".to_string());
                }
            }
            Variant::Mobilenet => {}
        }

        if self.variant == Variant::Conv3d {
            let last = crate::models::conv3d::encoder_grid(&self.input_shape.spatial, &self.strides);
            if last.iter().any(|&d| d <= 0) {
                return fail(format!(
                    "input {:?} is too small for the conv3d encoder",
                    self.input_shape.spatial
                ));
            }
        }

        if self.loss.reconstruction == ReconstructionKind::Bce && self.activation != OutputActivation::Sigmoid {
            return fail(format!(
                "binary cross-entropy needs a sigmoid output, got {:?}",
                self.activation
            ));
        }
        if self.loss.kl_weight < 0.0 {
            return fail(format!("kl_weight must not be negative, got {}", self.loss.kl_weight));
        }
        if self.loss.style.is_some() {
            if rank != 2 {
                return fail("the style loss is only defined for 2D inputs".to_string());
            }
            if self.input_shape.channels != 1 && self.input_shape.channels != 3 {
                return fail(format!(
                    "the style loss needs gray or RGB samples, got {} channels",
                    self.input_shape.channels
                ));
            }
        }

        let train = &self.train;
        if train.batch_size <= 0 || train.learning_rate <= 0.0 {
            return fail("batch_size and learning_rate must be positive".to_string());
        }
        if let Some(split) = train.validation_split {
            if !(split > 0.0 && split < 1.0) {
                return fail(format!("validation_split must lie in (0, 1), got {split}"));
            }
        }
        if train.step_decay_every == Some(0) {
            return fail("step_decay_every must be positive".to_string());
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<VaeConfig> {
        let config: VaeConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARIANTS: [Variant; 8] = [
        Variant::Dense,
        Variant::Conv,
        Variant::ConvNorm,
        Variant::ConvNormLite,
        Variant::ConvColumn,
        Variant::Inception,
        Variant::Mobilenet,
        Variant::Conv3d,
    ];

    #[test]
    fn defaults_are_valid() {
        for variant in VARIANTS {
            let config = VaeConfig::for_variant(variant);
            assert!(config.validate().is_ok(), "{variant:?}");
        }
    }

    #[test]
    fn reconstruction_weight_defaults_to_area() {
        let config = VaeConfig::for_variant(Variant::Conv);
        assert_eq!(config.reconstruction_weight(), 45.0 * 45.0);

        let config = VaeConfig::for_variant(Variant::Conv3d);
        assert_eq!(config.reconstruction_weight(), 100.0 * 100.0);

        let config = VaeConfig::for_variant(Variant::ConvColumn);
        assert_eq!(config.reconstruction_weight(), 1.0);
    }

    #[test]
    fn bce_needs_sigmoid() {
        let mut config = VaeConfig::for_variant(Variant::Conv);
        config.activation = OutputActivation::Tanh;
        assert!(matches!(config.validate(), Err(VaeError::Config(_))));

        config.loss.reconstruction = ReconstructionKind::Mse;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mismatched_layer_lists_are_rejected() {
        let mut config = VaeConfig::for_variant(Variant::ConvNorm);
        config.strides.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn spatial_rank_must_match_variant() {
        let config = VaeConfig::for_variant(Variant::Conv3d).with_input_shape(InputShape::new(1, &[32, 32]));
        assert!(config.validate().is_err());

        let config = VaeConfig::for_variant(Variant::Conv).with_input_shape(InputShape::new(1, &[8, 8, 8]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn style_loss_is_2d_only() {
        let mut config = VaeConfig::for_variant(Variant::Conv3d);
        config.loss.style = Some(StyleConfig::new("vgg16.ot", "reference.png"));
        assert!(config.validate().is_err());

        let mut config = VaeConfig::for_variant(Variant::Conv);
        config.loss.style = Some(StyleConfig::new("vgg16.ot", "reference.png"));
        assert!(config.validate().is_err());
        config.input_shape.channels = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tiny_volumes_are_rejected() {
        let config = VaeConfig::for_variant(Variant::Conv3d).with_input_shape(InputShape::new(1, &[4, 4, 2]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_keeps_every_field() {
        let mut config = VaeConfig::for_variant(Variant::Inception);
        config.loss.style = Some(StyleConfig::new("vgg16.ot", "reference.png"));
        config.train.checkpoint = Some(PathBuf::from("best.ot"));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"variant\":\"inception\""));
        assert!(json.contains("\"kind\":\"adam\""));
        let back: VaeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let json = r#"{
            "variant": "dense",
            "input_shape": {"channels": 1, "spatial": [28, 28]},
            "latent_dim": 2,
            "hidden_dim": 64,
            "dense_widths": [128],
            "filters": [],
            "kernels": [],
            "strides": [],
            "dropout": 0.0,
            "activation": "sigmoid",
            "batch_norm_momentum": 0.99,
            "base_width": 32
        }"#;
        let config: VaeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.train, TrainConfig::default());
        assert_eq!(config.loss, LossConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn input_shape_checks_batches() {
        let shape = InputShape::new(2, &[5, 7]);
        assert_eq!(shape.numel(), 70);
        assert!(shape.check(&Tensor::zeros([3, 2, 5, 7], tch::kind::FLOAT_CPU)).is_ok());
        assert!(shape.check(&Tensor::zeros([3, 2, 7, 5], tch::kind::FLOAT_CPU)).is_err());
        assert!(shape.check(&Tensor::zeros([2, 5, 7], tch::kind::FLOAT_CPU)).is_err());
    }
}
