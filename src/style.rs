//! Gram-matrix style loss on VGG16 features.
//!
//! Layer names follow the `tch` vision VGG16 (`features.<idx>`), so the
//! pretrained `vgg16.ot` weights load directly. Only the first four blocks
//! are built.
use std::path::Path;

use tch::{nn, nn::Module, Device, Kind, Tensor};

use crate::config::{OutputActivation, StyleConfig};
use crate::error::{Result, VaeError};

/// `(features index, input channels, output channels)` of the VGG16 convolutions up to block4_conv3.
const CONVS: [(i64, i64, i64); 10] = [
    (0, 3, 64),
    (2, 64, 64),
    (5, 64, 128),
    (7, 128, 128),
    (10, 128, 256),
    (12, 256, 256),
    (14, 256, 256),
    (17, 256, 512),
    (19, 512, 512),
    (21, 512, 512),
];

/// Indices whose activations are tapped: block1_conv2, block2_conv2, block3_conv3, block4_conv3.
const TAPS: [i64; 4] = [2, 7, 14, 21];
/// Convolutions followed by a 2×2 max-pool.
const POOLS: [i64; 3] = [2, 7, 14];

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug)]
pub struct VggFeatures {
    convs: Vec<(i64, nn::Conv2D)>,
}

impl VggFeatures {
    pub fn new(p: nn::Path) -> VggFeatures {
        let features = &p / "features";
        let config = nn::ConvConfig { padding: 1, ..Default::default() };
        let convs = CONVS
            .iter()
            .map(|&(idx, c_in, c_out)| (idx, nn::conv2d(&features / idx, c_in, c_out, 3, config)))
            .collect();
        VggFeatures { convs }
    }

    /// Activations after the four tapped convolutions (relu included).
    pub fn forward(&self, xs: &Tensor) -> Vec<Tensor> {
        let mut taps = Vec::with_capacity(TAPS.len());
        let mut xs = xs.shallow_clone();
        for (idx, conv) in &self.convs {
            xs = conv.forward(&xs).relu();
            if TAPS.contains(idx) {
                taps.push(xs.shallow_clone());
            }
            if POOLS.contains(idx) {
                xs = xs.max_pool2d_default(2);
            }
        }
        taps
    }
}

/// Gray `[B, 1, H, W]` (or RGB) images to ImageNet-normalised RGB.
///
/// Pixel values are first mapped to `[0, 255]`: `127.5 + 127.5 x` for tanh
/// outputs and `255 x` otherwise.
pub fn to_rgb(images: &Tensor, activation: OutputActivation) -> Tensor {
    let pixels = match activation {
        OutputActivation::Tanh => images * 127.5 + 127.5,
        _ => images * 255.0,
    };
    let rgb = if pixels.size()[1] == 1 { pixels.repeat([1, 3, 1, 1]) } else { pixels };
    let device = rgb.device();
    let mean = Tensor::from_slice(&IMAGENET_MEAN).to_device(device).view([1, 3, 1, 1]);
    let std = Tensor::from_slice(&IMAGENET_STD).to_device(device).view([1, 3, 1, 1]);
    (rgb / 255.0 - mean) / std
}

/// `[B, C, H, W]` activations to `[B, H * W, C]`.
pub fn feature_matrix(phi: &Tensor) -> Tensor {
    phi.flatten(2, -1).transpose(1, 2)
}

/// `F^T F / (Nc * Nz)` for a `[B, Nc, Nz]` feature matrix.
pub fn gram_matrix(f: &Tensor) -> Tensor {
    let size = f.size();
    let (nc, nz) = (size[1], size[2]);
    f.transpose(1, 2).matmul(f) / (nc * nz) as f64
}

fn layer_style_loss(g: &Tensor, a: &Tensor) -> Tensor {
    let nz = g.size()[2] as f64;
    (g - a)
        .square()
        .sum_dim_intlist([-1i64, -2].as_slice(), false, Kind::Float)
        .mean(Kind::Float)
        / (nz * nz)
}

pub struct StyleLoss {
    vs: nn::VarStore,
    vgg: VggFeatures,
    targets: Vec<Tensor>,
    activation: OutputActivation,
}

impl std::fmt::Debug for StyleLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StyleLoss")
            .field("device", &self.vs.device())
            .field("targets", &self.targets.len())
            .field("activation", &self.activation)
            .finish()
    }
}

impl StyleLoss {
    /// Loads pretrained VGG16 weights and the reference image named in `config`.
    pub fn new(device: Device, config: &StyleConfig, activation: OutputActivation) -> Result<StyleLoss> {
        if !config.vgg_weights.exists() {
            return Err(VaeError::MissingVggWeights(config.vgg_weights.clone()));
        }
        if !config.reference.exists() {
            return Err(VaeError::MissingReference(config.reference.clone()));
        }
        let reference = load_reference(&config.reference)?;

        let mut vs = nn::VarStore::new(device);
        let vgg = VggFeatures::new(vs.root());
        let missing = vs.load_partial(&config.vgg_weights)?;
        if !missing.is_empty() {
            tracing::warn!(count = missing.len(), "VGG16 weights are missing some variables");
        }
        Ok(StyleLoss::from_parts(vs, vgg, &reference, activation))
    }

    /// Builds the loss from an already populated VGG trunk and a `[1, 1, H, W]`
    /// reference in `[0, 1]`.
    pub fn from_parts(
        mut vs: nn::VarStore,
        vgg: VggFeatures,
        reference: &Tensor,
        activation: OutputActivation,
    ) -> StyleLoss {
        vs.freeze();
        let reference = reference.to_device(vs.device());
        let targets = tch::no_grad(|| {
            vgg.forward(&to_rgb(&reference, OutputActivation::Sigmoid))
                .iter()
                .map(|phi| gram_matrix(&feature_matrix(phi)))
                .collect()
        });
        StyleLoss { vs, vgg, targets, activation }
    }

    pub fn loss(&self, images: &Tensor) -> Tensor {
        let layers: Vec<Tensor> = self
            .vgg
            .forward(&to_rgb(images, self.activation))
            .iter()
            .zip(&self.targets)
            .map(|(phi, a)| layer_style_loss(&gram_matrix(&feature_matrix(phi)), a))
            .collect();
        Tensor::stack(&layers, 0).sum(Kind::Float)
    }
}

/// Reads a grayscale reference: an image file or a `.npy` array in `[0, 255]`.
fn load_reference(path: &Path) -> Result<Tensor> {
    let pixels = match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => Tensor::read_npy(path)?,
        _ => tch::vision::image::load(path)?,
    };
    let pixels = pixels.to_kind(Kind::Float);
    let gray = match pixels.dim() {
        2 => pixels.unsqueeze(0),
        3 => pixels.mean_dim([0i64].as_slice(), true, Kind::Float),
        _ => return Err(VaeError::UnsupportedData(path.to_path_buf())),
    };
    Ok((gray / 255.0).unsqueeze(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StyleConfig;

    fn scalar(t: &Tensor) -> f64 {
        f64::try_from(t).unwrap()
    }

    fn random_loss(reference: &Tensor) -> StyleLoss {
        let vs = nn::VarStore::new(Device::Cpu);
        let vgg = VggFeatures::new(vs.root());
        StyleLoss::from_parts(vs, vgg, reference, OutputActivation::Sigmoid)
    }

    #[test]
    fn vgg_variable_names_match_pretrained_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _vgg = VggFeatures::new(vs.root());
        let names = vs.variables();
        assert!(names.contains_key("features.0.weight"));
        assert!(names.contains_key("features.21.bias"));
        assert_eq!(names.len(), 2 * CONVS.len());
    }

    #[test]
    fn taps_follow_vgg_blocks() {
        let vs = nn::VarStore::new(Device::Cpu);
        let vgg = VggFeatures::new(vs.root());
        let taps = vgg.forward(&Tensor::rand([2, 3, 32, 32], tch::kind::FLOAT_CPU));
        let shapes: Vec<Vec<i64>> = taps.iter().map(|t| t.size()).collect();
        assert_eq!(
            shapes,
            [vec![2, 64, 32, 32], vec![2, 128, 16, 16], vec![2, 256, 8, 8], vec![2, 512, 4, 4]]
        );
    }

    #[test]
    fn gray_becomes_normalised_rgb() {
        let white = Tensor::ones([1, 1, 1, 1], tch::kind::FLOAT_CPU);
        let rgb: Vec<f32> = Vec::try_from(to_rgb(&white, OutputActivation::Sigmoid).flatten(0, -1)).unwrap();
        for c in 0..3 {
            assert!((rgb[c] - (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]).abs() < 1e-5);
        }

        let black = Tensor::full([1, 1, 1, 1], -1.0, tch::kind::FLOAT_CPU);
        let rgb: Vec<f32> = Vec::try_from(to_rgb(&black, OutputActivation::Tanh).flatten(0, -1)).unwrap();
        assert!((rgb[0] + IMAGENET_MEAN[0] / IMAGENET_STD[0]).abs() < 1e-5);
    }

    #[test]
    fn gram_matrix_is_normalised_inner_product() {
        // One sample, two positions, two channels.
        let f = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).reshape([1, 2, 2]);
        let g: Vec<f32> = Vec::try_from(gram_matrix(&f).flatten(0, -1)).unwrap();
        assert_eq!(g, [10.0 / 4.0, 14.0 / 4.0, 14.0 / 4.0, 20.0 / 4.0]);

        let phi = Tensor::rand([3, 5, 4, 2], tch::kind::FLOAT_CPU);
        assert_eq!(feature_matrix(&phi).size(), [3, 8, 5]);
        assert_eq!(gram_matrix(&feature_matrix(&phi)).size(), [3, 5, 5]);
    }

    #[test]
    fn reference_has_no_style_loss() {
        let reference = Tensor::rand([1, 1, 24, 24], tch::kind::FLOAT_CPU);
        let loss = random_loss(&reference);
        assert!(scalar(&loss.loss(&reference)).abs() < 1e-6);

        let other = Tensor::rand([2, 1, 24, 24], tch::kind::FLOAT_CPU);
        assert!(scalar(&loss.loss(&other)) > 0.0);
    }

    #[test]
    fn style_loss_reaches_the_images() {
        let loss = random_loss(&Tensor::rand([1, 1, 16, 16], tch::kind::FLOAT_CPU));
        let images = Tensor::rand([2, 1, 16, 16], tch::kind::FLOAT_CPU).set_requires_grad(true);
        loss.loss(&images).backward();
        assert!(scalar(&images.grad().abs().sum(Kind::Float)) > 0.0);
    }

    #[test]
    fn missing_files_are_reported() {
        let config = StyleConfig::new("/nonexistent/vgg16.ot", "/nonexistent/reference.png");
        let err = StyleLoss::new(Device::Cpu, &config, OutputActivation::Sigmoid).unwrap_err();
        assert!(matches!(err, VaeError::MissingVggWeights(_)));

        let weights = std::env::temp_dir().join("dcvae_style_weights_empty.ot");
        std::fs::write(&weights, b"").unwrap();
        let config = StyleConfig::new(&weights, "/nonexistent/reference.png");
        let err = StyleLoss::new(Device::Cpu, &config, OutputActivation::Sigmoid).unwrap_err();
        assert!(matches!(err, VaeError::MissingReference(_)));
        std::fs::remove_file(weights).unwrap();
    }
}
