//! Volumetric VAE over `[B, C, H, W, D]` inputs.
//!
//! The first convolution keeps the depth axis (`(s, s, 1)` stride) because
//! volumes are usually much shallower than they are wide.
use tch::{nn, nn::ModuleT, Tensor};

use super::GaussianHead;
use crate::config::{InputShape, VaeConfig};
use crate::layers::{batch_norm, resize, same_conv, same_conv_transpose, ConvSpec};
use crate::vae::{Posterior, VariationalAutoencoder};

const BOTTLENECK_CHANNELS: i64 = 32;

fn layer_stride(layer: usize, s: i64) -> [i64; 3] {
    if layer == 0 {
        [s, s, 1]
    } else {
        [s, s, s]
    }
}

fn valid_conv_output(n: i64) -> i64 {
    if n < 3 {
        0
    } else {
        (n - 3) / 2 + 1
    }
}

/// Spatial size after the same-padded stack and the final valid 3×3×3/2 convolution.
///
/// A zero entry means the volume is too small for this encoder.
pub fn encoder_grid(spatial: &[i64], strides: &[i64]) -> Vec<i64> {
    let all: i64 = strides.iter().product();
    let tail: i64 = strides.iter().skip(1).product();
    spatial
        .iter()
        .enumerate()
        .map(|(axis, &n)| {
            let total = if axis < 2 { all } else { tail };
            valid_conv_output((n + total - 1) / total)
        })
        .collect()
}

#[derive(Debug)]
pub struct Conv3dVae {
    encoder: nn::SequentialT,
    head: GaussianHead,
    decoder: nn::SequentialT,
    input_shape: InputShape,
    latent_dim: i64,
}

impl Conv3dVae {
    pub fn new(path: nn::Path, config: &VaeConfig) -> Conv3dVae {
        let momentum = config.batch_norm_momentum;
        let dropout = config.dropout;
        let activation = config.activation;
        let input = config.input_shape.clone();
        let n = config.filters.len();

        let enc = &path / "encoder";
        let mut encoder = nn::seq_t();
        let mut c_in = input.channels;
        for i in 0..n {
            let spec = ConvSpec::cube(3, config.kernels[i]).stride(&layer_stride(i, config.strides[i]));
            encoder = encoder
                .add(same_conv(&enc / format!("Conv3d_{}", i + 1), c_in, config.filters[i], spec))
                .add(batch_norm(&enc / format!("batch_norm3d_{}", i + 1), 3, config.filters[i], momentum, 1e-3))
                .add_fn(|xs| xs.relu());
            c_in = config.filters[i];
        }
        let reduce = nn::ConvConfig { stride: 2, ..Default::default() };
        let encoder = encoder
            .add(nn::conv3d(&enc / "Conv3d_reduce", c_in, BOTTLENECK_CHANNELS, 3, reduce))
            .add(batch_norm(&enc / "batch_norm3d_reduce", 3, BOTTLENECK_CHANNELS, momentum, 1e-3))
            .add_fn(|xs| xs.relu())
            .add_fn(|xs| xs.flat_view())
            .add_fn_t(move |xs, train| xs.dropout(dropout, train));

        let grid = encoder_grid(&input.spatial, &config.strides);
        let flat = BOTTLENECK_CHANNELS * grid.iter().product::<i64>();
        let head = GaussianHead::new(&path / "head", flat, config.latent_dim);

        let dec = &path / "generator";
        let start = [-1, BOTTLENECK_CHANNELS, grid[0], grid[1], grid[2]];
        let mut decoder = nn::seq_t()
            .add(nn::linear(&dec / "Dense_grid", config.latent_dim, flat, Default::default()))
            .add_fn_t(move |xs, train| xs.dropout(dropout, train))
            .add_fn(move |xs| xs.reshape(start))
            .add(same_conv_transpose(
                &dec / "ConvTranspose3d_expand",
                BOTTLENECK_CHANNELS,
                BOTTLENECK_CHANNELS,
                ConvSpec::cube(3, 2).uniform_stride(2),
            ))
            .add(batch_norm(&dec / "batch_norm3d_expand", 3, BOTTLENECK_CHANNELS, momentum, 1e-3))
            .add_fn(|xs| xs.relu());
        let mut c_in = BOTTLENECK_CHANNELS;
        for i in 0..n {
            let layer = n - 1 - i;
            let spec = ConvSpec::cube(3, config.kernels[layer]).stride(&layer_stride(layer, config.strides[layer]));
            decoder = decoder
                .add(same_conv_transpose(
                    &dec / format!("ConvTranspose3d_{}", i + 1),
                    c_in,
                    config.filters[layer],
                    spec,
                ))
                .add(batch_norm(
                    &dec / format!("batch_norm3d_{}", i + 1),
                    3,
                    config.filters[layer],
                    momentum,
                    1e-3,
                ))
                .add_fn(|xs| xs.relu());
            c_in = config.filters[layer];
        }
        let size = input.spatial.clone();
        let decoder = decoder
            .add_fn(move |xs| resize(xs, &size))
            .add(same_conv(&dec / "Conv3d_out", c_in, input.channels, ConvSpec::cube(3, 3)))
            .add_fn(move |xs| activation.apply(xs));

        Conv3dVae { encoder, head, decoder, input_shape: input, latent_dim: config.latent_dim }
    }
}

impl VariationalAutoencoder for Conv3dVae {
    fn encode_t(&self, xs: &Tensor, train: bool) -> Posterior {
        self.head.forward(&self.encoder.forward_t(xs, train))
    }

    fn decode_t(&self, zs: &Tensor, train: bool) -> Tensor {
        self.decoder.forward_t(zs, train)
    }

    fn latent_dim(&self) -> i64 {
        self.latent_dim
    }

    fn input_shape(&self) -> &InputShape {
        &self.input_shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Variant;
    use crate::models::testing;

    fn small() -> VaeConfig {
        let mut config = VaeConfig::for_variant(Variant::Conv3d).with_input_shape(InputShape::new(2, &[12, 10, 6]));
        config.latent_dim = 4;
        config.filters = vec![4, 4];
        config.kernels = vec![3, 2];
        config.strides = vec![2, 1];
        config
    }

    #[test]
    fn grid_keeps_depth_on_first_layer() {
        assert_eq!(encoder_grid(&[100, 100, 10], &[2, 1, 1]), [24, 24, 4]);
        assert_eq!(encoder_grid(&[12, 10, 6], &[2, 1]), [2, 2, 2]);
        assert_eq!(encoder_grid(&[16, 16, 16], &[2, 2]), [1, 1, 3]);
        assert_eq!(encoder_grid(&[4, 4, 2], &[2, 1, 1]), [0, 0, 0]);
    }

    #[test]
    fn encoder_reaches_predicted_grid() {
        let config = small();
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let model = Conv3dVae::new(vs.root(), &config);
        let xs = Tensor::rand([3, 2, 12, 10, 6], tch::kind::FLOAT_CPU);
        assert_eq!(model.encoder.forward_t(&xs, false).size(), [3, BOTTLENECK_CHANNELS * 8]);
    }

    #[test]
    fn shapes() {
        testing::check_shapes(&small(), 2);

        let mut config = small();
        config.strides = vec![2, 2];
        config.input_shape = InputShape::new(1, &[16, 16, 16]);
        testing::check_shapes(&config, 2);
    }

    #[test]
    fn generator_shares_weights() {
        let (vs, model) = testing::check_shapes(&small(), 2);
        testing::check_weight_sharing(&vs, model.as_ref());
    }
}
