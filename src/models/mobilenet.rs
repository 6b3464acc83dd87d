//! MobileNetV2 encoder (output stride 8, dilated tail) with a light transposed-conv generator.
use tch::{nn, nn::ModuleT, Tensor};

use super::GaussianHead;
use crate::config::{InputShape, VaeConfig};
use crate::layers::{batch_norm, relu6, resize, same_conv, same_conv_transpose, ConvSpec};
use crate::vae::{Posterior, VariationalAutoencoder};

const BN_MOMENTUM: f64 = 0.999;
const BN_EPS: f64 = 1e-3;
const STEM_FILTERS: i64 = 64;
const DECODER_CHANNELS: i64 = 10;

struct BlockSpec {
    filters: i64,
    stride: i64,
    expansion: i64,
    rate: i64,
    skip: bool,
}

const fn block(filters: i64, stride: i64, expansion: i64, rate: i64, skip: bool) -> BlockSpec {
    BlockSpec { filters, stride, expansion, rate, skip }
}

const BLOCKS: [BlockSpec; 17] = [
    block(16, 1, 1, 1, false),
    block(24, 2, 6, 1, false),
    block(24, 1, 6, 1, true),
    block(32, 2, 6, 1, false),
    block(32, 1, 6, 1, true),
    block(32, 1, 6, 1, true),
    block(64, 1, 6, 1, false),
    block(64, 1, 6, 2, true),
    block(64, 1, 6, 2, true),
    block(64, 1, 6, 2, true),
    block(96, 1, 6, 2, false),
    block(96, 1, 6, 2, true),
    block(96, 1, 6, 2, true),
    block(160, 1, 6, 2, false),
    block(160, 1, 6, 4, true),
    block(160, 1, 6, 4, true),
    block(320, 1, 6, 4, false),
];

/// Rounds `v` to a multiple of `divisor` without dropping more than 10%.
pub fn make_divisible(v: f64, divisor: i64) -> i64 {
    let rounded = divisor.max((v + divisor as f64 / 2.0) as i64 / divisor * divisor);
    if (rounded as f64) < 0.9 * v {
        rounded + divisor
    } else {
        rounded
    }
}

fn bn(p: nn::Path, channels: i64) -> nn::BatchNorm {
    batch_norm(p, 2, channels, BN_MOMENTUM, BN_EPS)
}

#[derive(Debug)]
struct InvertedResidual {
    net: nn::SequentialT,
    skip: bool,
}

impl InvertedResidual {
    fn new(p: nn::Path, c_in: i64, spec: &BlockSpec, alpha: f64, expand: bool) -> (InvertedResidual, i64) {
        let c_out = make_divisible(spec.filters as f64 * alpha, 8);
        let mut net = nn::seq_t();
        let mut width = c_in;
        if expand {
            width = spec.expansion * c_in;
            net = net
                .add(same_conv(&p / "expand", c_in, width, ConvSpec::cube(2, 1).no_bias()))
                .add(bn(&p / "expand_BN", width))
                .add_fn(relu6);
        }
        let depthwise = ConvSpec::cube(2, 3)
            .uniform_stride(spec.stride)
            .dilation(spec.rate)
            .groups(width)
            .no_bias();
        let net = net
            .add(same_conv(&p / "depthwise", width, width, depthwise))
            .add(bn(&p / "depthwise_BN", width))
            .add_fn(relu6)
            .add(same_conv(&p / "project", width, c_out, ConvSpec::cube(2, 1).no_bias()))
            .add(bn(&p / "project_BN", c_out));
        (InvertedResidual { net, skip: spec.skip && c_in == c_out && spec.stride == 1 }, c_out)
    }
}

impl ModuleT for InvertedResidual {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = self.net.forward_t(xs, train);
        if self.skip {
            ys + xs
        } else {
            ys
        }
    }
}

#[derive(Debug)]
pub struct MobileNetVae {
    encoder: nn::SequentialT,
    head: GaussianHead,
    decoder: nn::SequentialT,
    input_shape: InputShape,
    latent_dim: i64,
}

impl MobileNetVae {
    pub fn new(path: nn::Path, config: &VaeConfig) -> MobileNetVae {
        let alpha = 1.0;
        let activation = config.activation;
        let input = config.input_shape.clone();

        let enc = &path / "encoder";
        let mut encoder = nn::seq_t()
            .add(same_conv(
                &enc / "Conv",
                input.channels,
                STEM_FILTERS,
                ConvSpec::cube(2, 3).uniform_stride(2).no_bias(),
            ))
            .add(bn(&enc / "Conv_BN", STEM_FILTERS))
            .add_fn(relu6);
        let mut c_in = STEM_FILTERS;
        for (i, spec) in BLOCKS.iter().enumerate() {
            let (block, c_out) = InvertedResidual::new(&enc / format!("block_{i}"), c_in, spec, alpha, i > 0);
            encoder = encoder.add(block);
            c_in = c_out;
        }
        let encoder = encoder.add_fn(|xs| xs.adaptive_avg_pool2d([1, 1]).flat_view());
        let head = GaussianHead::new(&path / "head", c_in, config.latent_dim);

        let dec = &path / "generator";
        let grid = [(input.spatial[0] + 3) / 4, (input.spatial[1] + 3) / 4];
        let start = [-1, DECODER_CHANNELS, grid[0], grid[1]];
        let size = [input.spatial[0], input.spatial[1]];
        let decoder = nn::seq_t()
            .add(nn::linear(
                &dec / "Dense_grid",
                config.latent_dim,
                DECODER_CHANNELS * grid[0] * grid[1],
                Default::default(),
            ))
            .add_fn(move |xs| xs.reshape(start))
            .add(same_conv_transpose(&dec / "ConvTranspose2d_1", DECODER_CHANNELS, 16, ConvSpec::cube(2, 3)))
            .add_fn(|xs| xs.relu())
            .add(same_conv_transpose(&dec / "ConvTranspose2d_2", 16, 32, ConvSpec::cube(2, 3).uniform_stride(2)))
            .add_fn(|xs| xs.relu())
            .add(same_conv_transpose(&dec / "ConvTranspose2d_3", 32, 32, ConvSpec::cube(2, 2).uniform_stride(2)))
            .add_fn(|xs| xs.relu())
            .add_fn(move |xs| resize(xs, &size))
            .add(same_conv(&dec / "Conv2d_out", 32, input.channels, ConvSpec::cube(2, 3)))
            .add_fn(move |xs| activation.apply(xs));

        MobileNetVae { encoder, head, decoder, input_shape: input, latent_dim: config.latent_dim }
    }
}

impl VariationalAutoencoder for MobileNetVae {
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
        let mut config = VaeConfig::for_variant(Variant::Mobilenet).with_input_shape(InputShape::new(1, &[24, 20]));
        config.latent_dim = 8;
        config
    }

    #[test]
    fn divisible_widths() {
        assert_eq!(make_divisible(16.0, 8), 16);
        assert_eq!(make_divisible(20.0, 8), 24);
        assert_eq!(make_divisible(3.0, 8), 8);
        assert_eq!(make_divisible(90.0, 8), 88);
        assert_eq!(make_divisible(76.0, 8), 80);
    }

    #[test]
    fn residual_keeps_shape() {
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let (block, c_out) = InvertedResidual::new(vs.root(), 24, &BLOCKS[2], 1.0, true);
        assert_eq!(c_out, 24);
        assert!(block.skip);
        let xs = Tensor::rand([2, 24, 6, 6], tch::kind::FLOAT_CPU);
        assert_eq!(block.forward_t(&xs, true).size(), [2, 24, 6, 6]);
    }

    #[test]
    fn encoder_has_output_stride_eight() {
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let model = MobileNetVae::new(vs.root(), &small());
        let xs = Tensor::rand([2, 1, 24, 20], tch::kind::FLOAT_CPU);
        let features = model.encoder.forward_t(&xs, false);
        assert_eq!(features.size(), [2, 320]);
    }

    #[test]
    fn shapes_and_sharing() {
        let (vs, model) = testing::check_shapes(&small(), 2);
        testing::check_weight_sharing(&vs, model.as_ref());
    }
}
