use tch::{nn, nn::ModuleT, Tensor};

use super::GaussianHead;
use crate::config::{InputShape, VaeConfig};
use crate::layers::{batch_norm, resize, same_conv, same_conv_transpose, upsample_nearest, ConvSpec};
use crate::vae::{Posterior, VariationalAutoencoder};

const BRANCH_KERNELS: [i64; 4] = [1, 3, 5, 7];

fn conv_bn_relu(p: nn::Path, c_in: i64, c_out: i64, k: i64, stride: i64, transposed: bool) -> nn::SequentialT {
    let spec = ConvSpec::cube(2, k).uniform_stride(stride);
    let seq = if transposed {
        nn::seq_t().add(same_conv_transpose(&p / "conv", c_in, c_out, spec))
    } else {
        nn::seq_t().add(same_conv(&p / "conv", c_in, c_out, spec))
    };
    seq.add(batch_norm(&p / "bn", 2, c_out, 0.99, 1e-3))
        .add_fn(|xs| xs.relu())
}

/// Bottleneck followed by 1/3/5/7 branches, summed with two max-pools of the input.
#[derive(Debug)]
struct InceptionBlock {
    bottleneck: nn::SequentialT,
    branches: Vec<nn::SequentialT>,
}

impl InceptionBlock {
    fn new(p: nn::Path, channels: i64, transposed: bool) -> InceptionBlock {
        let narrow = channels / 2;
        let bottleneck = conv_bn_relu(&p / "bottleneck", channels, narrow, 1, 1, transposed);
        let branches = BRANCH_KERNELS
            .iter()
            .map(|&k| conv_bn_relu(&p / format!("branch_{k}x{k}"), narrow, channels, k, 1, transposed))
            .collect();
        InceptionBlock { bottleneck, branches }
    }
}

impl ModuleT for InceptionBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let squeezed = self.bottleneck.forward_t(xs, train);
        let pool3 = xs.max_pool2d([3, 3], [1, 1], [1, 1], [1, 1], false);
        let pool5 = xs.max_pool2d([5, 5], [1, 1], [2, 2], [1, 1], false);
        self.branches
            .iter()
            .fold(pool3 + pool5, |acc, branch| acc + branch.forward_t(&squeezed, train))
    }
}

#[derive(Debug)]
pub struct InceptionVae {
    encoder: nn::SequentialT,
    head: GaussianHead,
    decoder: nn::SequentialT,
    input_shape: InputShape,
    latent_dim: i64,
}

impl InceptionVae {
    pub fn new(path: nn::Path, config: &VaeConfig) -> InceptionVae {
        let k = config.base_width;
        let dropout = config.dropout;
        let activation = config.activation;
        let input = config.input_shape.clone();

        let enc = &path / "encoder";
        let mut encoder = nn::seq_t()
            .add(same_conv(&enc / "stem", input.channels, k, ConvSpec::cube(2, 1)))
            .add(InceptionBlock::new(&enc / "stage_1", k, false));
        let mut width = k;
        for (i, pool) in [2, 2, 4].into_iter().enumerate() {
            encoder = encoder
                .add_fn(move |xs| xs.avg_pool2d_default(pool))
                .add(conv_bn_relu(&enc / format!("down_{}", i + 1), width, width * 2, 1, 1, false))
                .add(InceptionBlock::new(&enc / format!("stage_{}", i + 2), width * 2, false));
            width *= 2;
        }
        let encoder = encoder
            .add_fn(|xs| xs.adaptive_avg_pool2d([1, 1]).flat_view())
            .add_fn_t(move |xs, train| xs.dropout(dropout, train));
        let head = GaussianHead::new(&path / "head", width, config.latent_dim);

        let dec = &path / "generator";
        let seed = [(input.spatial[0] + 15) / 16, (input.spatial[1] + 15) / 16];
        let mut decoder = nn::seq_t()
            .add(nn::linear(&dec / "Dense_seed", config.latent_dim, width, Default::default()))
            .add_fn_t(move |xs, train| xs.dropout(dropout, train))
            .add_fn(move |xs| upsample_nearest(&xs.view([-1, width, 1, 1]), &seed))
            .add(InceptionBlock::new(&dec / "stage_1", width, true));
        for (i, stride) in [4, 2, 2].into_iter().enumerate() {
            decoder = decoder
                .add(conv_bn_relu(&dec / format!("up_{}", i + 1), width, width / 2, stride, stride, true))
                .add(InceptionBlock::new(&dec / format!("stage_{}", i + 2), width / 2, true));
            width /= 2;
        }
        let size = [input.spatial[0], input.spatial[1]];
        let decoder = decoder
            .add_fn(move |xs| resize(xs, &size))
            .add(same_conv_transpose(&dec / "out", width, input.channels, ConvSpec::cube(2, 1)))
            .add_fn(move |xs| activation.apply(xs));

        InceptionVae { encoder, head, decoder, input_shape: input, latent_dim: config.latent_dim }
    }
}

impl VariationalAutoencoder for InceptionVae {
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
