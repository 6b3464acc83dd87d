//! Strided convolutional encoders with a mirrored transposed-convolution generator.
//!
//! One architecture covers four variants:
//!
//! * `conv`: relu after every layer, no normalization.
//! * `conv-norm`: batch-norm between every layer and its relu.
//! * `conv-norm-lite`: `conv-norm` without the hidden dense layer.
//! * `conv-column`: `(k, 1)` kernels and `(s, 1)` strides, batch-norm on the
//!   convolutions, linear dense layers.
use tch::{nn, nn::ModuleT, Tensor};

use super::GaussianHead;
use crate::config::{InputShape, Variant, VaeConfig};
use crate::layers::{batch_norm, resize, same_conv, same_conv_transpose, ConvSpec};
use crate::vae::{Posterior, VariationalAutoencoder};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Flavor {
    column: bool,
    conv_norm: bool,
    dense_norm: bool,
    dense_relu: bool,
    hidden: bool,
}

impl Flavor {
    fn of(variant: Variant) -> Flavor {
        let plain = Flavor { column: false, conv_norm: false, dense_norm: false, dense_relu: true, hidden: true };
        match variant {
            Variant::ConvNorm => Flavor { conv_norm: true, dense_norm: true, ..plain },
            Variant::ConvNormLite => Flavor { conv_norm: true, dense_norm: true, hidden: false, ..plain },
            Variant::ConvColumn => Flavor { column: true, conv_norm: true, dense_relu: false, ..plain },
            _ => plain,
        }
    }

    fn kernel(&self, k: i64) -> ConvSpec {
        if self.column {
            ConvSpec::new(&[k, 1])
        } else {
            ConvSpec::cube(2, k)
        }
    }

    fn stride(&self, s: i64) -> [i64; 2] {
        if self.column {
            [s, 1]
        } else {
            [s, s]
        }
    }
}

/// Spatial size of the encoder's last feature map, which the generator starts from.
pub fn decoder_grid(input: &InputShape, strides: &[i64], column: bool) -> [i64; 2] {
    let total: i64 = strides.iter().product();
    let rows = (input.spatial[0] + total - 1) / total;
    let cols = if column { input.spatial[1] } else { (input.spatial[1] + total - 1) / total };
    [rows, cols]
}

fn dense(
    seq: nn::SequentialT,
    p: nn::Path,
    name: &str,
    dim_in: i64,
    dim_out: i64,
    flavor: Flavor,
    momentum: f64,
) -> nn::SequentialT {
    let mut seq = seq.add(nn::linear(&p / format!("Dense_{name}"), dim_in, dim_out, Default::default()));
    if flavor.dense_norm {
        seq = seq.add(batch_norm(&p / format!("batch_norm_{name}"), 0, dim_out, momentum, 1e-3));
    }
    if flavor.dense_relu {
        seq = seq.add_fn(|xs| xs.relu());
    }
    seq
}

#[derive(Debug)]
pub struct ConvVae {
    encoder: nn::SequentialT,
    head: GaussianHead,
    decoder: nn::SequentialT,
    input_shape: InputShape,
    latent_dim: i64,
}

impl ConvVae {
    pub fn new(path: nn::Path, config: &VaeConfig) -> ConvVae {
        let flavor = Flavor::of(config.variant);
        let momentum = config.batch_norm_momentum;
        let dropout = config.dropout;
        let activation = config.activation;
        let input = config.input_shape.clone();
        let n = config.filters.len();

        let enc = &path / "encoder";
        let mut encoder = nn::seq_t();
        let mut c_in = input.channels;
        for i in 0..n {
            let spec = flavor.kernel(config.kernels[i]).stride(&flavor.stride(config.strides[i]));
            encoder = encoder.add(same_conv(&enc / format!("Conv2d_{}", i + 1), c_in, config.filters[i], spec));
            if flavor.conv_norm {
                encoder = encoder.add(batch_norm(
                    &enc / format!("batch_norm2d_{}", i + 1),
                    2,
                    config.filters[i],
                    momentum,
                    1e-3,
                ));
            }
            encoder = encoder.add_fn(|xs| xs.relu());
            c_in = config.filters[i];
        }

        let grid = decoder_grid(&input, &config.strides, flavor.column);
        let flat = c_in * grid[0] * grid[1];
        let mut encoder = encoder.add_fn(|xs| xs.flat_view());
        let mut features = flat;
        if flavor.hidden {
            encoder = dense(encoder, &enc / "hidden", "hidden", flat, config.hidden_dim, flavor, momentum);
            features = config.hidden_dim;
        }
        let encoder = encoder.add_fn_t(move |xs, train| xs.dropout(dropout, train));
        let head = GaussianHead::new(&path / "head", features, config.latent_dim);

        let dec = &path / "generator";
        let mut decoder = nn::seq_t();
        let mut dim_in = config.latent_dim;
        if flavor.hidden {
            decoder = dense(decoder, &dec / "hidden", "hidden", dim_in, config.hidden_dim, flavor, momentum);
            dim_in = config.hidden_dim;
        }
        let start = [-1, c_in, grid[0], grid[1]];
        let mut decoder = dense(
            decoder.add_fn_t(move |xs, train| xs.dropout(dropout, train)),
            &dec / "grid",
            "grid",
            dim_in,
            flat,
            flavor,
            momentum,
        )
        .add_fn(move |xs| xs.reshape(start));

        for i in 0..n {
            let layer = n - 1 - i;
            let spec = flavor.kernel(config.kernels[layer]).stride(&flavor.stride(config.strides[layer]));
            decoder = decoder.add(same_conv_transpose(
                &dec / format!("ConvTranspose2d_{}", i + 1),
                c_in,
                config.filters[layer],
                spec,
            ));
            if flavor.conv_norm {
                decoder = decoder.add(batch_norm(
                    &dec / format!("batch_norm2d_{}", i + 1),
                    2,
                    config.filters[layer],
                    momentum,
                    1e-3,
                ));
            }
            decoder = decoder.add_fn(|xs| xs.relu());
            c_in = config.filters[layer];
        }

        let size = [input.spatial[0], input.spatial[1]];
        let decoder = decoder
            .add_fn(move |xs| resize(xs, &size))
            .add(same_conv(&dec / "Conv2d_out", c_in, input.channels, ConvSpec::cube(2, 2)))
            .add_fn(move |xs| activation.apply(xs));

        ConvVae { encoder, head, decoder, input_shape: input, latent_dim: config.latent_dim }
    }
}

impl VariationalAutoencoder for ConvVae {
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
