use tch::{nn, nn::ModuleT, Tensor};

use super::GaussianHead;
use crate::config::{InputShape, VaeConfig};
use crate::layers::batch_norm;
use crate::vae::{Posterior, VariationalAutoencoder};

#[derive(Debug)]
pub struct DenseVae {
    encoder: nn::SequentialT,
    head: GaussianHead,
    decoder: nn::SequentialT,
    input_shape: InputShape,
    latent_dim: i64,
}

impl DenseVae {
    pub fn new(path: nn::Path, config: &VaeConfig) -> DenseVae {
        let momentum = config.batch_norm_momentum;
        let dropout = config.dropout;
        let activation = config.activation;

        let enc = &path / "encoder";
        let mut encoder = nn::seq_t().add_fn(|xs| xs.flat_view());
        let mut dim_in = config.input_shape.numel();
        for (i, &width) in config.dense_widths.iter().enumerate() {
            encoder = encoder
                .add(nn::linear(&enc / format!("Dense_{}", i + 1), dim_in, width, Default::default()))
                .add(batch_norm(&enc / format!("batch_norm_{}", i + 1), 0, width, momentum, 1e-3))
                .add_fn(|xs| xs.relu());
            dim_in = width;
        }
        let encoder = encoder
            .add(nn::linear(&enc / "Dense_hidden", dim_in, config.hidden_dim, Default::default()))
            .add_fn_t(move |xs, train| xs.dropout(dropout, train));
        let head = GaussianHead::new(&path / "head", config.hidden_dim, config.latent_dim);

        let dec = &path / "generator";
        let mut decoder = nn::seq_t()
            .add(nn::linear(&dec / "Dense_hidden", config.latent_dim, config.hidden_dim, Default::default()))
            .add_fn_t(move |xs, train| xs.dropout(dropout, train));
        let mut dim_in = config.hidden_dim;
        for (i, &width) in config.dense_widths.iter().rev().enumerate() {
            decoder = decoder
                .add(nn::linear(&dec / format!("Dense_{}", i + 1), dim_in, width, Default::default()))
                .add(batch_norm(&dec / format!("batch_norm_{}", i + 1), 0, width, momentum, 1e-3));
            dim_in = width;
        }
        let out_dims = config.input_shape.batch_dims(-1);
        let decoder = decoder
            .add(nn::linear(&dec / "Dense_out", dim_in, config.input_shape.numel(), Default::default()))
            .add_fn(move |xs| activation.apply(xs))
            .add_fn(move |xs| xs.reshape(out_dims.as_slice()));

        DenseVae {
            encoder,
            head,
            decoder,
            input_shape: config.input_shape.clone(),
            latent_dim: config.latent_dim,
        }
    }
}

impl VariationalAutoencoder for DenseVae {
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
        let mut config = VaeConfig::for_variant(Variant::Dense).with_input_shape(InputShape::new(2, &[9, 7]));
        config.latent_dim = 4;
        config.hidden_dim = 16;
        config.dense_widths = vec![32, 24];
        config
    }

    #[test]
    fn shapes() {
        testing::check_shapes(&small(), 3);
    }

    #[test]
    fn without_intermediate_layers() {
        let mut config = small();
        config.dense_widths.clear();
        testing::check_shapes(&config, 2);
    }

    #[test]
    fn generator_shares_weights() {
        let (vs, model) = testing::check_shapes(&small(), 2);
        testing::check_weight_sharing(&vs, model.as_ref());
    }

    #[test]
    fn sigmoid_output_is_a_probability() {
        let (_vs, model) = testing::check_shapes(&small(), 2);
        let zs = Tensor::randn([5, 4], tch::kind::FLOAT_CPU) * 10.0;
        let ys = crate::vae::generate(model.as_ref(), &zs, false);
        assert!(f64::try_from(&ys.min()).unwrap() >= 0.0);
        assert!(f64::try_from(&ys.max()).unwrap() <= 1.0);
    }
}
