pub mod conv;
pub mod conv3d;
pub mod dense;
pub mod inception;
pub mod mobilenet;

use tch::{nn, Tensor};

use crate::vae::Posterior;

/// Mean and log-variance projections on top of an encoder.
#[derive(Debug)]
pub struct GaussianHead {
    mean: nn::Linear,
    logvar: nn::Linear,
}

impl GaussianHead {
    pub fn new(p: nn::Path, dim_in: i64, latent_dim: i64) -> GaussianHead {
        GaussianHead {
            mean: nn::linear(&p / "z_mean", dim_in, latent_dim, Default::default()),
            logvar: nn::linear(&p / "z_log_var", dim_in, latent_dim, Default::default()),
        }
    }

    pub fn forward(&self, hidden: &Tensor) -> Posterior {
        Posterior {
            mean: hidden.apply(&self.mean),
            logvar: hidden.apply(&self.logvar),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use tch::nn::OptimizerConfig;
    use tch::{nn, Device, Kind, Tensor};

    use crate::config::VaeConfig;
    use crate::vae::{self, VariationalAutoencoder};

    /// Runs the end-to-end model and the standalone generator and checks shapes.
    pub fn check_shapes(config: &VaeConfig, batch: i64) -> (nn::VarStore, Box<dyn VariationalAutoencoder>) {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = vae::build(&vs.root(), config).unwrap();
        let dims = config.input_shape.batch_dims(batch);
        let xs = Tensor::rand(dims.as_slice(), (Kind::Float, Device::Cpu));

        let out = model.forward_t(&xs, true);
        assert_eq!(out.reconstruction.size(), dims);
        assert_eq!(out.posterior.mean.size(), [batch, config.latent_dim]);
        assert_eq!(out.posterior.logvar.size(), [batch, config.latent_dim]);
        assert_eq!(out.z.size(), [batch, config.latent_dim]);

        let zs = vae::sample_latent(model.as_ref(), batch, 1.0, Device::Cpu);
        assert_eq!(vae::generate(model.as_ref(), &zs, false).size(), dims);
        (vs, model)
    }

    /// One optimizer step on the autoencoder objective must move the generator.
    pub fn check_weight_sharing(vs: &nn::VarStore, model: &dyn VariationalAutoencoder) {
        let zs = vae::sample_latent(model, 2, 1.0, Device::Cpu);
        let before = vae::generate(model, &zs, false);

        let mut opt = nn::Sgd::default().build(vs, 0.1).unwrap();
        let xs = Tensor::rand(model.input_shape().batch_dims(2).as_slice(), (Kind::Float, Device::Cpu));
        let out = model.forward_t(&xs, true);
        let loss = (&out.reconstruction - &xs).square().mean(Kind::Float) + out.posterior.kl_divergence();
        opt.backward_step(&loss);

        let after = vae::generate(model, &zs, false);
        let diff = f64::try_from(&(after - before).abs().sum(Kind::Float)).unwrap();
        assert!(diff > 0.0);
    }
}
