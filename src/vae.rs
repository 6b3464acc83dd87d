use tch::{nn, Kind, Tensor};

use crate::config::{InputShape, Variant, VaeConfig};
use crate::error::Result;
use crate::models;

/// Diagonal Gaussian produced by an encoder.
#[derive(Debug)]
pub struct Posterior {
    pub mean: Tensor,
    pub logvar: Tensor,
}

impl Posterior {
    /// Reparameterized sample `mean + exp(logvar / 2) * eps`, differentiable in both parameters.
    pub fn sample(&self) -> Tensor {
        let std = (&self.logvar * 0.5).exp();
        &self.mean + std.randn_like() * std
    }

    /// KL divergence to the standard normal, summed over the latent axis and
    /// averaged over the batch.
    pub fn kl_divergence(&self) -> Tensor {
        crate::loss::kl_normal(&self.mean, &self.logvar, 1.0)
    }
}

#[derive(Debug)]
pub struct VaeOutput {
    pub reconstruction: Tensor,
    pub posterior: Posterior,
    pub z: Tensor,
}

pub trait VariationalAutoencoder: std::fmt::Debug + Send {
    fn encode_t(&self, xs: &Tensor, train: bool) -> Posterior;

    /// The generator: maps latent vectors `[B, latent_dim]` to samples.
    fn decode_t(&self, zs: &Tensor, train: bool) -> Tensor;

    fn latent_dim(&self) -> i64;

    fn input_shape(&self) -> &InputShape;

    /// End-to-end pass. The decoder called here is the same one `decode_t`
    /// runs, so training the autoencoder trains the generator.
    fn forward_t(&self, xs: &Tensor, train: bool) -> VaeOutput {
        let posterior = self.encode_t(xs, train);
        let z = posterior.sample();
        let reconstruction = self.decode_t(&z, train);
        VaeOutput { reconstruction, posterior, z }
    }
}

pub fn build(p: &nn::Path, config: &VaeConfig) -> Result<Box<dyn VariationalAutoencoder>> {
    config.validate()?;
    let model: Box<dyn VariationalAutoencoder> = match config.variant {
        Variant::Dense => Box::new(models::dense::DenseVae::new(p / "dense_vae", config)),
        Variant::Conv | Variant::ConvNorm | Variant::ConvNormLite | Variant::ConvColumn => {
            Box::new(models::conv::ConvVae::new(p / "conv_vae", config))
        }
        Variant::Inception => Box::new(models::inception::InceptionVae::new(p / "inception_vae", config)),
        Variant::Mobilenet => Box::new(models::mobilenet::MobileNetVae::new(p / "mobilenet_vae", config)),
        Variant::Conv3d => Box::new(models::conv3d::Conv3dVae::new(p / "conv3d_vae", config)),
    };
    Ok(model)
}

/// Decoder-only view of a model. Holds no parameters of its own.
#[derive(Debug)]
pub struct Generator<'a> {
    vae: &'a dyn VariationalAutoencoder,
}

impl<'a> Generator<'a> {
    pub fn new(vae: &'a dyn VariationalAutoencoder) -> Generator<'a> {
        Generator { vae }
    }

    pub fn forward_t(&self, zs: &Tensor, train: bool) -> Tensor {
        self.vae.decode_t(zs, train)
    }
}

/// Encoder view returning the posterior mean.
#[derive(Debug)]
pub struct Encoder<'a> {
    vae: &'a dyn VariationalAutoencoder,
}

impl<'a> Encoder<'a> {
    pub fn new(vae: &'a dyn VariationalAutoencoder) -> Encoder<'a> {
        Encoder { vae }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.vae.encode_t(xs, train).mean
    }
}

fn argmax_channels(xs: &Tensor) -> Tensor {
    xs.argmax(1, false)
}

/// Decodes latent vectors, typically drawn with [`sample_latent`].
pub fn generate(vae: &dyn VariationalAutoencoder, zs: &Tensor, binary: bool) -> Tensor {
    let samples = tch::no_grad(|| Generator::new(vae).forward_t(zs, false));
    if binary {
        argmax_channels(&samples)
    } else {
        samples
    }
}

pub fn sample_latent(vae: &dyn VariationalAutoencoder, n: i64, std: f64, device: tch::Device) -> Tensor {
    Tensor::randn([n, vae.latent_dim()], (Kind::Float, device)) * std
}

/// Full stochastic pass in inference mode.
pub fn reconstruct(vae: &dyn VariationalAutoencoder, xs: &Tensor, binary: bool) -> Tensor {
    let recon = tch::no_grad(|| vae.forward_t(xs, false).reconstruction);
    if binary {
        argmax_channels(&recon)
    } else {
        recon
    }
}

pub fn encode_mean(vae: &dyn VariationalAutoencoder, xs: &Tensor) -> Tensor {
    tch::no_grad(|| Encoder::new(vae).forward_t(xs, false))
}
