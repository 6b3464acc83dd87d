use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tch::{nn, Device, Tensor};

use dcvae_rs::config::{InputShape, Variant, VaeConfig};
use dcvae_rs::data::Dataset;
use dcvae_rs::loss::VaeLoss;
use dcvae_rs::output;
use dcvae_rs::style::StyleLoss;
use dcvae_rs::train::Trainer;
use dcvae_rs::vae::{self, VariationalAutoencoder};

#[derive(Parser, Debug)]
#[command(version, about = "Variational autoencoders via Rust.", long_about = None)]
struct Args {
    /// Model and training configuration (JSON).
    #[arg(short, long, default_value = "dcvae.json")]
    config: PathBuf,
    #[arg(short, long, default_value = "vae_weights.ot")]
    weights: PathBuf,
    #[arg(short, long, default_value = "results")]
    out_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the default configuration of a variant.
    InitConfig {
        #[arg(long, value_enum)]
        variant: Variant,
        #[arg(long)]
        channels: Option<i64>,
        /// Spatial dims, e.g. `--spatial 45,45` or `--spatial 100,100,10`.
        #[arg(long, value_delimiter = ',')]
        spatial: Option<Vec<i64>>,
    },
    /// Fit the model on an image folder or a `.npy` / `.ot` tensor file.
    Train {
        #[arg(short, long)]
        dataset: PathBuf,
        #[arg(short, long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<i64>,
        #[arg(long)]
        lr: Option<f64>,
        #[arg(long)]
        validation_split: Option<f64>,
    },
    /// Decode samples of the latent prior.
    Generate {
        #[arg(short, long, default_value_t = 20, value_parser = clap::value_parser!(i64).range(1..))]
        num: i64,
        #[arg(long, default_value_t = 1.0)]
        std: f64,
        /// Keep only the argmax over channels.
        #[arg(long, default_value_t = false)]
        binary: bool,
    },
    /// Run samples through the whole model.
    Reconstruct {
        #[arg(short, long)]
        dataset: PathBuf,
        #[arg(short, long, default_value_t = 16, value_parser = clap::value_parser!(i64).range(1..))]
        num: i64,
        #[arg(long, default_value_t = false)]
        binary: bool,
    },
    /// Write the posterior means of a dataset as `.npy`.
    Encode {
        #[arg(short, long)]
        dataset: PathBuf,
    },
    /// Interpolate between two random latent points into a GIF.
    Morph {
        #[arg(long, default_value_t = 100)]
        frames: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 1.0)]
        std: f64,
    },
}

/// A configured model with its weights loaded when they exist.
struct Session {
    config: VaeConfig,
    device: Device,
    vs: nn::VarStore,
    model: Box<dyn VariationalAutoencoder>,
}

impl Session {
    fn open(config: &Path, weights: &Path) -> Result<Session> {
        let saved = weights.with_extension("json");
        let config = if !config.exists() && saved.is_file() { saved.as_path() } else { config };
        let config = VaeConfig::load(config)
            .with_context(|| format!("reading {} (create one with `init-config`)", config.display()))?;

        let device = Device::cuda_if_available();
        tracing::info!(?device, variant = ?config.variant, input = ?config.input_shape.dims(), "building model");

        let mut vs = nn::VarStore::new(device);
        let model = vae::build(&vs.root(), &config)?;
        if weights.is_file() {
            vs.load(weights).with_context(|| format!("loading {}", weights.display()))?;
            tracing::info!(path = %weights.display(), "loaded weights");
        }
        Ok(Session { config, device, vs, model })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("dcvae_rs=info".parse()?),
        )
        .init();

    let args = Args::parse();

    print_oss_license();

    match args.command {
        Command::InitConfig { variant, channels, spatial } => {
            init_config(&args.config, variant, channels, spatial.as_deref())?;
        }
        Command::Train { dataset, epochs, batch_size, lr, validation_split } => {
            let Session { mut config, device, mut vs, model } = Session::open(&args.config, &args.weights)?;
            if let Some(epochs) = epochs {
                config.train.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.train.batch_size = batch_size;
            }
            if let Some(lr) = lr {
                config.train.learning_rate = lr;
            }
            if validation_split.is_some() {
                config.train.validation_split = validation_split;
            }
            config.validate()?;

            let data = Dataset::load(&dataset, &config.input_shape)?;
            let (train, valid) = match config.train.validation_split {
                Some(fraction) => {
                    let (train, valid) = data.split_validation(fraction)?;
                    (train, Some(valid))
                }
                None => (data, None),
            };
            let style = match &config.loss.style {
                Some(style) => Some(StyleLoss::new(device, style, config.activation)?),
                None => None,
            };
            let loss = VaeLoss::new(&config, style);

            let history = {
                let mut trainer = Trainer::new(&mut vs, model.as_ref(), loss, &config)?;
                trainer.fit(&train, valid.as_ref())?
            };
            vs.save(&args.weights)?;
            config.save(args.weights.with_extension("json"))?;
            tracing::info!(path = %args.weights.display(), "saved weights");

            std::fs::create_dir_all(&args.out_dir)?;
            history.save(args.out_dir.join("history.json"))?;

            let zs = vae::sample_latent(model.as_ref(), 8, 1.0, device);
            let samples = vae::generate(model.as_ref(), &zs, false);
            output::save_images(&args.out_dir, "sample", &samples, config.activation)?;
        }
        Command::Generate { num, std, binary } => {
            let session = Session::open(&args.config, &args.weights)?;
            let model = session.model.as_ref();
            let zs = vae::sample_latent(model, num, std, session.device);
            let samples = vae::generate(model, &zs, binary);
            write_samples(&args.out_dir, "generate", &samples, binary, &session.config)?;
            println!("Generated!");
        }
        Command::Reconstruct { dataset, num, binary } => {
            let session = Session::open(&args.config, &args.weights)?;
            let data = Dataset::load(&dataset, &session.config.input_shape)?;
            let xs = data.images().narrow(0, 0, num.clamp(0, data.len())).to_device(session.device);
            let recon = vae::reconstruct(session.model.as_ref(), &xs, binary);
            write_samples(&args.out_dir, "reconstruct", &recon, binary, &session.config)?;
        }
        Command::Encode { dataset } => {
            let session = Session::open(&args.config, &args.weights)?;
            let data = Dataset::load(&dataset, &session.config.input_shape)?;
            let means: Vec<Tensor> = data
                .batches(session.config.train.batch_size, false, session.device)
                .map(|(xs, _)| vae::encode_mean(session.model.as_ref(), &xs))
                .collect();
            let path = args.out_dir.join("latent.npy");
            output::save_npy(&path, &Tensor::cat(&means, 0))?;
            tracing::info!(path = %path.display(), samples = data.len(), "wrote latent means");
        }
        Command::Morph { frames, seed, std } => {
            let session = Session::open(&args.config, &args.weights)?;
            let model = session.model.as_ref();
            let (from, to) = output::latent_endpoints(model.latent_dim(), std, seed, session.device)?;
            std::fs::create_dir_all(&args.out_dir)?;
            let path = args.out_dir.join("morphing.gif");
            output::morphing_gif(model, &from, &to, frames, session.config.activation, &path)?;
            println!("Generated {}", path.display());
        }
    }

    Ok(())
}

fn init_config(path: &Path, variant: Variant, channels: Option<i64>, spatial: Option<&[i64]>) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let mut config = VaeConfig::for_variant(variant);
    let channels = channels.unwrap_or(config.input_shape.channels);
    let spatial = spatial.map(<[i64]>::to_vec).unwrap_or_else(|| config.input_shape.spatial.clone());
    config = config.with_input_shape(InputShape::new(channels, &spatial));
    config.validate()?;
    config.save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Class maps from `--binary` only go to `.npy`; scores also become images.
fn write_samples(dir: &Path, prefix: &str, samples: &Tensor, binary: bool, config: &VaeConfig) -> Result<()> {
    output::save_npy(dir.join(format!("{prefix}.npy")), samples)?;
    if !binary {
        output::save_images(dir, prefix, samples, config.activation)?;
    }
    tracing::info!(dir = %dir.display(), count = samples.size()[0], "wrote {prefix} samples");
    Ok(())
}

fn print_oss_license() {
    println!("OSS Library: PyTorch");
    println!("URL: https://github.com/pytorch/pytorch");
    println!("License: 3-Clause BSD License");
    println!("");
    println!("OSS Library: tch-rs");
    println!("URL: https://github.com/LaurentMazare/tch-rs");
    println!("License: MIT License");
    println!("");
    println!("OSS Library: anyhow");
    println!("URL: https://github.com/dtolnay/anyhow");
    println!("License: Apache License Version 2.0");
    println!("");
    println!("OSS Library: thiserror");
    println!("URL: https://github.com/dtolnay/thiserror");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: serde / serde_json");
    println!("URL: https://github.com/serde-rs/serde");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: rand / rand_distr");
    println!("URL: https://github.com/rust-random/rand");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: gif");
    println!("URL: https://github.com/image-rs/image-gif");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: tqdm");
    println!("URL: https://github.com/mrlazy1708/tqdm");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: clap");
    println!("URL: https://github.com/clap-rs/clap");
    println!("License: MIT OR Apache-2.0");
    println!("");
    println!("OSS Library: tracing / tracing-subscriber");
    println!("URL: https://github.com/tokio-rs/tracing");
    println!("License: MIT");
    println!("--------");
    println!("");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_counts_must_be_positive() {
        for num in ["0", "-3"] {
            let args = ["dcvae-rs", "reconstruct", "--dataset", "data.npy", "--num", num];
            assert!(Args::try_parse_from(args).is_err(), "{num}");
            let args = ["dcvae-rs", "generate", "--num", num];
            assert!(Args::try_parse_from(args).is_err(), "{num}");
        }

        let args = Args::try_parse_from(["dcvae-rs", "reconstruct", "--dataset", "data.npy"]).unwrap();
        assert!(matches!(args.command, Command::Reconstruct { num: 16, binary: false, .. }));
        let args = Args::try_parse_from(["dcvae-rs", "generate", "-n", "5"]).unwrap();
        assert!(matches!(args.command, Command::Generate { num: 5, .. }));
    }
}
