//! Writing samples to disk: PNG images, `.npy` arrays and latent-space morphing GIFs.
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use gif::{Encoder, Frame, Repeat};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tch::{Device, Kind, Tensor};

use crate::config::OutputActivation;
use crate::error::{Result, VaeError};
use crate::vae::{self, VariationalAutoencoder};

/// One sample `[C, H, W]` (or a volume `[C, H, W, D]`, tiled along the width)
/// as a `u8` image.
///
/// Gray and RGB samples are rescaled from the activation's range. Any other
/// channel count is read as per-class scores and rendered as a gray class map.
pub fn to_image(sample: &Tensor, activation: OutputActivation) -> Tensor {
    let sample = match sample.dim() {
        4 => {
            let size = sample.size();
            let (c, h, w, d) = (size[0], size[1], size[2], size[3]);
            sample.permute([0, 1, 3, 2]).reshape([c, h, d * w])
        }
        _ => sample.shallow_clone(),
    };
    let channels = sample.size()[0];
    let pixels = match channels {
        1 | 3 => match activation {
            OutputActivation::Tanh => (sample + 1.0) * 127.5,
            _ => sample * 255.0,
        },
        _ => sample.argmax(0, true).to_kind(Kind::Float) * (255.0 / (channels - 1).max(1) as f64),
    };
    pixels.clamp(0.0, 255.0).to_kind(Kind::Uint8).to_device(Device::Cpu)
}

/// Saves every sample of `batch` as `<dir>/<prefix>-<i>.png`, counting from 1.
pub fn save_images<P: AsRef<Path>>(
    dir: P,
    prefix: &str,
    batch: &Tensor,
    activation: OutputActivation,
) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        fs::create_dir_all(dir)?;
    }
    let mut paths = Vec::new();
    for i in 0..batch.size()[0] {
        let path = dir.join(format!("{prefix}-{}.png", i + 1));
        tch::vision::image::save(&to_image(&batch.get(i), activation), &path)?;
        paths.push(path);
    }
    Ok(paths)
}

pub fn save_npy<P: AsRef<Path>>(path: P, xs: &Tensor) -> Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            fs::create_dir_all(parent)?;
        }
    }
    xs.to_device(Device::Cpu).write_npy(path)?;
    Ok(())
}

/// Two latent points drawn from `N(0, std²)`, reproducible from `seed`.
pub fn latent_endpoints(latent_dim: i64, std: f64, seed: u64, device: Device) -> Result<(Tensor, Tensor)> {
    let normal = Normal::new(0.0f32, std as f32)
        .map_err(|e| VaeError::Config(format!("invalid latent std {std}: {e}")))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut draw = || {
        let values: Vec<f32> = (0..latent_dim).map(|_| normal.sample(&mut rng)).collect();
        Tensor::from_slice(&values).to_device(device)
    };
    let from = draw();
    let to = draw();
    Ok((from, to))
}

/// Walks the straight line between two latent points and writes the decoded
/// frames as a looping GIF.
pub fn morphing_gif<P: AsRef<Path>>(
    model: &dyn VariationalAutoencoder,
    from: &Tensor,
    to: &Tensor,
    frames: usize,
    activation: OutputActivation,
    path: P,
) -> Result<()> {
    let frames = frames.max(2);
    let mut images = Vec::with_capacity(frames);
    for i in 0..frames {
        let l = i as f64 / (frames - 1) as f64;
        let zs = ((1.0 - l) * from + l * to).view([1, -1]);
        let image = to_image(&vae::generate(model, &zs, false).get(0), activation);
        images.push(if image.size()[0] == 1 { image.repeat([3, 1, 1]) } else { image });
    }
    let (h, w) = (images[0].size()[1], images[0].size()[2]);

    let mut file = File::create(path)?;
    let mut encoder = Encoder::new(&mut file, w as u16, h as u16, &[]).map_err(gif_error)?;
    encoder.set_repeat(Repeat::Infinite).map_err(gif_error)?;
    let len = (3 * h * w) as usize;
    for image in images {
        let mut data = vec![0u8; len];
        image.permute_copy([1, 2, 0]).flat_view().copy_data(&mut data, len);
        let frame = Frame::from_rgb(w as u16, h as u16, &data);
        encoder.write_frame(&frame).map_err(gif_error)?;
    }
    Ok(())
}

fn gif_error(e: gif::EncodingError) -> VaeError {
    match e {
        gif::EncodingError::Io(e) => VaeError::Io(e),
        other => VaeError::Io(std::io::Error::new(std::io::ErrorKind::Other, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InputShape, Variant, VaeConfig};
    use tch::nn;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dcvae_output_{}_{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn bytes(t: &Tensor) -> Vec<u8> {
        Vec::try_from(t.flatten(0, -1)).unwrap()
    }

    #[test]
    fn gray_samples_rescale_by_activation() {
        let sample = Tensor::from_slice(&[0.0f32, 0.5, 1.0, 2.0]).reshape([1, 2, 2]);
        assert_eq!(bytes(&to_image(&sample, OutputActivation::Sigmoid)), [0, 127, 255, 255]);

        let sample = Tensor::from_slice(&[-1.0f32, 0.0, 1.0, -3.0]).reshape([1, 2, 2]);
        assert_eq!(bytes(&to_image(&sample, OutputActivation::Tanh)), [0, 127, 255, 0]);
    }

    #[test]
    fn class_scores_become_a_class_map() {
        // Two classes over a 1x3 image: winners 0, 1, 1.
        let sample = Tensor::from_slice(&[0.9f32, 0.2, 0.4, 0.1, 0.8, 0.6]).reshape([2, 1, 3]);
        let image = to_image(&sample, OutputActivation::Sigmoid);
        assert_eq!(image.size(), [1, 1, 3]);
        assert_eq!(bytes(&image), [0, 255, 255]);
    }

    #[test]
    fn volumes_are_tiled_by_depth() {
        let volume = Tensor::rand([1, 4, 5, 3], tch::kind::FLOAT_CPU);
        assert_eq!(to_image(&volume, OutputActivation::Sigmoid).size(), [1, 4, 15]);
    }

    #[test]
    fn images_and_arrays_are_written() {
        let dir = scratch("images");
        let batch = Tensor::rand([3, 1, 6, 5], tch::kind::FLOAT_CPU);
        let paths = save_images(dir.join("samples"), "generate", &batch, OutputActivation::Sigmoid).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(paths[2].ends_with("generate-3.png"));
        assert!(paths.iter().all(|p| p.is_file()));

        let npy = dir.join("arrays").join("latent.npy");
        save_npy(&npy, &batch).unwrap();
        assert_eq!(Tensor::read_npy(&npy).unwrap().size(), [3, 1, 6, 5]);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn endpoints_are_reproducible() {
        let (a, b) = latent_endpoints(6, 1.0, 7, Device::Cpu).unwrap();
        let (c, _) = latent_endpoints(6, 1.0, 7, Device::Cpu).unwrap();
        assert_eq!(a.size(), [6]);
        assert_eq!(bytes(&(a.eq_tensor(&c)).to_kind(Kind::Uint8)), [1; 6]);
        assert!(f64::try_from(&(&a - &b).abs().sum(Kind::Float)).unwrap() > 0.0);
        assert!(latent_endpoints(6, -1.0, 7, Device::Cpu).is_err());
    }

    #[test]
    fn morphing_writes_a_gif() {
        let mut config = VaeConfig::for_variant(Variant::Conv).with_input_shape(InputShape::new(1, &[8, 6]));
        config.latent_dim = 3;
        config.hidden_dim = 8;
        config.filters = vec![2, 4];
        config.kernels = vec![2, 3];
        config.strides = vec![1, 2];
        let vs = nn::VarStore::new(Device::Cpu);
        let model = vae::build(&vs.root(), &config).unwrap();

        let dir = scratch("gif");
        let path = dir.join("morphing.gif");
        let (from, to) = latent_endpoints(3, 1.0, 0, Device::Cpu).unwrap();
        morphing_gif(model.as_ref(), &from, &to, 5, config.activation, &path).unwrap();
        let header = fs::read(&path).unwrap();
        assert_eq!(&header[..6], b"GIF89a");
        fs::remove_dir_all(dir).unwrap();
    }
}
