use std::path::Path;

use tch::{data::Iter2, Device, Kind, Tensor};

use crate::config::InputShape;
use crate::error::{Result, VaeError};

/// Samples stacked along the first axis, `[N, C, ...spatial]`, as floats.
#[derive(Debug)]
pub struct Dataset {
    images: Tensor,
}

impl Dataset {
    /// Loads a directory of images or a `.npy` / `.ot` tensor file.
    ///
    /// Images are resized to the input's `H × W` and averaged to gray when
    /// the model expects a single channel. Byte data is scaled to `[0, 1]`.
    pub fn load<P: AsRef<Path>>(path: P, shape: &InputShape) -> Result<Dataset> {
        let path = path.as_ref();
        let raw = if path.is_dir() {
            load_image_dir(path, shape)?
        } else {
            match path.extension().and_then(|e| e.to_str()) {
                Some("npy") => Tensor::read_npy(path)?,
                Some("ot") | Some("pt") => Tensor::load(path)?,
                _ => return Err(VaeError::UnsupportedData(path.to_path_buf())),
            }
        };
        let dataset = Dataset::from_tensor(raw, shape)?;
        tracing::info!(path = %path.display(), samples = dataset.len(), "loaded dataset");
        Ok(dataset)
    }

    pub fn from_tensor(raw: Tensor, shape: &InputShape) -> Result<Dataset> {
        let images = match raw.kind() {
            Kind::Uint8 => raw.to_kind(Kind::Float) / 255.0,
            _ => raw.to_kind(Kind::Float),
        };
        shape.check(&images)?;
        if images.size()[0] == 0 {
            return Err(VaeError::EmptyDataset("no samples".to_string()));
        }
        Ok(Dataset { images })
    }

    pub fn len(&self) -> i64 {
        self.images.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    /// Keeps the leading samples for training and returns the trailing
    /// `fraction` as a validation set, without shuffling first.
    pub fn split_validation(self, fraction: f64) -> Result<(Dataset, Dataset)> {
        let n = self.len();
        let train_len = (n as f64 * (1.0 - fraction)) as i64;
        if train_len == 0 || train_len == n {
            return Err(VaeError::EmptyDataset(format!(
                "validation split {fraction} of {n} samples leaves one side empty"
            )));
        }
        let train = self.images.narrow(0, 0, train_len);
        let valid = self.images.narrow(0, train_len, n - train_len);
        Ok((Dataset { images: train }, Dataset { images: valid }))
    }

    /// Mini-batches of `(inputs, targets)`; the targets are the inputs.
    /// The last batch may be smaller.
    pub fn batches(&self, batch_size: i64, shuffle: bool, device: Device) -> Iter2 {
        let mut iter = Iter2::new(&self.images, &self.images, batch_size);
        iter.return_smaller_last_batch();
        if shuffle {
            iter.shuffle();
        }
        iter.to_device(device);
        iter
    }

    /// Shuffled mini-batches for one training epoch.
    ///
    /// A trailing batch of a single sample is folded into the batch before
    /// it: batch-norm in train mode needs two samples to estimate a variance.
    pub fn training_batches(&self, batch_size: i64, device: Device) -> Vec<(Tensor, Tensor)> {
        let n = self.len();
        let batch_size = batch_size.max(1);
        let order = Tensor::randperm(n, (Kind::Int64, self.images.device()));
        let mut starts: Vec<i64> = (0..n).step_by(batch_size as usize).collect();
        if n % batch_size == 1 && starts.len() > 1 {
            starts.pop();
        }
        let ends: Vec<i64> = starts.iter().skip(1).copied().chain([n]).collect();
        starts
            .iter()
            .zip(ends)
            .map(|(&start, end)| {
                let xs = self.images.index_select(0, &order.narrow(0, start, end - start)).to_device(device);
                (xs.shallow_clone(), xs)
            })
            .collect()
    }
}

fn load_image_dir(path: &Path, shape: &InputShape) -> Result<Tensor> {
    if shape.spatial.len() != 2 {
        return Err(VaeError::UnsupportedData(path.to_path_buf()));
    }
    let (h, w) = (shape.spatial[0], shape.spatial[1]);
    let images = tch::vision::image::load_dir(path, w, h)?;
    match shape.channels {
        1 => Ok(images.to_kind(Kind::Float).mean_dim([1i64].as_slice(), true, Kind::Float) / 255.0),
        3 => Ok(images),
        _ => Err(VaeError::Config(format!(
            "image folders hold gray or RGB pictures, the model expects {} channels",
            shape.channels
        ))),
    }
}
