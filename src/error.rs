use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape { expected: Vec<i64>, actual: Vec<i64> },

    #[error("style loss needs a reference image, none found at {0}")]
    MissingReference(PathBuf),

    #[error("style loss needs pretrained VGG16 weights, none found at {0}")]
    MissingVggWeights(PathBuf),

    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    #[error("unsupported data file: {0}")]
    UnsupportedData(PathBuf),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VaeError>;
