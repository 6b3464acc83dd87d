//! Variational autoencoders on libtorch: dense, convolutional, inception,
//! MobileNetV2 and volumetric models sharing one encoder/generator contract.
pub mod callbacks;
pub mod config;
pub mod data;
pub mod error;
pub mod layers;
pub mod loss;
pub mod models;
pub mod output;
pub mod style;
pub mod train;
pub mod vae;

pub use config::VaeConfig;
pub use error::{Result, VaeError};
pub use vae::{Generator, VariationalAutoencoder};
