//! Image classification with local features, visual word encodings and support vector machines.
//!
//! The building blocks are meant to be chained:
//!
//! 1. [`features::extract`] describes every image of a [`Dataset`] with local descriptors.
//! 2. [`bovw`] turns the descriptors of an image into a single vector, either a histogram of
//!    visual words or a Fisher vector.
//! 3. [`classification::train_svm`] fits the optional PCA and standardization and trains an SVM.
//! 4. [`metrics`] scores the predictions on the test set.
//!
//! Expensive results are cached on disk by name in an [`ArtifactStore`].
//! The [`experiments`] module wires the stages together.

pub mod bovw;
pub mod classification;
pub mod cluster;
mod error;
pub mod experiments;
pub mod features;
pub mod gmm;
pub mod image;
pub mod io;
pub mod kernels;
pub mod metrics;
pub mod plotting;
pub mod preprocessing;
pub mod reduction;
pub mod search;
mod settings;
pub mod svm;

pub use crate::image::GrayFloatImage;
pub use error::{Error, Result};
pub use features::DescriptorSet;
pub use io::{ArtifactStore, Dataset};
pub use settings::{FeatureSettings, Settings};

/// Name of an image class.
pub type Label = String;

/// A pool of `n_jobs` worker threads. Zero lets rayon pick one thread per core.
pub fn thread_pool(n_jobs: usize) -> Result<rayon::ThreadPool> {
    Ok(rayon::ThreadPoolBuilder::new().num_threads(n_jobs).build()?)
}
