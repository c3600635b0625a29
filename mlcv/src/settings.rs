use crate::{ArtifactStore, Result};
use log::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parameters of local feature extraction.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSettings {
    /// The AKAZE detector threshold used to find keypoints.
    ///
    /// 0.01 will be very sparse and 0.0001 will be very dense.
    #[serde(default = "default_akaze_threshold")]
    pub akaze_threshold: f64,
    /// Distance in pixels between two dense sampling positions.
    #[serde(default = "default_dense_sampling_density")]
    pub dense_sampling_density: usize,
    /// Diameter in pixels of the patch described at every dense position.
    #[serde(default = "default_dense_keypoint_size")]
    pub dense_keypoint_size: f32,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            akaze_threshold: default_akaze_threshold(),
            dense_sampling_density: default_dense_sampling_density(),
            dense_keypoint_size: default_dense_keypoint_size(),
        }
    }
}

/// The settings shared by every experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the `{train,test}_images_filenames.json` and `{train,test}_labels.json` files.
    #[serde(default = "default_dataset_dir")]
    pub dataset_dir: PathBuf,
    /// Directory where trained models, scalers and confusion matrices are stored.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    /// Directory for bulky intermediate results (descriptor sets, sweep results).
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Number of worker threads used for parallel work.
    #[serde(default = "default_n_jobs")]
    pub n_jobs: usize,
    /// Seed for every random number generator (clustering, search).
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub features: FeatureSettings,
    /// Dense sampling steps tried by the Fisher vector sweep.
    #[serde(default = "default_dense_sampling_densities")]
    pub dense_sampling_densities: Vec<usize>,
    /// Number of Gaussians tried by the Fisher vector sweep.
    #[serde(default = "default_codebook_sizes")]
    pub codebook_sizes: Vec<usize>,
    /// PCA dimensions tried by the Fisher vector sweep.
    #[serde(default = "default_pca_reductions")]
    pub pca_reductions: Vec<usize>,
    /// Number of sampled candidates of the randomized search.
    #[serde(default = "default_search_iterations")]
    pub search_iterations: usize,
    /// Number of cross-validation folds of the randomized search.
    ///
    /// Folds are stratified by class but never shuffled, so samples stay in dataset order.
    #[serde(default = "default_search_folds")]
    pub search_folds: usize,
    /// log10 of the smallest C the search may sample.
    #[serde(default = "default_c_log_start")]
    pub c_log_start: f64,
    /// log10 of the largest C the search may sample.
    #[serde(default = "default_c_log_stop")]
    pub c_log_stop: f64,
    /// Number of log-spaced C values the search samples from.
    #[serde(default = "default_c_log_num")]
    pub c_log_num: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dataset_dir: default_dataset_dir(),
            models_dir: default_models_dir(),
            cache_dir: default_cache_dir(),
            n_jobs: default_n_jobs(),
            seed: default_seed(),
            features: FeatureSettings::default(),
            dense_sampling_densities: default_dense_sampling_densities(),
            codebook_sizes: default_codebook_sizes(),
            pca_reductions: default_pca_reductions(),
            search_iterations: default_search_iterations(),
            search_folds: default_search_folds(),
            c_log_start: default_c_log_start(),
            c_log_stop: default_c_log_stop(),
            c_log_num: default_c_log_num(),
        }
    }
}

impl Settings {
    /// Reads settings from a JSON file, falling back to the defaults when it is missing.
    ///
    /// A file that exists but does not parse is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::File::open(path) {
            Ok(file) => {
                let settings = serde_json::from_reader(std::io::BufReader::new(file))?;
                info!("loaded settings from {}", path.display());
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("{} not found, using default settings", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn models(&self) -> ArtifactStore {
        ArtifactStore::new(&self.models_dir)
    }

    pub fn cache(&self) -> ArtifactStore {
        ArtifactStore::new(&self.cache_dir)
    }
}

fn default_akaze_threshold() -> f64 {
    0.001
}

fn default_dense_sampling_density() -> usize {
    8
}

fn default_dense_keypoint_size() -> f32 {
    16.0
}

fn default_dataset_dir() -> PathBuf {
    PathBuf::from("./dataset")
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("./models")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./ignore")
}

fn default_n_jobs() -> usize {
    6
}

fn default_seed() -> u64 {
    42
}

fn default_dense_sampling_densities() -> Vec<usize> {
    vec![2, 4, 8, 16]
}

fn default_codebook_sizes() -> Vec<usize> {
    vec![16, 32, 64]
}

fn default_pca_reductions() -> Vec<usize> {
    vec![60, 80, 100, 120]
}

fn default_search_iterations() -> usize {
    20
}

fn default_search_folds() -> usize {
    3
}

fn default_c_log_start() -> f64 {
    -3.0
}

fn default_c_log_stop() -> f64 {
    1.0
}

fn default_c_log_num() -> usize {
    1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "n_jobs": 2, "features": { "dense_sampling_density": 4 } }"#)
                .unwrap();
        assert_eq!(settings.n_jobs, 2);
        assert_eq!(settings.features.dense_sampling_density, 4);
        assert_eq!(settings.features.akaze_threshold, 0.001);
        assert_eq!(settings.codebook_sizes, vec![16, 32, 64]);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
