//! Visual word histograms classified by an SVM.

use super::Evaluation;
use crate::bovw::{self, Normalization};
use crate::classification::{train_svm, TrainOptions};
use crate::features::{self, Method};
use crate::metrics::{accuracy, ConfusionMatrix};
use crate::svm::Kernel;
use crate::{io, plotting, thread_pool, DescriptorSet, FeatureSettings, Result, Settings};
use log::*;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct BovwSvmOptions {
    pub method: Method,
    pub codebook_size: usize,
    pub normalization: Normalization,
    pub kernel: Kernel,
    pub c: f64,
    pub standardize: bool,
    pub images_per_class: Option<usize>,
    /// Prefix of the model and confusion matrix artifacts.
    pub name: String,
    pub plot: Option<PathBuf>,
}

impl Default for BovwSvmOptions {
    fn default() -> Self {
        Self {
            method: Method::Dense,
            codebook_size: 512,
            normalization: Normalization::L1,
            kernel: Kernel::Intersection,
            c: 1.0,
            standardize: false,
            images_per_class: None,
            name: "bovw_svm".to_owned(),
            plot: None,
        }
    }
}

/// Names the descriptor configuration, so artifacts built from other settings are not reused.
fn feature_tag(method: Method, settings: &FeatureSettings) -> String {
    match method {
        Method::Dense => format!(
            "dense_{}_size_{}",
            settings.dense_sampling_density, settings.dense_keypoint_size
        ),
        Method::Sift => format!("sift_threshold_{}", settings.akaze_threshold),
    }
}

fn descriptors_name(split: &str, method: Method, settings: &FeatureSettings) -> String {
    format!("{split}_{}_descriptors", feature_tag(method, settings))
}

fn codebook_name(options: &BovwSvmOptions, settings: &FeatureSettings) -> String {
    let name = format!(
        "codebook_{}_{}",
        options.codebook_size,
        feature_tag(options.method, settings)
    );
    match options.images_per_class {
        Some(n) => format!("{name}_per_class_{n}"),
        None => name,
    }
}

pub fn run(settings: &Settings, options: &BovwSvmOptions) -> Result<Evaluation> {
    let start = Instant::now();
    let models = settings.models();
    let cache = settings.cache();

    let train = io::load_training_set(&settings.dataset_dir)?;
    info!("loaded {} train images", train.len());
    let train_set: DescriptorSet = if options.images_per_class.is_none() {
        cache.load_or_compute(&descriptors_name("train", options.method, &settings.features), || {
            features::extract(&train, options.method, &settings.features, None, settings.n_jobs)
        })?
    } else {
        features::extract(
            &train,
            options.method,
            &settings.features,
            options.images_per_class,
            settings.n_jobs,
        )?
    };

    let pool = thread_pool(settings.n_jobs)?;
    let stage = Instant::now();
    let codebook = pool.install(|| {
        bovw::create_codebook(
            &models,
            &codebook_name(options, &settings.features),
            train_set.descriptors.view(),
            options.codebook_size,
            settings.seed,
        )
    })?;
    let (train_words, train_labels) =
        bovw::visual_words(&train_set, &codebook, options.normalization)?;
    info!("visual words ready in {:.2} s", stage.elapsed().as_secs_f64());

    let trained = pool.install(|| {
        train_svm(
            &models,
            train_words.view(),
            &train_labels,
            &TrainOptions {
                c: options.c,
                kernel: options.kernel,
                standardize: options.standardize,
                model_name: Some(options.name.clone()),
                ..Default::default()
            },
        )
    })?;

    let test = io::load_test_set(&settings.dataset_dir)?;
    info!("loaded {} test images", test.len());
    let test_set = features::extract(
        &test,
        options.method,
        &settings.features,
        None,
        settings.n_jobs,
    )?;
    let (test_words, test_labels) =
        bovw::visual_words(&test_set, &codebook, options.normalization)?;
    let predicted = pool.install(|| trained.predict(test_words.view()))?;

    let evaluation = Evaluation {
        accuracy: accuracy(&test_labels, &predicted)?,
        confusion: ConfusionMatrix::new(&test_labels, &predicted, trained.classes())?,
    };
    models.save(&format!("{}_cm", options.name), &evaluation.confusion)?;
    if let Some(path) = &options.plot {
        plotting::plot_confusion_matrix(&evaluation.confusion, true, path)?;
    }
    info!("accuracy: {:.2}", evaluation.accuracy);
    info!("total time: {:.2} s", start.elapsed().as_secs_f64());
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_follow_feature_settings() {
        let dense = FeatureSettings {
            dense_sampling_density: 8,
            dense_keypoint_size: 12.0,
            ..Default::default()
        };
        assert_eq!(
            descriptors_name("train", Method::Dense, &dense),
            "train_dense_8_size_12_descriptors"
        );
        let coarser = FeatureSettings {
            dense_sampling_density: 16,
            ..dense
        };
        assert_ne!(
            descriptors_name("train", Method::Dense, &dense),
            descriptors_name("train", Method::Dense, &coarser)
        );

        let options = BovwSvmOptions {
            method: Method::Sift,
            codebook_size: 64,
            ..Default::default()
        };
        let sparse = FeatureSettings {
            akaze_threshold: 0.01,
            ..dense
        };
        assert_eq!(codebook_name(&options, &sparse), "codebook_64_sift_threshold_0.01");
        assert_ne!(codebook_name(&options, &sparse), codebook_name(&options, &dense));
        let subset = BovwSvmOptions {
            images_per_class: Some(5),
            ..options.clone()
        };
        assert_eq!(
            codebook_name(&subset, &sparse),
            "codebook_64_sift_threshold_0.01_per_class_5"
        );
    }
}
