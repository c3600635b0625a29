//! Per-descriptor RBF SVM on keypoint descriptors, aggregated by a vote per test image.

use super::{majority_vote, Evaluation};
use crate::classification::{train_rbf_svm, TrainOptions, TrainedSvm};
use crate::features::{self, Method};
use crate::metrics::ConfusionMatrix;
use crate::svm::Gamma;
use crate::{io, plotting, thread_pool, Dataset, FeatureSettings, Label, Result, Settings};
use log::*;
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct SiftSvmOptions {
    /// Training images used per class, all of them when `None`.
    pub images_per_class: Option<usize>,
    pub c: f64,
    pub gamma: f64,
    /// Artifact name of the trained model. The confusion matrix is saved as `{model_name}_cm`.
    pub model_name: String,
    /// Where to draw the normalized confusion matrix.
    pub plot: Option<PathBuf>,
}

impl Default for SiftSvmOptions {
    fn default() -> Self {
        Self {
            images_per_class: Some(30),
            c: 5.0,
            gamma: 0.1,
            model_name: "final_noprob_sift_30_svm".to_owned(),
            plot: None,
        }
    }
}

/// Predicts the label of one test image, `None` when no keypoint was found.
fn classify_image(
    path: &std::path::Path,
    trained: &TrainedSvm,
    settings: &FeatureSettings,
) -> Result<Option<Label>> {
    let image = io::load_image(path)?;
    let features = features::sift(&image, settings)?;
    if features.is_empty() {
        warn!("no keypoints found in {}", path.display());
        return Ok(None);
    }
    let predictions = trained.predict(features.descriptors.view())?;
    Ok(majority_vote(&predictions))
}

/// Classifies every test image in parallel.
///
/// Images without descriptors count as misclassified and are left out of the confusion matrix.
pub fn evaluate(
    test: &Dataset,
    trained: &TrainedSvm,
    settings: &FeatureSettings,
    n_jobs: usize,
) -> Result<Evaluation> {
    let pool = thread_pool(n_jobs)?;
    let predicted: Vec<Option<Label>> = pool.install(|| {
        test.filenames
            .par_iter()
            .map(|path| classify_image(path, trained, settings))
            .collect::<Result<_>>()
    })?;

    let (expected, predicted): (Vec<Label>, Vec<Label>) = test
        .labels
        .iter()
        .zip(predicted)
        .filter_map(|(e, p)| p.map(|p| (e.clone(), p)))
        .unzip();
    let correct = expected.iter().zip(&predicted).filter(|(e, p)| e == p).count();
    let accuracy = if test.is_empty() {
        0.0
    } else {
        correct as f64 * 100.0 / test.len() as f64
    };
    let confusion = ConfusionMatrix::new(&expected, &predicted, trained.classes())?;
    Ok(Evaluation {
        accuracy,
        confusion,
    })
}

pub fn run(settings: &Settings, options: &SiftSvmOptions) -> Result<Evaluation> {
    let start = Instant::now();
    let models = settings.models();

    let train = io::load_training_set(&settings.dataset_dir)?;
    info!("loaded {} train images", train.len());
    let set = features::extract(
        &train,
        Method::Sift,
        &settings.features,
        options.images_per_class,
        settings.n_jobs,
    )?;

    let stage = Instant::now();
    let pool = thread_pool(settings.n_jobs)?;
    let trained = pool.install(|| {
        train_rbf_svm(
            &models,
            set.descriptors.view(),
            &set.descriptor_labels(),
            options.c,
            Gamma::Value(options.gamma),
            TrainOptions {
                model_name: Some(options.model_name.clone()),
                ..Default::default()
            },
        )
    })?;
    info!("classifier ready in {:.2} s", stage.elapsed().as_secs_f64());

    let test = io::load_test_set(&settings.dataset_dir)?;
    info!("loaded {} test images", test.len());
    let stage = Instant::now();
    let evaluation = evaluate(&test, &trained, &settings.features, settings.n_jobs)?;
    info!("test set predicted in {:.2} s", stage.elapsed().as_secs_f64());

    models.save(&format!("{}_cm", options.model_name), &evaluation.confusion)?;
    if let Some(path) = &options.plot {
        plotting::plot_confusion_matrix(&evaluation.confusion, true, path)?;
    }

    info!("accuracy: {:.2}", evaluation.accuracy);
    info!("total time: {:.2} s", start.elapsed().as_secs_f64());
    Ok(evaluation)
}
