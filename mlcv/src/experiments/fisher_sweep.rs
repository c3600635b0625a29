//! Sweep over dense sampling step, PCA dimension and mixture size for Fisher vectors
//! classified by a histogram intersection SVM.
//!
//! Every configuration is scored by a randomized search over C. The results of all
//! configurations and the best parameters are kept in the cache store so that the
//! curves can be plotted later without retraining.

use crate::bovw::{self, Normalization};
use crate::features::{self, Method};
use crate::kernels::intersection_kernel;
use crate::plotting::{self, ErrorBarPanel};
use crate::preprocessing::StandardScaler;
use crate::reduction::Pca;
use crate::search::{CvResults, LogSpace, RandomizedSearch};
use crate::svm::{Kernel, SvcParams};
use crate::{io, thread_pool, Error, FeatureSettings, Result, Settings};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

pub const SWEEP_RESULTS: &str = "intersection_svm_optimization_fisher_vectors_power";
pub const BEST_PARAMS: &str = "best_params_intersection_svm_optimization_fisher_vectors_power";

/// Seconds spent in every stage of one configuration.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub sift: f64,
    pub pca: f64,
    pub gmm: f64,
    pub fisher: f64,
    pub scaler: f64,
    pub crossvalidation: f64,
}

impl StageTimings {
    pub fn total(&self) -> f64 {
        self.sift + self.pca + self.gmm + self.fisher + self.scaler + self.crossvalidation
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepEntry {
    pub cv_results: CvResults,
    pub timings: StageTimings,
}

/// Configuration `(codebook size, pca dimension, dense step)` of a sweep entry.
pub type SweepKey = (usize, usize, usize);

pub type SweepResults = BTreeMap<SweepKey, SweepEntry>;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestParams {
    pub k: usize,
    pub c: f64,
    pub pca: usize,
    pub dense_grid: usize,
    /// Mean cross validation accuracy, as a fraction.
    pub accuracy: f64,
}

fn elapsed(start: Instant) -> f64 {
    let seconds = start.elapsed().as_secs_f64();
    info!("elapsed time: {:.2} s", seconds);
    seconds
}

/// Runs the whole sweep and returns the best configuration.
pub fn train(settings: &Settings) -> Result<BestParams> {
    let models = settings.models();
    let cache = settings.cache();
    let pool = thread_pool(settings.n_jobs)?;
    let search = RandomizedSearch {
        distribution: LogSpace {
            start: settings.c_log_start,
            stop: settings.c_log_stop,
            num: settings.c_log_num,
        },
        n_iter: settings.search_iterations,
        folds: settings.search_folds,
        seed: settings.seed,
        n_jobs: settings.n_jobs,
    };

    let train = io::load_training_set(&settings.dataset_dir)?;
    info!("loaded {} train images", train.len());

    let mut results = SweepResults::new();
    let mut best: Option<BestParams> = None;

    for &ds in &settings.dense_sampling_densities {
        info!("obtaining dense features with sampling step {}", ds);
        let start = Instant::now();
        let feature_settings = FeatureSettings {
            dense_sampling_density: ds,
            ..settings.features
        };
        let set = cache.load_or_compute(&format!("train_dense_descriptors_{ds}"), || {
            features::extract(&train, Method::Dense, &feature_settings, None, settings.n_jobs)
        })?;
        let sift_time = elapsed(start);

        for &dim in &settings.pca_reductions {
            info!("applying pca (dim = {})", dim);
            let start = Instant::now();
            let reduced = pool.install(|| -> Result<_> {
                let pca = Pca::fit(set.descriptors.view(), dim)?;
                set.with_descriptors(pca.transform(set.descriptors.view())?)
            })?;
            let pca_time = elapsed(start);

            for &k in &settings.codebook_sizes {
                info!("creating gmm model (k = {})", k);
                let start = Instant::now();
                let gmm = pool.install(|| {
                    bovw::create_gmm(
                        &models,
                        &format!("gmm_{k}_dense_{ds}_pca_{dim}"),
                        reduced.descriptors.view(),
                        k,
                        settings.seed,
                    )
                })?;
                let gmm_time = elapsed(start);

                info!("encoding fisher vectors of the training set");
                let start = Instant::now();
                let (fisher, labels) = pool.install(|| {
                    bovw::fisher_vectors(&reduced, &gmm, Normalization::Power)
                })?;
                let fisher_time = elapsed(start);

                info!("scaling features");
                let start = Instant::now();
                let (_, scaled) = StandardScaler::fit_transform(fisher.view())?;
                let scaler_time = elapsed(start);

                info!("optimizing svm hyperparameters");
                let start = Instant::now();
                let gram = pool.install(|| intersection_kernel(scaled.view(), scaled.view()))?;
                let cv_results = search.fit(gram.view(), &labels, |c| SvcParams {
                    c,
                    kernel: Kernel::Precomputed,
                    ..Default::default()
                })?;
                let crossvalidation_time = elapsed(start);

                let score = cv_results.best_score();
                if best.map_or(true, |b| score > b.accuracy) {
                    best = Some(BestParams {
                        k,
                        c: cv_results.best_c(),
                        pca: dim,
                        dense_grid: ds,
                        accuracy: score,
                    });
                }
                results.insert(
                    (k, dim, ds),
                    SweepEntry {
                        cv_results,
                        timings: StageTimings {
                            sift: sift_time,
                            pca: pca_time,
                            gmm: gmm_time,
                            fisher: fisher_time,
                            scaler: scaler_time,
                            crossvalidation: crossvalidation_time,
                        },
                    },
                );
                cache.save(SWEEP_RESULTS, &results)?;
                info!("-------------------------------");
            }
        }
    }

    let best = best.ok_or(Error::EmptyInput("the sweep has no configuration to try"))?;
    info!("best params");
    info!(
        "k={}, C={}, dim_red={}, dense_grid={} --> accuracy: {:.3}",
        best.k, best.c, best.pca, best.dense_grid, best.accuracy
    );
    let path = cache.save(BEST_PARAMS, &best)?;
    info!("saved best parameters at {}", path.display());
    let path = cache.save(SWEEP_RESULTS, &results)?;
    info!("saved all cross-validation values at {}", path.display());
    Ok(best)
}

/// Curve of one codebook size, points ordered by increasing C.
pub fn panel(k: usize, entry: &SweepEntry) -> ErrorBarPanel {
    let results = &entry.cv_results;
    let order = results.sorted_by_c();
    ErrorBarPanel {
        title: format!("{k} Gaussians in GMM"),
        c: order.iter().map(|&i| results.param_c[i]).collect(),
        mean: order.iter().map(|&i| results.mean_test_score[i]).collect(),
        std: order.iter().map(|&i| results.std_test_score[i]).collect(),
    }
}

fn log_summary(k: usize, entry: &SweepEntry) {
    let results = &entry.cv_results;
    let timings = &entry.timings;
    info!("codebook {}", k);
    info!("-------------");
    info!("mean accuracy: {}", results.best_score());
    info!("std accuracy: {}", results.std_test_score[results.best_index]);
    info!("C: {}", results.best_c());
    info!("timing");
    info!("\tsift time: {:.2} s", timings.sift);
    info!("\tpca time: {:.2} s", timings.pca);
    info!("\tgmm time: {:.2} s", timings.gmm);
    info!("\tfisher time: {:.2} s", timings.fisher);
    info!("\tscaler time: {:.2} s", timings.scaler);
    info!("\tcv time: {:.2} s", timings.crossvalidation);
    info!("\ttotal time: {:.2} s", timings.total());
}

/// Plots accuracy against C for every codebook size at the best PCA dimension and dense step.
pub fn plot(settings: &Settings, path: impl AsRef<Path>) -> Result<Vec<ErrorBarPanel>> {
    let cache = settings.cache();
    info!("loading cross-validation values");
    let results: SweepResults = cache.load(SWEEP_RESULTS)?;
    info!("loading best parameters");
    let best: BestParams = cache.load(BEST_PARAMS)?;

    let panels: Vec<ErrorBarPanel> = settings
        .codebook_sizes
        .iter()
        .filter_map(|&k| match results.get(&(k, best.pca, best.dense_grid)) {
            Some(entry) => {
                log_summary(k, entry);
                Some(panel(k, entry))
            }
            None => {
                warn!(
                    "no sweep results for k = {}, pca = {}, dense grid = {}",
                    k, best.pca, best.dense_grid
                );
                None
            }
        })
        .collect();
    plotting::plot_error_bars(&panels, path)?;
    Ok(panels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> SweepEntry {
        SweepEntry {
            cv_results: CvResults {
                param_c: vec![1.0, 0.01, 0.1],
                mean_test_score: vec![0.6, 0.4, 0.7],
                std_test_score: vec![0.01, 0.02, 0.03],
                split_test_scores: vec![vec![0.6], vec![0.4], vec![0.7]],
                best_index: 2,
            },
            timings: StageTimings {
                sift: 1.0,
                pca: 0.5,
                gmm: 2.0,
                fisher: 0.25,
                scaler: 0.25,
                crossvalidation: 4.0,
            },
        }
    }

    #[test]
    fn panel_sorted_by_c() {
        let panel = panel(16, &entry());
        assert_eq!(panel.title, "16 Gaussians in GMM");
        assert_eq!(panel.c, vec![0.01, 0.1, 1.0]);
        assert_eq!(panel.mean, vec![0.4, 0.7, 0.6]);
        assert_eq!(panel.std, vec![0.02, 0.03, 0.01]);
        assert_eq!(entry().timings.total(), 8.0);
    }

    #[test]
    fn plot_reads_saved_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_dir: dir.path().join("ignore"),
            codebook_sizes: vec![16, 32],
            ..Default::default()
        };
        let cache = settings.cache();
        let mut results = SweepResults::new();
        results.insert((16, 60, 4), entry());
        results.insert((32, 60, 4), entry());
        results.insert((32, 80, 4), entry());
        cache.save(SWEEP_RESULTS, &results).unwrap();
        cache
            .save(
                BEST_PARAMS,
                &BestParams {
                    k: 32,
                    c: 0.1,
                    pca: 60,
                    dense_grid: 4,
                    accuracy: 0.7,
                },
            )
            .unwrap();
        let path = dir.path().join("sweep.png");
        let panels = plot(&settings, &path).unwrap();
        assert_eq!(panels.len(), 2);
        assert!(path.is_file());
    }

    #[test]
    fn plot_without_sweep_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_dir: dir.path().to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            plot(&settings, dir.path().join("sweep.png")),
            Err(Error::MissingArtifact { .. })
        ));
    }
}
