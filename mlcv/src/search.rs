//! Randomized hyperparameter search over the SVM penalty with stratified cross validation.

use crate::svm::{score, Svc, SvcParams};
use crate::{thread_pool, Error, Label, Result};
use float_ord::FloatOrd;
use log::*;
use ndarray::{ArrayView2, Axis};
use rand::seq::index;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// `num` values evenly spaced in log10 between `10^start` and `10^stop` inclusive.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSpace {
    pub start: f64,
    pub stop: f64,
    pub num: usize,
}

impl LogSpace {
    pub fn value(&self, index: usize) -> f64 {
        let exponent = if self.num <= 1 {
            self.start
        } else {
            self.start + (self.stop - self.start) * index as f64 / (self.num - 1) as f64
        };
        10f64.powf(exponent)
    }

    /// Draws `n` distinct values, uniformly over the indices of the space.
    pub fn sample(&self, n: usize, rng: &mut Pcg64) -> Vec<f64> {
        index::sample(rng, self.num, n.min(self.num))
            .into_iter()
            .map(|i| self.value(i))
            .collect()
    }
}

/// Test indices of every fold, each fold holding about the same class proportions.
///
/// Samples of each class are sorted by position and dealt to the folds in contiguous blocks.
/// Nothing is shuffled, so the folds only depend on the label order.
pub fn stratified_folds(labels: &[Label], n_splits: usize) -> Result<Vec<Vec<usize>>> {
    if n_splits < 2 {
        return Err(Error::invalid("n_splits", "need at least two folds"));
    }
    if n_splits > labels.len() {
        return Err(Error::invalid(
            "n_splits",
            format!("{} folds for {} samples", n_splits, labels.len()),
        ));
    }
    let mut by_class: BTreeMap<&Label, Vec<usize>> = BTreeMap::new();
    for (i, label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }
    let smallest = by_class.values().map(Vec::len).min().unwrap_or(0);
    if smallest < n_splits {
        warn!(
            "the smallest class has {} members, fewer than the {} folds",
            smallest, n_splits
        );
    }

    // Deal the class-sorted sample order round robin to decide how many samples of each
    // class every fold receives.
    let class_order: Vec<usize> = by_class
        .values()
        .enumerate()
        .flat_map(|(class, members)| std::iter::repeat(class).take(members.len()))
        .collect();
    let mut allocation = vec![vec![0usize; by_class.len()]; n_splits];
    for (position, &class) in class_order.iter().enumerate() {
        allocation[position % n_splits][class] += 1;
    }

    let mut folds = vec![Vec::new(); n_splits];
    for (class, members) in by_class.values().enumerate() {
        let mut members = members.iter();
        for (fold, counts) in folds.iter_mut().zip(&allocation) {
            fold.extend(members.by_ref().take(counts[class]));
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    Ok(folds)
}

/// Scores of every sampled candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvResults {
    pub param_c: Vec<f64>,
    pub mean_test_score: Vec<f64>,
    pub std_test_score: Vec<f64>,
    /// Per candidate, the accuracy on every fold.
    pub split_test_scores: Vec<Vec<f64>>,
    /// The first candidate with the highest mean score, candidates whose every fold failed are skipped.
    pub best_index: usize,
}

impl CvResults {
    pub fn best_c(&self) -> f64 {
        self.param_c[self.best_index]
    }

    pub fn best_score(&self) -> f64 {
        self.mean_test_score[self.best_index]
    }

    /// Candidate indices ordered by increasing C.
    pub fn sorted_by_c(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.param_c.len()).collect();
        order.sort_by_key(|&i| FloatOrd(self.param_c[i]));
        order
    }
}

/// Cross validated search over C sampled from a log-spaced grid. The best candidate is not refitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomizedSearch {
    pub distribution: LogSpace,
    pub n_iter: usize,
    pub folds: usize,
    pub seed: u64,
    pub n_jobs: usize,
}

impl RandomizedSearch {
    /// Scores every sampled C by the mean accuracy over the folds.
    ///
    /// `params_for_c` turns a candidate penalty into the SVM parameters. With a precomputed
    /// kernel `x` is the square Gram matrix of all samples and is sliced per fold.
    pub fn fit<F>(&self, x: ArrayView2<f64>, y: &[Label], params_for_c: F) -> Result<CvResults>
    where
        F: Fn(f64) -> SvcParams + Sync,
    {
        if x.nrows() != y.len() {
            return Err(Error::shape(
                format!("{} labels", x.nrows()),
                format!("{} labels", y.len()),
            ));
        }
        if self.n_iter == 0 {
            return Err(Error::invalid("n_iter", "must be positive"));
        }
        if self.distribution.num == 0 {
            return Err(Error::invalid("distribution", "the grid has no values"));
        }
        let start = Instant::now();
        let mut rng = Pcg64::seed_from_u64(self.seed);
        let candidates = self.distribution.sample(self.n_iter, &mut rng);
        let folds = stratified_folds(y, self.folds)?;
        info!(
            "fitting {} folds for each of {} candidates, {} fits in total",
            folds.len(),
            candidates.len(),
            folds.len() * candidates.len()
        );

        let tasks: Vec<(usize, usize)> = (0..candidates.len())
            .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
            .collect();
        let pool = thread_pool(self.n_jobs)?;
        let scores = pool.install(|| {
            tasks
                .par_iter()
                .map(|&(c, f)| {
                    let params = params_for_c(candidates[c]);
                    match fold_score(x, y, &folds[f], &params) {
                        Ok(score) => {
                            debug!("C = {} fold {} accuracy {:.4}", candidates[c], f, score);
                            Ok(score)
                        }
                        Err(Error::SingleClass(n)) => {
                            warn!(
                                "C = {} fold {} trains on {} class, scored as NaN",
                                candidates[c], f, n
                            );
                            Ok(f64::NAN)
                        }
                        Err(e) => Err(e),
                    }
                })
                .collect::<Result<Vec<f64>>>()
        })?;

        let split_test_scores: Vec<Vec<f64>> =
            scores.chunks(folds.len()).map(<[f64]>::to_vec).collect();
        let (mean_test_score, std_test_score): (Vec<f64>, Vec<f64>) =
            split_test_scores.iter().map(|s| nan_mean_std(s)).unzip();
        let best_index = mean_test_score
            .iter()
            .enumerate()
            .filter(|(_, mean)| !mean.is_nan())
            .fold(None, |best: Option<(usize, f64)>, (i, &mean)| match best {
                Some((_, top)) if top >= mean => best,
                _ => Some((i, mean)),
            })
            .map(|(i, _)| i)
            .ok_or(Error::EmptyInput("every fold of every candidate failed"))?;
        info!(
            "best C = {} with mean accuracy {:.4}, search took {:.2} s",
            candidates[best_index],
            mean_test_score[best_index],
            start.elapsed().as_secs_f64()
        );
        Ok(CvResults {
            param_c: candidates,
            mean_test_score,
            std_test_score,
            split_test_scores,
            best_index,
        })
    }
}

/// Mean and population standard deviation of the scores that are not NaN, NaN when none are.
fn nan_mean_std(scores: &[f64]) -> (f64, f64) {
    let valid: Vec<f64> = scores.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = valid.len() as f64;
    let mean = valid.iter().sum::<f64>() / n;
    let var = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Trains on every sample outside `test` and returns the accuracy on `test`.
fn fold_score(x: ArrayView2<f64>, y: &[Label], test: &[usize], params: &SvcParams) -> Result<f64> {
    let mut is_test = vec![false; y.len()];
    for &i in test {
        is_test[i] = true;
    }
    let train: Vec<usize> = (0..y.len()).filter(|&i| !is_test[i]).collect();
    let y_train: Vec<Label> = train.iter().map(|&i| y[i].clone()).collect();
    let y_test: Vec<Label> = test.iter().map(|&i| y[i].clone()).collect();

    let (x_train, x_test) = if params.kernel.is_precomputed() {
        let rows_train = x.select(Axis(0), &train);
        let rows_test = x.select(Axis(0), test);
        (
            rows_train.select(Axis(1), &train),
            rows_test.select(Axis(1), &train),
        )
    } else {
        (x.select(Axis(0), &train), x.select(Axis(0), test))
    };
    let svc = Svc::fit(x_train.view(), &y_train, params)?;
    Ok(score(&y_test, &svc.predict(x_test.view())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::intersection_kernel;
    use crate::svm::Kernel;
    use ndarray::Array2;

    fn labels(names: &[&str]) -> Vec<Label> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn log_space_endpoints() {
        let space = LogSpace {
            start: -3.0,
            stop: 1.0,
            num: 5,
        };
        assert!((space.value(0) - 1e-3).abs() < 1e-15);
        assert!((space.value(2) - 0.1).abs() < 1e-12);
        assert!((space.value(4) - 10.0).abs() < 1e-12);
        let mut rng = Pcg64::seed_from_u64(1);
        let mut values = space.sample(10, &mut rng);
        assert_eq!(values.len(), 5);
        values.sort_by_key(|&v| FloatOrd(v));
        values.dedup();
        assert_eq!(values.len(), 5);
    }

    #[test]
    fn folds_are_stratified_and_disjoint() {
        let y = labels(&["a", "b", "a", "b", "a", "b", "a", "b", "a", "c", "c", "c"]);
        let folds = stratified_folds(&y, 3).unwrap();
        assert_eq!(folds.len(), 3);
        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..12).collect::<Vec<_>>());
        for fold in &folds {
            assert!(fold.iter().any(|&i| y[i] == "c"));
            assert!(fold.iter().any(|&i| y[i] == "b"));
        }
        assert!(stratified_folds(&y, 1).is_err());
        assert!(stratified_folds(&y, 13).is_err());
    }

    #[test]
    fn folds_keep_label_order() {
        let y = labels(&["a", "a", "a", "a", "b", "b", "b", "b"]);
        let folds = stratified_folds(&y, 2).unwrap();
        assert_eq!(folds, vec![vec![0, 1, 4, 5], vec![2, 3, 6, 7]]);
    }

    #[test]
    fn empty_grid_is_rejected() {
        let (x, y) = histograms();
        let search = RandomizedSearch {
            distribution: LogSpace {
                start: -1.0,
                stop: 1.0,
                num: 0,
            },
            n_iter: 3,
            folds: 3,
            seed: 0,
            n_jobs: 1,
        };
        let result = search.fit(x.view(), &y, |c| SvcParams {
            c,
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
    }

    #[test]
    fn single_class_fold_scores_nan() {
        // the lone "b" lands in the last fold, which then trains on "a" alone
        let y = labels(&["a", "a", "a", "a", "a", "b"]);
        let x = Array2::from_shape_fn((6, 2), |(i, j)| {
            if i == 5 {
                1.0 - j as f64
            } else {
                j as f64 + 0.1 * i as f64
            }
        });
        let search = RandomizedSearch {
            distribution: LogSpace {
                start: 0.0,
                stop: 1.0,
                num: 2,
            },
            n_iter: 2,
            folds: 3,
            seed: 7,
            n_jobs: 1,
        };
        let results = search
            .fit(x.view(), &y, |c| SvcParams {
                c,
                kernel: Kernel::Linear,
                ..Default::default()
            })
            .unwrap();
        for (splits, (mean, std)) in results
            .split_test_scores
            .iter()
            .zip(results.mean_test_score.iter().zip(&results.std_test_score))
        {
            assert!(splits[0].is_finite() && splits[1].is_finite());
            assert!(splits[2].is_nan());
            assert!((mean - (splits[0] + splits[1]) / 2.0).abs() < 1e-12);
            assert!(std.is_finite());
        }
        assert!(results.best_score().is_finite());
    }

    #[test]
    fn nan_scores_are_ignored() {
        let (mean, std) = nan_mean_std(&[1.0, f64::NAN, 0.5]);
        assert!((mean - 0.75).abs() < 1e-12);
        assert!((std - 0.25).abs() < 1e-12);
        let (mean, std) = nan_mean_std(&[f64::NAN]);
        assert!(mean.is_nan() && std.is_nan());
    }

    fn histograms() -> (Array2<f64>, Vec<Label>) {
        let x = Array2::from_shape_fn((12, 4), |(i, j)| {
            let class = i % 2;
            let peak = if j == class { 0.7 } else { 0.1 };
            peak + 0.01 * (i as f64)
        });
        let y = (0..12)
            .map(|i| if i % 2 == 0 { "even" } else { "odd" }.to_owned())
            .collect();
        (x, y)
    }

    #[test]
    fn search_on_precomputed_gram() {
        let (x, y) = histograms();
        let gram = intersection_kernel(x.view(), x.view()).unwrap();
        let search = RandomizedSearch {
            distribution: LogSpace {
                start: -1.0,
                stop: 1.0,
                num: 100,
            },
            n_iter: 4,
            folds: 3,
            seed: 42,
            n_jobs: 2,
        };
        let results = search
            .fit(gram.view(), &y, |c| SvcParams {
                c,
                kernel: Kernel::Precomputed,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.param_c.len(), 4);
        assert_eq!(results.split_test_scores.len(), 4);
        assert!(results.split_test_scores.iter().all(|s| s.len() == 3));
        assert!((results.best_score() - 1.0).abs() < 1e-12);
        assert!(results.param_c.iter().all(|&c| (0.1 - 1e-12..=10.0 + 1e-9).contains(&c)));
        let order = results.sorted_by_c();
        assert!(order
            .windows(2)
            .all(|w| results.param_c[w[0]] <= results.param_c[w[1]]));

        let again = search
            .fit(gram.view(), &y, |c| SvcParams {
                c,
                kernel: Kernel::Precomputed,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(again, results);
    }
}
