use super::{argmax_first, encode_labels};
use crate::{Error, Label, Result};
use log::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSvcParams {
    pub c: f64,
    pub tolerance: f64,
    /// Passes over the training set.
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for LinearSvcParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            tolerance: 1e-4,
            max_iterations: 5000,
            seed: 0,
        }
    }
}

/// Linear SVM with squared hinge loss, one machine per class against the rest.
///
/// With two classes a single machine is trained and positive decisions go to the second class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSvc {
    classes: Vec<Label>,
    /// One weight vector per machine.
    weights: Array2<f64>,
    intercepts: Array1<f64>,
}

/// Dual coordinate descent (Hsieh et al. 2008) for the L2-loss SVM.
///
/// The intercept is learned as the weight of a constant feature.
fn train_binary(
    x: ArrayView2<f64>,
    y: &[f64],
    params: &LinearSvcParams,
    rng: &mut Pcg64,
) -> (Array1<f64>, f64) {
    let n = x.nrows();
    let diagonal = 0.5 / params.c;
    let qd: Vec<f64> = x
        .outer_iter()
        .map(|row| row.dot(&row) + 1.0 + diagonal)
        .collect();
    let mut w = Array1::<f64>::zeros(x.ncols());
    let mut b = 0.0;
    let mut alpha = vec![0.0; n];
    let mut order: Vec<usize> = (0..n).collect();

    for iteration in 0..params.max_iterations {
        order.shuffle(rng);
        let mut pg_max = f64::NEG_INFINITY;
        let mut pg_min = f64::INFINITY;
        for &i in &order {
            let xi = x.row(i);
            let g = y[i] * (w.dot(&xi) + b) - 1.0 + diagonal * alpha[i];
            let pg = if alpha[i] == 0.0 { g.min(0.0) } else { g };
            pg_max = pg_max.max(pg);
            pg_min = pg_min.min(pg);
            if pg.abs() > 1e-12 {
                let old = alpha[i];
                alpha[i] = (alpha[i] - g / qd[i]).max(0.0);
                let step = (alpha[i] - old) * y[i];
                w.scaled_add(step, &xi);
                b += step;
            }
        }
        if pg_max - pg_min <= params.tolerance {
            debug!("linear svm converged after {} passes", iteration + 1);
            return (w, b);
        }
    }
    warn!(
        "linear svm did not converge in {} passes, consider more iterations",
        params.max_iterations
    );
    (w, b)
}

impl LinearSvc {
    pub fn fit(x: ArrayView2<f64>, y: &[Label], params: &LinearSvcParams) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(Error::shape(
                format!("{} labels", x.nrows()),
                format!("{} labels", y.len()),
            ));
        }
        if params.c <= 0.0 {
            return Err(Error::invalid("c", format!("{} is not positive", params.c)));
        }
        let (classes, encoded) = encode_labels(y);
        if classes.len() < 2 {
            return Err(Error::SingleClass(classes.len()));
        }
        let positives: Vec<usize> = if classes.len() == 2 {
            vec![1]
        } else {
            (0..classes.len()).collect()
        };

        let mut rng = Pcg64::seed_from_u64(params.seed);
        let mut weights = Array2::zeros((positives.len(), x.ncols()));
        let mut intercepts = Array1::zeros(positives.len());
        for (m, &positive) in positives.iter().enumerate() {
            let targets: Vec<f64> = encoded
                .iter()
                .map(|&c| if c == positive { 1.0 } else { -1.0 })
                .collect();
            let (w, b) = train_binary(x, &targets, params, &mut rng);
            weights.row_mut(m).assign(&w);
            intercepts[m] = b;
        }
        Ok(Self {
            classes,
            weights,
            intercepts,
        })
    }

    pub fn classes(&self) -> &[Label] {
        &self.classes
    }

    pub fn coef(&self) -> ArrayView2<f64> {
        self.weights.view()
    }

    pub fn intercept(&self) -> ArrayView1<f64> {
        self.intercepts.view()
    }

    /// Decision value of every machine, one column per machine.
    pub fn decision_function(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.weights.ncols() {
            return Err(Error::shape(
                format!("{} columns", self.weights.ncols()),
                format!("{} columns", x.ncols()),
            ));
        }
        Ok(x.dot(&self.weights.t()) + &self.intercepts)
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<Label>> {
        let decisions = self.decision_function(x)?;
        Ok(decisions
            .outer_iter()
            .map(|row| {
                let class = if self.weights.nrows() == 1 {
                    usize::from(row[0] > 0.0)
                } else {
                    argmax_first(&row.to_vec())
                };
                self.classes[class].clone()
            })
            .collect())
    }
}
