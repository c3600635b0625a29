use super::Kernel;
use ndarray::ArrayView2;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Curvature used in place of a non-positive one (non PSD kernels such as the sigmoid).
const TAU: f64 = 1e-12;

enum RowSource<'a> {
    Features {
        x: ArrayView2<'a, f64>,
        kernel: Kernel,
    },
    Precomputed(ArrayView2<'a, f64>),
}

/// Kernel rows of a training sub-problem, computed on demand and kept in a bounded cache.
pub(crate) struct KernelRows<'a> {
    source: RowSource<'a>,
    /// Training set index of every sample of the sub-problem.
    indices: Vec<usize>,
    cache: HashMap<usize, Rc<Vec<f64>>>,
    order: VecDeque<usize>,
    capacity: usize,
    diagonal: Vec<f64>,
}

impl<'a> KernelRows<'a> {
    pub fn features(
        x: ArrayView2<'a, f64>,
        kernel: Kernel,
        indices: Vec<usize>,
        capacity: usize,
    ) -> Self {
        let diagonal = indices
            .iter()
            .map(|&i| kernel.compute(x.row(i), x.row(i)))
            .collect();
        Self::new(RowSource::Features { x, kernel }, indices, capacity, diagonal)
    }

    pub fn precomputed(gram: ArrayView2<'a, f64>, indices: Vec<usize>, capacity: usize) -> Self {
        let diagonal = indices.iter().map(|&i| gram[(i, i)]).collect();
        Self::new(RowSource::Precomputed(gram), indices, capacity, diagonal)
    }

    fn new(source: RowSource<'a>, indices: Vec<usize>, capacity: usize, diagonal: Vec<f64>) -> Self {
        Self {
            source,
            indices,
            cache: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(2),
            diagonal,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Gives back the training set indices of the sub-problem.
    pub fn into_indices(self) -> Vec<usize> {
        self.indices
    }

    pub fn diagonal(&self) -> &[f64] {
        &self.diagonal
    }

    /// Kernel values between sample `i` and every sample of the sub-problem.
    pub fn row(&mut self, i: usize) -> Rc<Vec<f64>> {
        if let Some(row) = self.cache.get(&i) {
            return row.clone();
        }
        let gi = self.indices[i];
        let row: Vec<f64> = match &self.source {
            RowSource::Features { x, kernel } => self
                .indices
                .iter()
                .map(|&gj| kernel.compute(x.row(gi), x.row(gj)))
                .collect(),
            RowSource::Precomputed(gram) => self.indices.iter().map(|&gj| gram[(gi, gj)]).collect(),
        };
        let row = Rc::new(row);
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.cache.remove(&evicted);
            }
        }
        self.order.push_back(i);
        self.cache.insert(i, row.clone());
        row
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Solution {
    pub alpha: Vec<f64>,
    pub rho: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Solves the C-SVC dual with sequential minimal optimization.
///
/// `y` holds +1/-1 targets. Pairs are picked with the second order working set
/// selection of Fan, Chen and Lin (2005). The decision function of the result is
/// `sum_i alpha_i y_i K(x_i, x) - rho`.
pub(crate) fn solve(
    rows: &mut KernelRows,
    y: &[f64],
    c: f64,
    eps: f64,
    max_iterations: usize,
) -> Solution {
    let n = y.len();
    debug_assert_eq!(n, rows.len());
    let qd = rows.diagonal().to_vec();
    let mut alpha = vec![0.0; n];
    // Gradient of the dual objective 0.5 a'Qa - e'a.
    let mut grad = vec![-1.0; n];
    let mut iterations = 0;
    let mut converged = false;

    while iterations < max_iterations {
        let Some((i, j)) = select_working_set(rows, y, &alpha, &grad, &qd, c, eps) else {
            converged = true;
            break;
        };
        iterations += 1;

        let ki = rows.row(i);
        let kj = rows.row(j);
        let (old_ai, old_aj) = (alpha[i], alpha[j]);
        let quad = match qd[i] + qd[j] - 2.0 * ki[j] {
            q if q > 0.0 => q,
            _ => TAU,
        };

        if y[i] != y[j] {
            let delta = (-grad[i] - grad[j]) / quad;
            let diff = alpha[i] - alpha[j];
            alpha[i] += delta;
            alpha[j] += delta;
            if diff > 0.0 {
                if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = diff;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = -diff;
            }
            if diff > 0.0 {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = c - diff;
                }
            } else if alpha[j] > c {
                alpha[j] = c;
                alpha[i] = c + diff;
            }
        } else {
            let delta = (grad[i] - grad[j]) / quad;
            let sum = alpha[i] + alpha[j];
            alpha[i] -= delta;
            alpha[j] += delta;
            if sum > c {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = sum - c;
                }
            } else if alpha[j] < 0.0 {
                alpha[j] = 0.0;
                alpha[i] = sum;
            }
            if sum > c {
                if alpha[j] > c {
                    alpha[j] = c;
                    alpha[i] = sum - c;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = sum;
            }
        }

        let delta_i = (alpha[i] - old_ai) * y[i];
        let delta_j = (alpha[j] - old_aj) * y[j];
        for (k, g) in grad.iter_mut().enumerate() {
            *g += y[k] * (ki[k] * delta_i + kj[k] * delta_j);
        }
    }

    let rho = compute_rho(y, &alpha, &grad, c);
    Solution {
        alpha,
        rho,
        iterations,
        converged,
    }
}

fn select_working_set(
    rows: &mut KernelRows,
    y: &[f64],
    alpha: &[f64],
    grad: &[f64],
    qd: &[f64],
    c: f64,
    eps: f64,
) -> Option<(usize, usize)> {
    let mut gmax = f64::NEG_INFINITY;
    let mut selected_i = None;
    for t in 0..y.len() {
        if y[t] > 0.0 {
            if alpha[t] < c && -grad[t] >= gmax {
                gmax = -grad[t];
                selected_i = Some(t);
            }
        } else if alpha[t] > 0.0 && grad[t] >= gmax {
            gmax = grad[t];
            selected_i = Some(t);
        }
    }
    let i = selected_i?;
    let ki = rows.row(i);

    let mut gmax2 = f64::NEG_INFINITY;
    let mut selected_j = None;
    let mut obj_diff_min = f64::INFINITY;
    for t in 0..y.len() {
        let grad_diff = if y[t] > 0.0 {
            if alpha[t] <= 0.0 {
                continue;
            }
            gmax2 = gmax2.max(grad[t]);
            gmax + grad[t]
        } else {
            if alpha[t] >= c {
                continue;
            }
            gmax2 = gmax2.max(-grad[t]);
            gmax - grad[t]
        };
        if grad_diff > 0.0 {
            let quad = match qd[i] + qd[t] - 2.0 * ki[t] {
                q if q > 0.0 => q,
                _ => TAU,
            };
            let obj_diff = -(grad_diff * grad_diff) / quad;
            if obj_diff <= obj_diff_min {
                obj_diff_min = obj_diff;
                selected_j = Some(t);
            }
        }
    }

    if gmax + gmax2 < eps {
        return None;
    }
    selected_j.map(|j| (i, j))
}

fn compute_rho(y: &[f64], alpha: &[f64], grad: &[f64], c: f64) -> f64 {
    let mut upper = f64::INFINITY;
    let mut lower = f64::NEG_INFINITY;
    let mut free_sum = 0.0;
    let mut free_count = 0usize;
    for ((&yi, &ai), &gi) in y.iter().zip(alpha).zip(grad) {
        let yg = yi * gi;
        let at_upper = ai >= c;
        let at_lower = ai <= 0.0;
        if at_upper || at_lower {
            // A variable at its upper bound bounds rho from the opposite side of one at its lower bound.
            if (at_upper && yi < 0.0) || (at_lower && yi > 0.0) {
                upper = upper.min(yg);
            } else {
                lower = lower.max(yg);
            }
        } else {
            free_count += 1;
            free_sum += yg;
        }
    }
    if free_count > 0 {
        free_sum / free_count as f64
    } else {
        (upper + lower) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn separates_two_points() {
        let x = array![[1.0], [-1.0]];
        let mut rows = KernelRows::features(x.view(), Kernel::Linear, vec![0, 1], 8);
        let solution = solve(&mut rows, &[1.0, -1.0], 10.0, 1e-3, 1000);
        assert!(solution.converged);
        // w = sum a_i y_i x_i = 1 and b = 0 for the maximum margin separator.
        assert!((solution.alpha[0] - 0.5).abs() < 1e-6);
        assert!((solution.alpha[1] - 0.5).abs() < 1e-6);
        assert!(solution.rho.abs() < 1e-6);
    }

    #[test]
    fn box_constraint_holds() {
        // Overlapping classes force alphas to the upper bound.
        let x = array![[0.0], [0.1], [0.05], [0.12]];
        let mut rows = KernelRows::features(x.view(), Kernel::Linear, vec![0, 1, 2, 3], 2);
        let y = [1.0, -1.0, -1.0, 1.0];
        let c = 0.5;
        let solution = solve(&mut rows, &y, c, 1e-3, 10_000);
        assert!(solution.alpha.iter().all(|&a| (0.0..=c).contains(&a)));
        let balance: f64 = solution.alpha.iter().zip(&y).map(|(a, y)| a * y).sum();
        assert!(balance.abs() < 1e-9);
    }

    #[test]
    fn row_cache_evicts_oldest() {
        let gram = array![[1.0, 2.0, 3.0], [2.0, 1.0, 4.0], [3.0, 4.0, 1.0]];
        let mut rows = KernelRows::precomputed(gram.view(), vec![0, 2], 2);
        assert_eq!(*rows.row(1), vec![3.0, 1.0]);
        assert_eq!(*rows.row(0), vec![1.0, 3.0]);
        assert_eq!(rows.diagonal(), &[1.0, 1.0]);
        assert_eq!(rows.cache.len(), 2);
        assert_eq!(rows.into_indices(), vec![0, 2]);
    }
}
