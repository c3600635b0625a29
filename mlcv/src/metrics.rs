use crate::{Error, Label, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Percentage of predictions equal to the expected label.
pub fn accuracy(expected: &[Label], predicted: &[Label]) -> Result<f64> {
    if expected.len() != predicted.len() {
        return Err(Error::shape(
            format!("{} predictions", expected.len()),
            format!("{} predictions", predicted.len()),
        ));
    }
    if expected.is_empty() {
        return Err(Error::EmptyInput("cannot compute the accuracy of no predictions"));
    }
    Ok(crate::svm::score(expected, predicted) * 100.0)
}

/// Counts of expected (rows) against predicted (columns) labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<Label>,
    pub counts: Array2<u64>,
}

impl ConfusionMatrix {
    /// Pairs whose expected or predicted label is not in `labels` are not counted.
    pub fn new(expected: &[Label], predicted: &[Label], labels: &[Label]) -> Result<Self> {
        if expected.len() != predicted.len() {
            return Err(Error::shape(
                format!("{} predictions", expected.len()),
                format!("{} predictions", predicted.len()),
            ));
        }
        let index: HashMap<&Label, usize> =
            labels.iter().enumerate().map(|(i, l)| (l, i)).collect();
        let mut counts = Array2::zeros((labels.len(), labels.len()));
        for (e, p) in expected.iter().zip(predicted) {
            if let (Some(&row), Some(&column)) = (index.get(e), index.get(p)) {
                counts[(row, column)] += 1;
            }
        }
        Ok(Self {
            labels: labels.to_vec(),
            counts,
        })
    }

    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    /// Every row divided by its sum. Rows without samples stay at zero.
    pub fn normalized(&self) -> Array2<f64> {
        let mut normalized = self.counts.mapv(|c| c as f64);
        for mut row in normalized.outer_iter_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row /= sum;
            }
        }
        normalized
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .labels
            .iter()
            .map(|l| l.len())
            .chain(std::iter::once(self.counts.iter().max().copied().unwrap_or(0).to_string().len()))
            .max()
            .unwrap_or(1);
        write!(f, "{:>width$}", "")?;
        for label in &self.labels {
            write!(f, " {label:>width$}")?;
        }
        writeln!(f)?;
        for (label, row) in self.labels.iter().zip(self.counts.outer_iter()) {
            write!(f, "{label:>width$}")?;
            for count in row {
                write!(f, " {count:>width$}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
