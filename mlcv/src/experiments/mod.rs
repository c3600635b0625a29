//! End to end experiments built from the library stages.
//!
//! Every experiment reads its data and directories from [`crate::Settings`] and caches
//! trained models by name, so a second run only redoes the work whose artifacts are missing.

pub mod bovw_svm;
pub mod fisher_sweep;
pub mod sift_svm;

use crate::metrics::ConfusionMatrix;
use crate::Label;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Test set outcome of a trained pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Percentage of correctly classified test images.
    pub accuracy: f64,
    pub confusion: ConfusionMatrix,
}

/// The most frequent label, ties going to the label that sorts first.
///
/// `None` when there is nothing to vote on.
pub fn majority_vote(predictions: &[Label]) -> Option<Label> {
    let mut counts: BTreeMap<&Label, usize> = BTreeMap::new();
    for label in predictions {
        *counts.entry(label).or_insert(0) += 1;
    }
    let mut best: Option<(&Label, usize)> = None;
    for (label, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((label, count));
        }
    }
    best.map(|(label, _)| label.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<Label> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn vote_picks_most_frequent() {
        assert_eq!(
            majority_vote(&labels(&["coast", "forest", "forest", "city"])),
            Some("forest".to_owned())
        );
    }

    #[test]
    fn vote_ties_go_to_smallest_label() {
        assert_eq!(
            majority_vote(&labels(&["street", "coast", "street", "coast"])),
            Some("coast".to_owned())
        );
        assert_eq!(majority_vote(&[]), None);
    }
}
