//! Accuracy metrics against ground-truth labels and rubric statistics.

use crate::models::{Prediction, PredictionRow};
use crate::rubric::{Branch, RubricTree};
use crate::scoring::Verdict;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Correct predictions out of judged items for one label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelTally {
    pub correct: usize,
    pub total: usize,
}

/// Agreement of predicted verdicts with labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseMetrics {
    /// Every row, errors included
    pub total: usize,
    pub correct: usize,
    /// `correct / total`; an error counts as a wrong prediction
    pub accuracy: f64,
    /// Mean per-label accuracy over labels with at least one judged item
    pub balanced_accuracy: f64,
    /// Per-label tallies, errors excluded
    pub per_label: BTreeMap<Verdict, LabelTally>,
    /// How often each prediction occurred
    pub predicted: BTreeMap<Prediction, usize>,
    pub errors: usize,
}

impl PairwiseMetrics {
    pub fn from_rows(rows: &[PredictionRow]) -> Self {
        let mut per_label: BTreeMap<Verdict, LabelTally> =
            Verdict::ALL.iter().map(|&v| (v, LabelTally::default())).collect();
        let mut predicted = BTreeMap::new();
        let mut correct = 0;
        let mut errors = 0;

        for row in rows {
            *predicted.entry(row.pred).or_insert(0) += 1;
            let Some(verdict) = row.pred.verdict() else {
                errors += 1;
                continue;
            };
            let tally = per_label.entry(row.label).or_default();
            tally.total += 1;
            if verdict == row.label {
                tally.correct += 1;
                correct += 1;
            }
        }

        let class_accuracies: Vec<f64> = per_label
            .values()
            .filter(|t| t.total > 0)
            .map(|t| ratio(t.correct, t.total))
            .collect();

        Self {
            total: rows.len(),
            correct,
            accuracy: ratio(correct, rows.len()),
            balanced_accuracy: mean(&class_accuracies),
            per_label,
            predicted,
            errors,
        }
    }
}

/// Confusion counts and derived scores of a binary judge
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryMetrics {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
}

impl BinaryMetrics {
    /// Build from `(predicted, actual)` pairs. Zero denominators yield 0.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (bool, bool)>) -> Self {
        let mut metrics = Self::default();
        for (predicted, actual) in pairs {
            match (predicted, actual) {
                (true, true) => metrics.true_positives += 1,
                (true, false) => metrics.false_positives += 1,
                (false, false) => metrics.true_negatives += 1,
                (false, true) => metrics.false_negatives += 1,
            }
        }
        let (tp, fp, tn, fn_) = (
            metrics.true_positives,
            metrics.false_positives,
            metrics.true_negatives,
            metrics.false_negatives,
        );
        metrics.precision = ratio(tp, tp + fp);
        metrics.recall = ratio(tp, tp + fn_);
        metrics.f1 = ratio(2 * tp, 2 * tp + fp + fn_);
        metrics.accuracy = ratio(tp + tn, tp + fp + tn + fn_);
        metrics
    }
}

/// Mean and median of one tree measure
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub mean: f64,
    pub median: f64,
}

impl Summary {
    fn of(values: &[f64]) -> Self {
        Self {
            mean: mean(values),
            median: median(values),
        }
    }
}

/// Height and leaf count of a set of rubric trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricStatistics {
    pub trees: usize,
    pub height: Summary,
    pub leaves: Summary,
    pub branch_height: BTreeMap<Branch, Summary>,
    pub branch_leaves: BTreeMap<Branch, Summary>,
}

impl RubricStatistics {
    pub fn from_trees(trees: &[RubricTree]) -> Self {
        let measure = |f: &dyn Fn(&RubricTree) -> usize| -> Summary {
            let values: Vec<f64> = trees.iter().map(|t| f(t) as f64).collect();
            Summary::of(&values)
        };

        let mut branch_height = BTreeMap::new();
        let mut branch_leaves = BTreeMap::new();
        for branch in Branch::ALL {
            branch_height.insert(branch, measure(&|t: &RubricTree| t.branch(branch).height()));
            branch_leaves.insert(branch, measure(&|t: &RubricTree| t.branch(branch).leaf_count()));
        }

        Self {
            trees: trees.len(),
            height: measure(&RubricTree::height),
            leaves: measure(&RubricTree::leaf_count),
            branch_height,
            branch_leaves,
        }
    }
}
