//! Turning judged rubric trees into per-candidate scores and verdicts.

use crate::chunking::numbered_ids;
use crate::judgment::{JudgedNode, JudgedResponse, LeafValue, Preference, RubricScope};
use crate::rubric::{Branch, RubricTree};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Outcome of comparing two candidates; also the ground-truth label type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    ModelA,
    ModelB,
    Tie,
}

impl Verdict {
    pub const ALL: [Verdict; 3] = [Verdict::ModelA, Verdict::ModelB, Verdict::Tie];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModelA => "model_a",
            Self::ModelB => "model_b",
            Self::Tie => "tie",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-branch weights of the final score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchWeights {
    #[serde(default = "default_weight")]
    pub intention: f64,
    #[serde(default = "default_weight", rename = "static")]
    pub static_: f64,
    #[serde(default = "default_weight")]
    pub dynamic: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for BranchWeights {
    fn default() -> Self {
        Self {
            intention: 1.0,
            static_: 1.0,
            dynamic: 1.0,
        }
    }
}

impl BranchWeights {
    pub fn get(&self, branch: Branch) -> f64 {
        match branch {
            Branch::Intention => self.intention,
            Branch::Static => self.static_,
            Branch::Dynamic => self.dynamic,
        }
    }
}

/// Scoring parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Margin one score must exceed the other by to win
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub weights: BranchWeights,
    /// Margin for the summed Likert ratings
    #[serde(default = "default_likert_threshold")]
    pub likert_threshold: f64,
}

fn default_likert_threshold() -> f64 {
    1.0
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            weights: BranchWeights::default(),
            likert_threshold: default_likert_threshold(),
        }
    }
}

/// `a` wins when it exceeds `b` by more than `threshold`, and vice versa.
pub fn compare(a: f64, b: f64, threshold: f64) -> Verdict {
    if a > b + threshold {
        Verdict::ModelA
    } else if b > a + threshold {
        Verdict::ModelB
    } else {
        Verdict::Tie
    }
}

/// Number of leaves judged `true`.
pub fn count_true(node: &JudgedNode) -> usize {
    match node {
        JudgedNode::Leaf { value, .. } => usize::from(*value == LeafValue::Met(true)),
        JudgedNode::Internal { children, .. } => children.iter().map(count_true).sum(),
    }
}

/// Number of leaves preferring A and B. Ties count for neither.
pub fn count_preferences(node: &JudgedNode) -> (usize, usize) {
    match node {
        JudgedNode::Leaf { value, .. } => match value {
            LeafValue::Preference(Preference::A) => (1, 0),
            LeafValue::Preference(Preference::B) => (0, 1),
            _ => (0, 0),
        },
        JudgedNode::Internal { children, .. } => children
            .iter()
            .map(count_preferences)
            .fold((0, 0), |(a, b), (ca, cb)| (a + ca, b + cb)),
    }
}

/// Weighted sum of `count / leaf_count` over the judged branches. Branches
/// without leaves contribute nothing.
fn weighted_sum(
    tree: &RubricTree,
    counts: &BTreeMap<Branch, usize>,
    weights: &BranchWeights,
) -> f64 {
    counts
        .iter()
        .filter_map(|(branch, count)| {
            let leaves = tree.branch(*branch).leaf_count();
            (leaves > 0).then(|| weights.get(*branch) * *count as f64 / leaves as f64)
        })
        .sum()
}

/// Final pointwise score of one candidate.
///
/// Combined scope normalises each branch by its leaf count; a single scope
/// scores the raw count of met leaves.
pub fn pointwise_score(
    tree: &RubricTree,
    response: &JudgedResponse,
    scope: RubricScope,
    config: &ScoringConfig,
) -> f64 {
    let counts: BTreeMap<Branch, usize> = response
        .branches
        .iter()
        .map(|(branch, node)| (*branch, count_true(node)))
        .collect();
    match scope {
        RubricScope::Combined => weighted_sum(tree, &counts, &config.weights),
        _ => counts.values().sum::<usize>() as f64,
    }
}

/// Final pairwise scores of candidates A and B.
pub fn pairwise_scores(
    tree: &RubricTree,
    response: &JudgedResponse,
    scope: RubricScope,
    config: &ScoringConfig,
) -> (f64, f64) {
    let mut counts_a = BTreeMap::new();
    let mut counts_b = BTreeMap::new();
    for (branch, node) in &response.branches {
        let (a, b) = count_preferences(node);
        counts_a.insert(*branch, a);
        counts_b.insert(*branch, b);
    }
    match scope {
        RubricScope::Combined => (
            weighted_sum(tree, &counts_a, &config.weights),
            weighted_sum(tree, &counts_b, &config.weights),
        ),
        _ => (
            counts_a.values().sum::<usize>() as f64,
            counts_b.values().sum::<usize>() as f64,
        ),
    }
}

pub fn pairwise_verdict(
    tree: &RubricTree,
    response: &JudgedResponse,
    scope: RubricScope,
    config: &ScoringConfig,
) -> Verdict {
    let (a, b) = pairwise_scores(tree, response, scope, config);
    compare(a, b, config.threshold)
}

// GUI agent track

/// Completed dynamic checks of one candidate, by interaction group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicCount {
    pub basic: usize,
    pub complex: usize,
}

/// Per-candidate agent result, persisted as `result.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub static_elements_list: Vec<String>,
    pub dynamic_count: DynamicCount,
    pub intention_count: usize,
}

/// Reference counts an agent result is normalised against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReference {
    pub static_leaf_ids: BTreeSet<String>,
    pub intention_leaves: usize,
    pub dynamic_leaves: usize,
}

impl AgentReference {
    pub fn from_tree(tree: &RubricTree) -> Self {
        let (_, leaf_ids) = numbered_ids(tree.branch(Branch::Static));
        Self {
            static_leaf_ids: leaf_ids.into_iter().collect(),
            intention_leaves: tree.branch(Branch::Intention).leaf_count(),
            dynamic_leaves: tree.branch(Branch::Dynamic).leaf_count(),
        }
    }
}

/// Raw agent sub-scores before normalisation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSubScores {
    #[serde(rename = "static")]
    pub static_: usize,
    pub dynamic: usize,
    pub intention: usize,
}

impl AgentSubScores {
    /// Found static ids are deduplicated and restricted to reference leaves;
    /// complex interactions count double.
    pub fn compute(result: &CandidateResult, reference: &AgentReference) -> Self {
        let found: BTreeSet<&str> = result
            .static_elements_list
            .iter()
            .map(String::as_str)
            .collect();
        let static_ = reference
            .static_leaf_ids
            .iter()
            .filter(|id| found.contains(id.as_str()))
            .count();
        Self {
            static_,
            dynamic: result.dynamic_count.basic + 2 * result.dynamic_count.complex,
            intention: result.intention_count,
        }
    }

    pub fn normalized(&self, reference: &AgentReference, weights: &BranchWeights) -> f64 {
        let ratio = |count: usize, total: usize| {
            if total == 0 {
                0.0
            } else {
                count as f64 / total as f64
            }
        };
        weights.intention * ratio(self.intention, reference.intention_leaves)
            + weights.static_ * ratio(self.static_, reference.static_leaf_ids.len())
            + weights.dynamic * ratio(self.dynamic, reference.dynamic_leaves)
    }
}

fn element_id() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)*").expect("static regex"))
}

const FINISH_MARKER: &str = "finished(content=";

/// Pull dotted element ids out of an agent's final `finished` turn.
///
/// Returns `None` when the text holds no `finished(content=` marker. Only
/// the text after the last marker is scanned. An id must stand alone: it may
/// not touch a word character or a dot on either side.
pub fn extract_static_elements(text: &str) -> Option<Vec<String>> {
    let start = text.rfind(FINISH_MARKER)? + FINISH_MARKER.len();
    let tail = &text[start..];
    let is_glued = |c: char| c.is_alphanumeric() || c == '_' || c == '.';

    let ids = element_id()
        .find_iter(tail)
        .filter(|m| {
            let before = tail[..m.start()].chars().next_back();
            let after = tail[m.end()..].chars().next();
            !before.is_some_and(is_glued) && !after.is_some_and(is_glued)
        })
        .map(|m| m.as_str().to_string())
        .collect();
    Some(ids)
}
