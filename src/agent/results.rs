//! Turning agent trajectories into per-candidate results, verdicts and
//! cost totals.

use super::prepare::{ComparisonMetadata, TASK_LIST_FILE, TaskGroup, read_path_list};
use super::session::{FinalResult, Trajectory};
use crate::dataset::{read_json, write_json};
use crate::metrics::PairwiseMetrics;
use crate::models::{Candidate, Prediction, PredictionRow, TokenUsage};
use crate::scoring::{
    AgentReference, AgentSubScores, CandidateResult, ScoringConfig, Verdict, compare, extract_static_elements,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const RESULT_FILE: &str = "result.json";
const TRAJECTORY_FILE: &str = "messages.json";

/// Terminal states per task group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalCounts {
    pub groups: BTreeMap<TaskGroup, BTreeMap<FinalResult, usize>>,
    /// Static tasks whose final turn named no elements
    pub static_errors: usize,
    /// Tasks listed but never run
    pub missing: usize,
    pub tasks: usize,
}

impl TerminalCounts {
    fn record(&mut self, group: TaskGroup, result: FinalResult) {
        *self
            .groups
            .entry(group)
            .or_default()
            .entry(result)
            .or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &TerminalCounts) {
        for (group, results) in &other.groups {
            for (result, count) in results {
                *self
                    .groups
                    .entry(*group)
                    .or_default()
                    .entry(*result)
                    .or_insert(0) += count;
            }
        }
        self.static_errors += other.static_errors;
        self.missing += other.missing;
        self.tasks += other.tasks;
    }

    pub fn count(&self, group: TaskGroup, result: FinalResult) -> usize {
        self.groups
            .get(&group)
            .and_then(|results| results.get(&result))
            .copied()
            .unwrap_or(0)
    }
}

/// Read every trajectory of one candidate and write its `result.json`.
pub fn collect_candidate_result(candidate_dir: &Path) -> Result<(CandidateResult, TerminalCounts)> {
    let tasks = read_path_list(&candidate_dir.join(TASK_LIST_FILE))?;
    let mut result = CandidateResult::default();
    let mut counts = TerminalCounts {
        tasks: tasks.len(),
        ..TerminalCounts::default()
    };

    for task_dir in &tasks {
        let Some(group) = TaskGroup::of_task_dir(task_dir) else {
            warn!(task = %task_dir.display(), "task directory outside the known layout");
            counts.missing += 1;
            continue;
        };
        let trajectory: Trajectory = match read_json(&task_dir.join(TRAJECTORY_FILE)) {
            Ok(trajectory) => trajectory,
            Err(err) => {
                warn!(task = %task_dir.display(), error = %err, "no trajectory");
                counts.missing += 1;
                continue;
            }
        };
        let outcome = trajectory.final_result;
        counts.record(group, outcome);

        match group {
            TaskGroup::Intention if outcome == FinalResult::Done => result.intention_count += 1,
            TaskGroup::DynamicBasic if outcome == FinalResult::Done => result.dynamic_count.basic += 1,
            TaskGroup::DynamicComplex if outcome == FinalResult::Done => result.dynamic_count.complex += 1,
            TaskGroup::Static if outcome == FinalResult::Done || outcome.is_response_error() => {
                let found = trajectory
                    .last_message_text()
                    .and_then(|text| extract_static_elements(&text));
                match found {
                    Some(ids) => result.static_elements_list.extend(ids),
                    None => counts.static_errors += 1,
                }
            }
            _ => {}
        }
    }

    write_json(&candidate_dir.join(RESULT_FILE), &result)?;
    Ok((result, counts))
}

/// Collect every candidate directory in `candidate_dirs`, summing the counts
pub fn collect_all(candidate_dirs: &[PathBuf]) -> Result<TerminalCounts> {
    let mut total = TerminalCounts::default();
    for dir in candidate_dirs {
        let (_, counts) = collect_candidate_result(dir)?;
        total.merge(&counts);
    }
    info!(
        candidates = candidate_dirs.len(),
        tasks = total.tasks,
        static_errors = total.static_errors,
        missing = total.missing,
        "collected agent results"
    );
    Ok(total)
}

/// Scored comparison of the agent track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentComparison {
    pub question_id: String,
    pub label: Verdict,
    pub scores: BTreeMap<Candidate, AgentSubScores>,
    pub totals: BTreeMap<Candidate, f64>,
    pub pred: Prediction,
}

/// All comparisons plus accuracy against labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvaluation {
    pub comparisons: Vec<AgentComparison>,
    pub metrics: PairwiseMetrics,
}

impl AgentEvaluation {
    pub fn rows(&self) -> Vec<PredictionRow> {
        self.comparisons
            .iter()
            .map(|c| PredictionRow {
                question_id: c.question_id.clone(),
                label: c.label,
                pred: c.pred,
            })
            .collect()
    }
}

fn score_comparison(comparison_dir: &Path, scoring: &ScoringConfig) -> Result<AgentComparison> {
    let metadata: ComparisonMetadata = read_json(&comparison_dir.join("metadata.json"))?;
    let reference = AgentReference::from_tree(&metadata.rubric);

    let mut scores = BTreeMap::new();
    let mut totals = BTreeMap::new();
    for candidate in Candidate::BOTH {
        let result: CandidateResult = read_json(&comparison_dir.join(candidate.as_str()).join(RESULT_FILE))?;
        let sub_scores = AgentSubScores::compute(&result, &reference);
        totals.insert(candidate, sub_scores.normalized(&reference, &scoring.weights));
        scores.insert(candidate, sub_scores);
    }
    let verdict = compare(totals[&Candidate::A], totals[&Candidate::B], scoring.threshold);

    Ok(AgentComparison {
        question_id: metadata.question_id,
        label: metadata.label,
        scores,
        totals,
        pred: verdict.into(),
    })
}

/// Score every comparison under `base_dir` against its label.
///
/// `labels` gives the comparisons to score in order; a comparison whose
/// results cannot be read is predicted as an error.
pub fn evaluate_agent_results(
    base_dir: &Path,
    labels: &[(String, Verdict)],
    scoring: &ScoringConfig,
) -> AgentEvaluation {
    let comparisons: Vec<AgentComparison> = labels
        .iter()
        .map(|(question_id, label)| {
            score_comparison(&base_dir.join(question_id), scoring).unwrap_or_else(|err| {
                let message = format!("{err:#}");
                warn!(question_id = %question_id, error = %message, "cannot score comparison");
                AgentComparison {
                    question_id: question_id.clone(),
                    label: *label,
                    scores: BTreeMap::new(),
                    totals: BTreeMap::new(),
                    pred: Prediction::Error,
                }
            })
        })
        .collect();

    let mut evaluation = AgentEvaluation {
        comparisons,
        metrics: PairwiseMetrics::from_rows(&[]),
    };
    evaluation.metrics = PairwiseMetrics::from_rows(&evaluation.rows());
    info!(
        comparisons = evaluation.comparisons.len(),
        accuracy = evaluation.metrics.accuracy,
        "evaluated agent results"
    );
    evaluation
}

/// Token usage over every agent trajectory
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub webs: usize,
    pub tasks: usize,
    pub usage: TokenUsage,
}

impl CostSummary {
    /// Mean total tokens per candidate web page
    pub fn per_web(&self) -> f64 {
        if self.webs == 0 {
            0.0
        } else {
            self.usage.total() as f64 / self.webs as f64
        }
    }

    pub fn per_task(&self) -> f64 {
        if self.tasks == 0 {
            0.0
        } else {
            self.usage.total() as f64 / self.tasks as f64
        }
    }
}

/// Sum the token usage recorded in every trajectory of every candidate.
pub fn total_agent_cost(candidate_dirs: &[PathBuf]) -> Result<CostSummary> {
    let mut summary = CostSummary {
        webs: candidate_dirs.len(),
        ..CostSummary::default()
    };
    for dir in candidate_dirs {
        for task_dir in read_path_list(&dir.join(TASK_LIST_FILE))? {
            summary.tasks += 1;
            let trajectory: Trajectory = read_json(&task_dir.join(TRAJECTORY_FILE))?;
            summary.usage.add(&trajectory.costs);
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::prepare::prepare_agent_tasks;
    use crate::config::AgentSettings;
    use crate::dataset::tests::arena_record;
    use crate::models::ChatMessage;
    use crate::rubric::tests::sample_tree;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn trajectory(result: FinalResult, last: &str, prompt_tokens: u64) -> Trajectory {
        Trajectory {
            final_result: result,
            error_message: None,
            costs: TokenUsage {
                prompt_token_count: prompt_tokens,
                candidates_token_count: 1,
                thoughts_token_count: 0,
            },
            trajectory: Some(vec![ChatMessage::user("task"), ChatMessage::assistant(last)]),
            codes: Vec::new(),
        }
    }

    /// Prepare one comparison and write a trajectory for every task
    fn prepared(outcomes: impl Fn(Candidate, TaskGroup, usize) -> Trajectory) -> (tempfile::TempDir, PathBuf, Vec<PathBuf>) {
        let dir = tempdir().unwrap();
        let base = dir.path().join("agent");
        let rubrics = HashMap::from([("q1".to_string(), sample_tree())]);
        let summary = prepare_agent_tasks(
            &[arena_record("q1", "model_a")],
            &rubrics,
            &base,
            &dir.path().join("webs.txt"),
            &AgentSettings::default(),
        )
        .unwrap();

        for (candidate, candidate_dir) in Candidate::BOTH.iter().zip(&summary.candidate_dirs) {
            let tasks = read_path_list(&candidate_dir.join(TASK_LIST_FILE)).unwrap();
            for (index, task_dir) in tasks.iter().enumerate() {
                let group = TaskGroup::of_task_dir(task_dir).unwrap();
                write_json(&task_dir.join(TRAJECTORY_FILE), &outcomes(*candidate, group, index)).unwrap();
            }
        }
        (dir, base, summary.candidate_dirs)
    }

    const FOUND_ALL: &str = "Thought: all there\nAction: finished(content='1.1 1.2 1.3 2')";

    #[test]
    fn test_collect_counts_done_tasks() {
        let (_dir, _base, dirs) = prepared(|_, group, index| match group {
            TaskGroup::Static => trajectory(FinalResult::Done, "Action: finished(content='1.1 1.3 9.9')", 5),
            TaskGroup::Intention if index == 0 => trajectory(FinalResult::Done, "finished(content='success')", 5),
            TaskGroup::DynamicComplex => trajectory(FinalResult::Done, "finished(content='success')", 5),
            _ => trajectory(FinalResult::Failed, "finished(content='failed')", 5),
        });

        let (result, counts) = collect_candidate_result(&dirs[0]).unwrap();
        assert_eq!(result.static_elements_list, vec!["1.1", "1.3", "9.9"]);
        assert_eq!(result.intention_count, 1);
        assert_eq!(result.dynamic_count.basic, 0);
        assert_eq!(result.dynamic_count.complex, 2);
        assert_eq!(counts.tasks, 6);
        assert_eq!(counts.count(TaskGroup::Intention, FinalResult::Failed), 1);
        assert_eq!(counts.count(TaskGroup::DynamicBasic, FinalResult::Failed), 1);

        let stored: CandidateResult = read_json(&dirs[0].join(RESULT_FILE)).unwrap();
        assert_eq!(stored, result);
    }

    #[test]
    fn test_static_task_without_marker_is_a_static_error() {
        let (_dir, _base, dirs) = prepared(|_, group, _| match group {
            TaskGroup::Static => trajectory(FinalResult::ParsingResponseError, "I found 1.1 and 1.2", 1),
            _ => trajectory(FinalResult::MaxRounds, "click", 1),
        });
        let counts = collect_all(&dirs).unwrap();
        assert_eq!(counts.static_errors, 2);
        assert_eq!(counts.tasks, 12);
        assert_eq!(counts.count(TaskGroup::Intention, FinalResult::MaxRounds), 4);
    }

    #[test]
    fn test_missing_trajectory_is_counted() {
        let (_dir, _base, dirs) = prepared(|_, _, _| trajectory(FinalResult::Done, FOUND_ALL, 1));
        let first_task = read_path_list(&dirs[0].join(TASK_LIST_FILE)).unwrap().remove(0);
        std::fs::remove_file(first_task.join(TRAJECTORY_FILE)).unwrap();
        let (result, counts) = collect_candidate_result(&dirs[0]).unwrap();
        assert_eq!(counts.missing, 1);
        assert_eq!(result.intention_count, 1);
    }

    #[test]
    fn test_evaluate_prefers_better_candidate() {
        let (_dir, base, dirs) = prepared(|candidate, group, _| match (candidate, group) {
            (Candidate::A, _) => trajectory(FinalResult::Done, FOUND_ALL, 1),
            (Candidate::B, TaskGroup::Static) => trajectory(FinalResult::Done, "finished(content='1.1')", 1),
            (Candidate::B, _) => trajectory(FinalResult::Failed, "finished(content='failed')", 1),
        });
        collect_all(&dirs).unwrap();

        let labels = vec![("q1".to_string(), Verdict::ModelA), ("q404".to_string(), Verdict::Tie)];
        let evaluation = evaluate_agent_results(&base, &labels, &ScoringConfig::default());

        let first = &evaluation.comparisons[0];
        assert_eq!(first.pred, Prediction::ModelA);
        assert_eq!(first.scores[&Candidate::A].static_, 4);
        // intention 2/2, static 4/4, dynamic (1 + 2*2)/3
        assert!((first.totals[&Candidate::A] - (1.0 + 1.0 + 5.0 / 3.0)).abs() < 1e-9);
        assert!((first.totals[&Candidate::B] - 0.25).abs() < 1e-9);
        assert_eq!(evaluation.comparisons[1].pred, Prediction::Error);
        assert_eq!(evaluation.metrics.correct, 1);
        assert_eq!(evaluation.metrics.errors, 1);
    }

    #[test]
    fn test_cost_sums_every_trajectory() {
        let (_dir, _base, dirs) = prepared(|_, _, _| trajectory(FinalResult::Done, FOUND_ALL, 10));
        let cost = total_agent_cost(&dirs).unwrap();
        assert_eq!(cost.webs, 2);
        assert_eq!(cost.tasks, 12);
        assert_eq!(cost.usage.prompt_token_count, 120);
        assert_eq!(cost.usage.candidates_token_count, 12);
        assert!((cost.per_task() - 11.0).abs() < 1e-9);
        assert!((cost.per_web() - 66.0).abs() < 1e-9);
    }
}
