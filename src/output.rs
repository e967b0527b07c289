use crate::agent::prepare::TaskGroup;
use crate::agent::{AgentEvaluation, CostSummary, FinalResult, PrepareSummary, TerminalCounts};
use crate::error::ErrorKind;
use crate::judgment::{JudgeMode, RubricScope};
use crate::metrics::{PairwiseMetrics, RubricStatistics, Summary};
use crate::models::{Candidate, PredictionRow, TokenUsage};
use crate::preflight::PreflightReport;
use crate::rubric::Branch;
use crate::runner::{FeasibilityReport, GenerationReport, JudgeReport, RubricCheckReport, ScoreReport};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Terminal states and scores of an agent run, reported together
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentScoreReport {
    pub terminal_states: TerminalCounts,
    pub evaluation: AgentEvaluation,
}

/// A batch summary that can be printed in every output format
pub trait Report: Serialize {
    /// Human-readable rendering
    fn render_plain(&self) -> String;
}

/// Print a report to stdout in the specified format
pub fn print_report<R: Report + ?Sized>(report: &R, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", report.render_plain()),
        OutputFormat::Json => print_json(report),
    }
}

fn print_json<R: Serialize + ?Sized>(report: &R) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing results to JSON: {}", e),
    }
}

fn heading(out: &mut String, title: &str) {
    out.push_str(&format!("{title}\n{}\n", "-".repeat(title.chars().count())));
}

fn usage_line(out: &mut String, usage: &TokenUsage) {
    out.push_str(&format!(
        "Tokens: prompt {}, candidates {}, thoughts {}, total {}\n",
        usage.prompt_token_count,
        usage.candidates_token_count,
        usage.thoughts_token_count,
        usage.total()
    ));
}

fn error_lines(out: &mut String, errors: &BTreeMap<ErrorKind, usize>) {
    if errors.is_empty() {
        return;
    }
    out.push_str("Errors by kind:\n");
    for (kind, count) in errors {
        out.push_str(&format!("  • {kind}: {count}\n"));
    }
}

fn metrics_lines(out: &mut String, metrics: &PairwiseMetrics) {
    out.push_str(&format!(
        "Accuracy: {:.4} ({}/{})\n",
        metrics.accuracy, metrics.correct, metrics.total
    ));
    out.push_str(&format!("Balanced accuracy: {:.4}\n", metrics.balanced_accuracy));
    out.push_str(&format!("Errors: {}\n", metrics.errors));
    out.push_str(&format!("{:<10} {:<8} {:<8}\n", "Label", "Correct", "Total"));
    for (label, tally) in &metrics.per_label {
        out.push_str(&format!("{:<10} {:<8} {:<8}\n", label.as_str(), tally.correct, tally.total));
    }
}

fn prediction_table(out: &mut String, rows: &[PredictionRow]) {
    if rows.is_empty() {
        return;
    }
    out.push_str(&format!("{:<24} {:<10} {:<10}\n", "Question", "Label", "Prediction"));
    out.push_str(&format!("{}\n", "-".repeat(46)));
    for row in rows {
        out.push_str(&format!(
            "{:<24} {:<10} {:<10}\n",
            row.question_id,
            row.label.as_str(),
            row.pred.as_str()
        ));
    }
}

fn value_name<T: ValueEnum>(value: &T) -> String {
    value
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default()
}

fn setting_line(out: &mut String, mode: JudgeMode, scope: Option<RubricScope>) {
    match scope {
        Some(scope) => out.push_str(&format!("Mode: {}, scope: {}\n", value_name(&mode), value_name(&scope))),
        None => out.push_str(&format!("Mode: {}, likert\n", value_name(&mode))),
    }
}

impl Report for GenerationReport {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "RUBRIC GENERATION");
        out.push_str(&format!(
            "Generated {} of {} ({} failed)\n",
            self.generated, self.total, self.failed
        ));
        if self.worker_failures > 0 {
            out.push_str(&format!("Worker failures: {}\n", self.worker_failures));
        }
        usage_line(&mut out, &self.usage);
        out
    }
}

impl Report for RubricCheckReport {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "RUBRIC CHECK");
        out.push_str(&format!("Total:   {}\n", self.total));
        out.push_str(&format!("Valid:   {}\n", self.valid));
        out.push_str(&format!("Missing: {}\n", self.missing));
        out.push_str(&format!("Invalid: {}\n", self.invalid));
        out
    }
}

impl Report for RubricStatistics {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "RUBRIC STATISTICS");
        out.push_str(&format!("Trees: {}\n", self.trees));
        out.push_str(&format!(
            "{:<12} {:<12} {:<12} {:<12} {:<12}\n",
            "Part", "Height mean", "Height med", "Leaves mean", "Leaves med"
        ));
        let row = |out: &mut String, name: &str, height: &Summary, leaves: &Summary| {
            out.push_str(&format!(
                "{:<12} {:<12.3} {:<12.3} {:<12.3} {:<12.3}\n",
                name, height.mean, height.median, leaves.mean, leaves.median
            ));
        };
        row(&mut out, "tree", &self.height, &self.leaves);
        for branch in Branch::ALL {
            if let (Some(height), Some(leaves)) = (self.branch_height.get(&branch), self.branch_leaves.get(&branch)) {
                row(&mut out, branch.as_str(), height, leaves);
            }
        }
        out
    }
}

impl Report for JudgeReport {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "JUDGING");
        setting_line(&mut out, self.mode, self.scope);
        out.push_str(&format!(
            "Items: {} ({} ok, {} failed), skipped records: {}\n",
            self.items, self.ok, self.failed, self.skipped
        ));
        error_lines(&mut out, &self.errors);
        usage_line(&mut out, &self.usage);
        out
    }
}

impl Report for ScoreReport {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "SCORES");
        setting_line(&mut out, self.mode, self.scope);
        metrics_lines(&mut out, &self.metrics);
        error_lines(&mut out, &self.errors);
        if self.missing > 0 {
            out.push_str(&format!("Missing judgments: {}\n", self.missing));
        }
        if self.skipped > 0 {
            out.push_str(&format!("Skipped without rubric: {}\n", self.skipped));
        }
        out.push('\n');
        heading(&mut out, "PREDICTIONS");
        prediction_table(&mut out, &self.rows);
        out
    }
}

impl Report for FeasibilityReport {
    fn render_plain(&self) -> String {
        let m = &self.metrics;
        let mut out = String::new();
        heading(&mut out, "FEASIBILITY");
        out.push_str(&format!("Items: {} ({} fell back to infeasible)\n", self.total, self.fallbacks));
        out.push_str(&format!(
            "TP {}  FP {}  TN {}  FN {}\n",
            m.true_positives, m.false_positives, m.true_negatives, m.false_negatives
        ));
        out.push_str(&format!(
            "Precision: {:.4}\nRecall:    {:.4}\nF1:        {:.4}\nAccuracy:  {:.4}\n",
            m.precision, m.recall, m.f1, m.accuracy
        ));
        usage_line(&mut out, &self.usage);
        out
    }
}

impl Report for PrepareSummary {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "AGENT TASKS");
        out.push_str(&format!("Comparisons: {}\n", self.comparisons));
        out.push_str(&format!("Candidate directories: {}\n", self.candidate_dirs.len()));
        out.push_str(&format!("Tasks: {}\n", self.tasks));
        out.push_str(&format!("Skipped without rubric: {}\n", self.skipped));
        out
    }
}

impl Report for TerminalCounts {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "TERMINAL STATES");
        out.push_str(&format!(
            "Tasks: {}, missing trajectories: {}, static errors: {}\n",
            self.tasks, self.missing, self.static_errors
        ));
        for group in TaskGroup::ALL {
            let Some(counts) = self.groups.get(&group) else {
                continue;
            };
            out.push_str(&format!("{}:\n", group.as_str()));
            for result in FinalResult::ALL {
                if let Some(count) = counts.get(&result) {
                    out.push_str(&format!("  • {result}: {count}\n"));
                }
            }
        }
        out
    }
}

impl Report for AgentEvaluation {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "AGENT SCORES");
        metrics_lines(&mut out, &self.metrics);
        out.push('\n');
        out.push_str(&format!(
            "{:<24} {:<10} {:<10} {:<8} {:<8}\n",
            "Question", "Label", "Prediction", "A", "B"
        ));
        out.push_str(&format!("{}\n", "-".repeat(64)));
        for comparison in &self.comparisons {
            let total = |candidate: Candidate| {
                comparison
                    .totals
                    .get(&candidate)
                    .map(|score| format!("{score:.3}"))
                    .unwrap_or_else(|| "-".to_string())
            };
            out.push_str(&format!(
                "{:<24} {:<10} {:<10} {:<8} {:<8}\n",
                comparison.question_id,
                comparison.label.as_str(),
                comparison.pred.as_str(),
                total(Candidate::A),
                total(Candidate::B)
            ));
        }
        out
    }
}

impl Report for AgentScoreReport {
    fn render_plain(&self) -> String {
        let mut out = self.terminal_states.render_plain();
        out.push('\n');
        out.push_str(&self.evaluation.render_plain());
        out
    }
}

impl Report for CostSummary {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "AGENT COST");
        out.push_str(&format!("Webs: {}, tasks: {}\n", self.webs, self.tasks));
        usage_line(&mut out, &self.usage);
        out.push_str(&format!(
            "Per web: {:.1} tokens, per task: {:.1} tokens\n",
            self.per_web(),
            self.per_task()
        ));
        out
    }
}

impl Report for Vec<PreflightReport> {
    fn render_plain(&self) -> String {
        let mut out = String::new();
        heading(&mut out, "PREFLIGHT");
        for report in self {
            let status = report
                .status
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string());
            let verdict = if report.ok { "ok" } else { "FAIL" };
            out.push_str(&format!("{:<5} {:<4} {}\n", verdict, status, report.url));
            if let Some(error) = &report.error {
                out.push_str(&format!("      {error}\n"));
            }
        }
        out
    }
}
