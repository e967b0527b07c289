//! Batch operations over datasets: rubric generation and checking, judging,
//! scoring and the feasibility track.

use crate::config::Config;
use crate::dataset::{ArenaRecord, FeasibilityJudgment, FeasibilityRecord, RubricRecord};
use crate::error::{EvalError, ErrorKind};
use crate::evaluation::ModelClient;
use crate::judgment::{JudgeMode, JudgedResponse, RubricScope, extract_json, parse_judgment};
use crate::likert;
use crate::metrics::{BinaryMetrics, PairwiseMetrics, RubricStatistics};
use crate::models::{
    Candidate, ChatMessage, ItemStatus, JudgeRecord, ModelRequest, Prediction, PredictionRow, TaskItem, TokenUsage,
};
use crate::pool::TaskPool;
use crate::prompts;
use crate::retry::generate_validated;
use crate::rubric::RubricTree;
use crate::scoring::{ScoringConfig, compare, pairwise_verdict, pointwise_score};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary of a rubric generation batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub total: usize,
    pub generated: usize,
    pub failed: usize,
    pub worker_failures: usize,
    pub usage: TokenUsage,
}

/// Summary of a rubric check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RubricCheckReport {
    pub total: usize,
    pub valid: usize,
    /// Records whose generation produced no tree
    pub missing: usize,
    /// Records whose tree breaks the rubric shape
    pub invalid: usize,
}

/// Summary of a judge batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeReport {
    pub mode: JudgeMode,
    /// Rubric scope judged, `None` for the Likert baseline
    pub scope: Option<RubricScope>,
    pub items: usize,
    pub ok: usize,
    pub failed: usize,
    /// Dataset records without a valid rubric
    pub skipped: usize,
    /// Final error of each failed item, by kind
    pub errors: BTreeMap<ErrorKind, usize>,
    pub usage: TokenUsage,
}

/// Predictions of a judged batch against the labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub mode: JudgeMode,
    /// Rubric scope scored, `None` for the Likert baseline
    pub scope: Option<RubricScope>,
    pub rows: Vec<PredictionRow>,
    pub metrics: PairwiseMetrics,
    /// Why unjudgeable comparisons became errors
    pub errors: BTreeMap<ErrorKind, usize>,
    /// Comparisons with no judge record at all
    pub missing: usize,
    pub skipped: usize,
}

/// Summary of the feasibility track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityReport {
    pub total: usize,
    /// Items that fell back to infeasible after exhausting retries
    pub fallbacks: usize,
    pub metrics: BinaryMetrics,
    pub usage: TokenUsage,
}

/// How a judge answer is accepted
enum Grading {
    Rubric { tree: RubricTree, scope: RubricScope },
    Likert,
}

impl Grading {
    fn check(&self, raw: &str, mode: JudgeMode) -> crate::error::Result<()> {
        match self {
            Self::Rubric { tree, scope } => parse_judgment(raw, tree, *scope, mode).map(drop),
            Self::Likert => likert::check_answer(raw, mode),
        }
    }
}

/// One prepared judge request
struct JudgeJob {
    question_id: String,
    candidate: Option<Candidate>,
    grading: Grading,
    request: ModelRequest,
}

/// Drives batches of model calls with the configured retry policy and
/// concurrency
pub struct Runner {
    config: Config,
    client: Arc<dyn ModelClient>,
}

impl Runner {
    pub fn new(config: Config, client: Arc<dyn ModelClient>) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn pool(&self) -> TaskPool {
        TaskPool::new(self.config.concurrency())
    }

    fn request(&self, messages: Vec<ChatMessage>) -> ModelRequest {
        ModelRequest {
            model: self.config.model.model.clone(),
            messages,
            max_tokens: self.config.model.max_tokens,
            temperature: self.config.retry.initial_temperature,
        }
    }

    /// Generate one rubric tree per dataset record.
    ///
    /// Records whose retries run out keep a null tree and the last raw answer.
    pub async fn generate_rubrics(&self, records: &[ArenaRecord]) -> (Vec<RubricRecord>, GenerationReport) {
        let jobs: Vec<(String, ModelRequest)> = records
            .iter()
            .map(|record| {
                let prompt = prompts::rubric_generation(&record.user_query());
                (record.question_id.clone(), self.request(vec![ChatMessage::user(prompt)]))
            })
            .collect();

        let client = Arc::clone(&self.client);
        let policy = self.config.retry.clone();
        let report = self
            .pool()
            .run_all(jobs, move |(question_id, request)| {
                let client = Arc::clone(&client);
                let policy = policy.clone();
                async move {
                    let outcome = generate_validated(client.as_ref(), &policy, &request, &question_id, |raw| {
                        let value = extract_json(raw)?;
                        RubricTree::from_value(&value)?;
                        Ok(value)
                    })
                    .await;
                    debug!(question_id = %question_id, ok = outcome.succeeded(), "rubric generated");
                    RubricRecord {
                        question_id,
                        rubric_tree: outcome.parsed,
                        metadata: outcome.usage,
                        model_response: outcome.raw,
                    }
                }
            })
            .await;

        let worker_failures = report.worker_failures;
        let rubrics: Vec<RubricRecord> = report.into_ordered().into_iter().map(|(_, r)| r).collect();
        let generated = rubrics.iter().filter(|r| r.rubric_tree.is_some()).count();
        let summary = GenerationReport {
            total: records.len(),
            generated,
            failed: records.len() - generated,
            worker_failures,
            usage: rubrics.iter().map(|r| r.metadata).sum(),
        };
        info!(
            total = summary.total,
            generated = summary.generated,
            failed = summary.failed,
            tokens = summary.usage.total(),
            "rubric generation finished"
        );
        (rubrics, summary)
    }

    fn judge_jobs(
        &self,
        records: &[ArenaRecord],
        rubrics: &HashMap<String, RubricTree>,
        mode: JudgeMode,
        scope: RubricScope,
        screenshots_dir: Option<&Path>,
    ) -> Result<(Vec<JudgeJob>, usize)> {
        let mut jobs = Vec::new();
        let mut skipped = 0;

        for record in records {
            let Some(tree) = rubrics.get(&record.question_id) else {
                warn!(question_id = %record.question_id, "no valid rubric, skipping");
                skipped += 1;
                continue;
            };
            let items = record
                .task_items(mode, screenshots_dir)
                .with_context(|| format!("Failed to build judge items for {}", record.question_id))?;
            for item in items {
                let images = load_images(&item)?;
                let messages = prompts::build_judge_messages(&item, tree, scope, mode, &images);
                jobs.push(JudgeJob {
                    question_id: item.question_id,
                    candidate: item.candidate,
                    grading: Grading::Rubric {
                        tree: tree.clone(),
                        scope,
                    },
                    request: self.request(messages),
                });
            }
        }
        Ok((jobs, skipped))
    }

    /// Judge every record that has a rubric.
    ///
    /// Fails only on unusable input (missing code, unreadable screenshot);
    /// model failures end up in the records.
    pub async fn judge(
        &self,
        records: &[ArenaRecord],
        rubrics: &HashMap<String, RubricTree>,
        mode: JudgeMode,
        scope: RubricScope,
        screenshots_dir: Option<&Path>,
    ) -> Result<(Vec<JudgeRecord>, JudgeReport)> {
        let (jobs, skipped) = self.judge_jobs(records, rubrics, mode, scope, screenshots_dir)?;
        let (judged, mut summary) = self.run_judge_jobs(jobs, mode, Some(scope)).await;
        summary.skipped = skipped;
        Ok((judged, summary))
    }

    /// Rate every record on the fixed Likert criteria.
    ///
    /// Needs no rubric; input failures are handled as in [`Runner::judge`].
    pub async fn likert(
        &self,
        records: &[ArenaRecord],
        mode: JudgeMode,
        screenshots_dir: Option<&Path>,
    ) -> Result<(Vec<JudgeRecord>, JudgeReport)> {
        let mut jobs = Vec::new();
        for record in records {
            let items = record
                .task_items(mode, screenshots_dir)
                .with_context(|| format!("Failed to build judge items for {}", record.question_id))?;
            for item in items {
                let images = load_images(&item)?;
                let messages = prompts::build_likert_messages(&item, mode, &images);
                jobs.push(JudgeJob {
                    question_id: item.question_id,
                    candidate: item.candidate,
                    grading: Grading::Likert,
                    request: self.request(messages),
                });
            }
        }
        Ok(self.run_judge_jobs(jobs, mode, None).await)
    }

    async fn run_judge_jobs(
        &self,
        jobs: Vec<JudgeJob>,
        mode: JudgeMode,
        scope: Option<RubricScope>,
    ) -> (Vec<JudgeRecord>, JudgeReport) {
        let item_count = jobs.len();

        let client = Arc::clone(&self.client);
        let policy = self.config.retry.clone();
        let report = self
            .pool()
            .run_all(jobs, move |job: JudgeJob| {
                let client = Arc::clone(&client);
                let policy = policy.clone();
                async move {
                    let outcome = generate_validated(client.as_ref(), &policy, &job.request, &job.question_id, |raw| {
                        job.grading.check(raw, mode)
                    })
                    .await;
                    let status = if outcome.succeeded() {
                        ItemStatus::Ok
                    } else {
                        ItemStatus::Failed
                    };
                    debug!(question_id = %job.question_id, ?status, "item judged");
                    JudgeRecord {
                        question_id: job.question_id,
                        candidate: job.candidate,
                        model_response: outcome.raw.clone(),
                        metadata: outcome.usage,
                        error: if outcome.succeeded() { None } else { outcome.last_error() },
                        attempts: outcome.attempts,
                        status,
                    }
                }
            })
            .await;

        let worker_failures = report.worker_failures;
        let judged: Vec<JudgeRecord> = report.into_ordered().into_iter().map(|(_, r)| r).collect();

        let mut errors = BTreeMap::new();
        for record in judged.iter().filter(|r| r.status == ItemStatus::Failed) {
            if let Some(kind) = record.error {
                *errors.entry(kind).or_insert(0) += 1;
            }
        }
        if worker_failures > 0 {
            errors.insert(ErrorKind::WorkerFailure, worker_failures);
        }
        let ok = judged.iter().filter(|r| r.status == ItemStatus::Ok).count();
        let summary = JudgeReport {
            mode,
            scope,
            items: item_count,
            ok,
            failed: item_count - ok,
            skipped: 0,
            errors,
            usage: judged.iter().map(|r| r.metadata).sum(),
        };
        info!(
            items = summary.items,
            ok = summary.ok,
            failed = summary.failed,
            prompt_tokens = summary.usage.prompt_token_count,
            candidate_tokens = summary.usage.candidates_token_count,
            "judging finished"
        );
        (judged, summary)
    }

    /// Ask whether each task is achievable on its page and compare against
    /// the labels. Exhausted items are judged infeasible.
    pub async fn feasibility(&self, records: &[FeasibilityRecord]) -> (Vec<FeasibilityJudgment>, FeasibilityReport) {
        let jobs: Vec<(usize, String, ModelRequest)> = records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let prompt = prompts::feasibility(&record.code, &record.task, &record.expected);
                (index, record.key(), self.request(vec![ChatMessage::user(prompt)]))
            })
            .collect();

        let client = Arc::clone(&self.client);
        let policy = self.config.retry.clone();
        let report = self
            .pool()
            .run_all(jobs, move |(index, key, request)| {
                let client = Arc::clone(&client);
                let policy = policy.clone();
                async move {
                    let outcome = generate_validated(client.as_ref(), &policy, &request, &key, parse_feasible).await;
                    (index, outcome)
                }
            })
            .await;

        let mut judgments = Vec::new();
        let mut pairs = Vec::new();
        let mut fallbacks = 0;
        for (_, (index, outcome)) in report.into_ordered() {
            let record = &records[index];
            if !outcome.succeeded() {
                fallbacks += 1;
            }
            let feasible = outcome.parsed.unwrap_or(false);
            pairs.push((feasible, record.label == 1));
            judgments.push(FeasibilityJudgment {
                web_id: record.web_id.clone(),
                task_id: record.task_id.clone(),
                model_response: json!({ "feasible": feasible }),
                raw_response: outcome.raw,
                metadata: outcome.usage,
            });
        }

        let summary = FeasibilityReport {
            total: judgments.len(),
            fallbacks,
            metrics: BinaryMetrics::from_pairs(pairs),
            usage: judgments.iter().map(|j| j.metadata).sum(),
        };
        info!(
            total = summary.total,
            fallbacks = summary.fallbacks,
            f1 = summary.metrics.f1,
            tokens = summary.usage.total(),
            "feasibility judging finished"
        );
        (judgments, summary)
    }
}

/// Split persisted rubrics into the valid subset and a report
pub fn check_rubrics(records: &[RubricRecord]) -> (Vec<RubricRecord>, RubricCheckReport) {
    let mut report = RubricCheckReport {
        total: records.len(),
        ..RubricCheckReport::default()
    };
    let mut valid = Vec::new();

    for record in records {
        if record.rubric_tree.is_none() {
            warn!(question_id = %record.question_id, "rubric tree is missing");
            report.missing += 1;
            continue;
        }
        match record.tree() {
            Ok(_) => valid.push(record.clone()),
            Err(err) => {
                warn!(question_id = %record.question_id, error = %err, "rubric tree is invalid");
                report.invalid += 1;
            }
        }
    }
    report.valid = valid.len();
    info!(
        total = report.total,
        valid = report.valid,
        missing = report.missing,
        invalid = report.invalid,
        "rubric check finished"
    );
    (valid, report)
}

/// Structural statistics over the valid rubrics
pub fn rubric_statistics(records: &[RubricRecord]) -> RubricStatistics {
    let trees: Vec<RubricTree> = records.iter().filter_map(|r| r.tree().ok()).collect();
    RubricStatistics::from_trees(&trees)
}

/// Turn persisted judge records into verdicts and accuracy metrics.
///
/// A comparison is an error when its judgment is missing, failed or no
/// longer validates; in pointwise mode when either candidate is.
pub fn score_judgments(
    records: &[ArenaRecord],
    rubrics: &HashMap<String, RubricTree>,
    judged: &[JudgeRecord],
    mode: JudgeMode,
    scope: RubricScope,
    scoring: &ScoringConfig,
) -> ScoreReport {
    let by_item: HashMap<(&str, Option<Candidate>), &JudgeRecord> = judged
        .iter()
        .map(|r| ((r.question_id.as_str(), r.candidate), r))
        .collect();

    let mut rows = Vec::new();
    let mut errors: BTreeMap<ErrorKind, usize> = BTreeMap::new();
    let mut missing = 0;
    let mut skipped = 0;

    for record in records {
        let Some(tree) = rubrics.get(&record.question_id) else {
            skipped += 1;
            continue;
        };
        let lookup = |candidate: Option<Candidate>| -> std::result::Result<JudgedResponse, Option<ErrorKind>> {
            let judge_record = by_item
                .get(&(record.question_id.as_str(), candidate))
                .ok_or(None)?;
            judged_response(judge_record, tree, scope, mode).map_err(Some)
        };

        let verdict = match mode {
            JudgeMode::Pairwise => lookup(None).map(|response| pairwise_verdict(tree, &response, scope, scoring)),
            JudgeMode::Pointwise => lookup(Some(Candidate::A)).and_then(|a| {
                let b = lookup(Some(Candidate::B))?;
                Ok(compare(
                    pointwise_score(tree, &a, scope, scoring),
                    pointwise_score(tree, &b, scope, scoring),
                    scoring.threshold,
                ))
            }),
        };

        let pred = match verdict {
            Ok(verdict) => Prediction::from(verdict),
            Err(reason) => {
                match reason {
                    Some(kind) => *errors.entry(kind).or_insert(0) += 1,
                    None => missing += 1,
                }
                Prediction::Error
            }
        };
        rows.push(PredictionRow {
            question_id: record.question_id.clone(),
            label: record.label,
            pred,
        });
    }

    score_report(mode, Some(scope), rows, errors, missing, skipped)
}

/// Turn persisted Likert records into verdicts and accuracy metrics.
///
/// Summed ratings are compared with `scoring.likert_threshold`. As with
/// rubric scoring, a pointwise comparison needs both candidates.
pub fn score_likert(
    records: &[ArenaRecord],
    judged: &[JudgeRecord],
    mode: JudgeMode,
    scoring: &ScoringConfig,
) -> ScoreReport {
    let by_item: HashMap<(&str, Option<Candidate>), &JudgeRecord> = judged
        .iter()
        .map(|r| ((r.question_id.as_str(), r.candidate), r))
        .collect();

    let mut rows = Vec::new();
    let mut errors: BTreeMap<ErrorKind, usize> = BTreeMap::new();
    let mut missing = 0;

    for record in records {
        let answer = |candidate: Option<Candidate>| match by_item.get(&(record.question_id.as_str(), candidate)) {
            Some(judge_record) => judge_answer(judge_record).map_err(Some),
            None => Err(None),
        };
        let totals = match mode {
            JudgeMode::Pairwise => answer(None).and_then(|raw| likert::pair_totals(raw).map_err(rating_error)),
            JudgeMode::Pointwise => answer(Some(Candidate::A)).and_then(|a| {
                let b = answer(Some(Candidate::B))?;
                Ok((
                    likert::single_total(a).map_err(rating_error)?,
                    likert::single_total(b).map_err(rating_error)?,
                ))
            }),
        };

        let pred = match totals {
            Ok((a, b)) => Prediction::from(compare(a, b, scoring.likert_threshold)),
            Err(reason) => {
                match reason {
                    Some(kind) => *errors.entry(kind).or_insert(0) += 1,
                    None => missing += 1,
                }
                Prediction::Error
            }
        };
        rows.push(PredictionRow {
            question_id: record.question_id.clone(),
            label: record.label,
            pred,
        });
    }

    score_report(mode, None, rows, errors, missing, 0)
}

fn score_report(
    mode: JudgeMode,
    scope: Option<RubricScope>,
    rows: Vec<PredictionRow>,
    errors: BTreeMap<ErrorKind, usize>,
    missing: usize,
    skipped: usize,
) -> ScoreReport {
    let metrics = PairwiseMetrics::from_rows(&rows);
    info!(
        total = metrics.total,
        accuracy = metrics.accuracy,
        balanced_accuracy = metrics.balanced_accuracy,
        errors = metrics.errors,
        "scoring finished"
    );
    ScoreReport {
        mode,
        scope,
        rows,
        metrics,
        errors,
        missing,
        skipped,
    }
}

/// Base64 PNGs of an item's screenshots, in order
fn load_images(item: &TaskItem) -> Result<Vec<String>> {
    item.screenshots
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read screenshot: {}", path.display()))?;
            Ok(prompts::encode_png(&bytes))
        })
        .collect()
}

/// The raw answer of a successfully judged record
fn judge_answer(record: &JudgeRecord) -> std::result::Result<&str, ErrorKind> {
    if record.status == ItemStatus::Failed {
        return Err(record.error.unwrap_or(ErrorKind::NoJsonFound));
    }
    record.model_response.as_deref().ok_or(ErrorKind::NoJsonFound)
}

fn rating_error(err: EvalError) -> Option<ErrorKind> {
    Some(err.kind())
}

fn judged_response(
    record: &JudgeRecord,
    tree: &RubricTree,
    scope: RubricScope,
    mode: JudgeMode,
) -> std::result::Result<JudgedResponse, ErrorKind> {
    let raw = judge_answer(record)?;
    parse_judgment(raw, tree, scope, mode).map_err(|err| err.kind())
}

fn parse_feasible(raw: &str) -> crate::error::Result<bool> {
    extract_json(raw)?
        .get("feasible")
        .and_then(Value::as_bool)
        .ok_or_else(|| EvalError::shape("$.feasible", "expected a boolean"))
}
