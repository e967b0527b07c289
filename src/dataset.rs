//! Dataset records and JSON/JSONL persistence.

use crate::error::{EvalError, Result as EvalResult};
use crate::judgment::JudgeMode;
use crate::models::{Candidate, TaskItem, TokenUsage};
use crate::rubric::RubricTree;
use crate::scoring::Verdict;
use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Text fragment of a conversation turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnContent {
    #[serde(default)]
    pub text: Option<String>,
}

/// Generated artifact attached to an assistant turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnObject {
    pub code: String,
}

/// One turn of an arena conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    #[serde(default)]
    pub content: Vec<TurnContent>,
    #[serde(default)]
    pub object: Option<TurnObject>,
}

/// A pairwise comparison record of the arena dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaRecord {
    pub question_id: String,
    pub conversation_a: Vec<Turn>,
    pub conversation_b: Vec<Turn>,
    pub label: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_a: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_b: Option<String>,
}

impl ArenaRecord {
    /// Space-joined text of the user turns of the first conversation
    pub fn user_query(&self) -> String {
        self.conversation_a
            .iter()
            .filter(|turn| turn.role == "user")
            .filter_map(|turn| turn.content.first().and_then(|c| c.text.as_deref()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn conversation(&self, candidate: Candidate) -> &[Turn] {
        match candidate {
            Candidate::A => &self.conversation_a,
            Candidate::B => &self.conversation_b,
        }
    }

    /// Code of the final turn of a candidate's conversation
    pub fn code(&self, candidate: Candidate) -> Result<&str> {
        self.conversation(candidate)
            .last()
            .and_then(|turn| turn.object.as_ref())
            .map(|object| object.code.as_str())
            .ok_or_else(|| {
                anyhow!(
                    "record {} has no code in the final turn of conversation_{}",
                    self.question_id,
                    candidate
                )
            })
    }

    /// Judge work items: one per candidate in pointwise mode, one pair otherwise
    pub fn task_items(&self, mode: JudgeMode, screenshots_dir: Option<&Path>) -> Result<Vec<TaskItem>> {
        let user_query = self.user_query();
        let shot = |candidate: Candidate| -> Vec<PathBuf> {
            screenshots_dir
                .map(|dir| vec![screenshot_path(dir, &self.question_id, candidate)])
                .unwrap_or_default()
        };

        let items = match mode {
            JudgeMode::Pointwise => Candidate::BOTH
                .iter()
                .map(|&candidate| {
                    Ok(TaskItem {
                        question_id: self.question_id.clone(),
                        user_query: user_query.clone(),
                        candidate: Some(candidate),
                        codes: vec![self.code(candidate)?.to_string()],
                        screenshots: shot(candidate),
                        label: self.label,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            JudgeMode::Pairwise => vec![TaskItem {
                question_id: self.question_id.clone(),
                user_query,
                candidate: None,
                codes: vec![
                    self.code(Candidate::A)?.to_string(),
                    self.code(Candidate::B)?.to_string(),
                ],
                screenshots: [shot(Candidate::A), shot(Candidate::B)].concat(),
                label: self.label,
            }],
        };
        Ok(items)
    }
}

/// `<dir>/<question_id>_<a|b>.png`
pub fn screenshot_path(dir: &Path, question_id: &str, candidate: Candidate) -> PathBuf {
    dir.join(format!("{question_id}_{candidate}.png"))
}

/// A generated rubric, persisted one per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricRecord {
    pub question_id: String,
    /// Raw tree as returned by the model; null when generation failed
    pub rubric_tree: Option<Value>,
    /// Token usage of the generation
    #[serde(default)]
    pub metadata: TokenUsage,
    #[serde(default)]
    pub model_response: Option<String>,
}

impl RubricRecord {
    /// Validate and type the stored tree
    pub fn tree(&self) -> EvalResult<RubricTree> {
        match &self.rubric_tree {
            Some(value) => RubricTree::from_value(value),
            None => Err(EvalError::shape("$", "rubric tree is missing")),
        }
    }
}

/// Valid rubric trees by question id; invalid records are left out
pub fn rubric_map(records: &[RubricRecord]) -> HashMap<String, RubricTree> {
    records
        .iter()
        .filter_map(|record| Some((record.question_id.clone(), record.tree().ok()?)))
        .collect()
}

/// A feasibility question of the unit track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityRecord {
    pub web_id: String,
    /// Numeric or textual id, unique within a web
    pub task_id: Value,
    pub code: String,
    pub task: String,
    pub expected: String,
    /// 1 when the task is achievable
    pub label: u8,
}

impl FeasibilityRecord {
    pub fn key(&self) -> String {
        feasibility_key(&self.web_id, &self.task_id)
    }
}

/// `<web_id>_<task_id>`, with string ids unquoted
pub fn feasibility_key(web_id: &str, task_id: &Value) -> String {
    match task_id {
        Value::String(id) => format!("{web_id}_{id}"),
        other => format!("{web_id}_{other}"),
    }
}

/// Persisted answer of the feasibility judge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityJudgment {
    pub web_id: String,
    pub task_id: Value,
    /// `{"feasible": bool}`, forced to false when no valid answer was obtained
    pub model_response: Value,
    pub raw_response: Option<String>,
    #[serde(default)]
    pub metadata: TokenUsage,
}

impl FeasibilityJudgment {
    pub fn feasible(&self) -> bool {
        self.model_response
            .get("feasible")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Read every non-blank line of a JSONL file
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open: {}", path.display()))?;

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("Invalid record on line {} of {}", index + 1, path.display()))?;
        records.push(record);
    }
    Ok(records)
}

/// Ensure the directory for an output file exists
fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Write one JSON document per line
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    ensure_parent_exists(path)?;
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create: {}", path.display()))?;
    for record in records {
        let line = serde_json::to_string(record).context("Failed to serialize record to JSON")?;
        writeln!(file, "{line}").with_context(|| format!("Failed to write to: {}", path.display()))?;
    }
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse JSON: {}", path.display()))
}

/// Write pretty-printed JSON
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json_content = serde_json::to_string_pretty(value).context("Failed to serialize results to JSON")?;
    ensure_parent_exists(path)?;
    std::fs::write(path, json_content)
        .with_context(|| format!("Failed to write results to: {}", path.display()))
}
