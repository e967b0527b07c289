//! Laying out agent task directories for every comparison.
//!
//! ```text
//! <base>/<question_id>/metadata.json
//! <base>/<question_id>/<a|b>/index.tsx
//! <base>/<question_id>/<a|b>/tasks.txt
//! <base>/<question_id>/<a|b>/intention/partN/metadata.json
//! <base>/<question_id>/<a|b>/static/partN/metadata.json
//! <base>/<question_id>/<a|b>/dynamic/{basic,complex}/partN/metadata.json
//! ```

use super::session::{TaskKind, TaskMetadata};
use crate::chunking::chunk_node;
use crate::config::AgentSettings;
use crate::dataset::{ArenaRecord, write_json};
use crate::models::Candidate;
use crate::prompts;
use crate::rubric::{Branch, RubricTree};
use crate::scoring::Verdict;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Candidate code file inside a candidate directory
pub const CODE_FILE: &str = "index.tsx";
pub const TASK_LIST_FILE: &str = "tasks.txt";

/// Rubric branch group a task directory belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskGroup {
    Intention,
    Static,
    DynamicBasic,
    DynamicComplex,
}

impl TaskGroup {
    pub const ALL: [TaskGroup; 4] = [
        Self::Intention,
        Self::Static,
        Self::DynamicBasic,
        Self::DynamicComplex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intention => "intention",
            Self::Static => "static",
            Self::DynamicBasic => "dynamic_basic",
            Self::DynamicComplex => "dynamic_complex",
        }
    }

    /// Directory of this group relative to the candidate directory
    pub fn relative_dir(self) -> PathBuf {
        match self {
            Self::Intention => PathBuf::from("intention"),
            Self::Static => PathBuf::from("static"),
            Self::DynamicBasic => Path::new("dynamic").join("basic"),
            Self::DynamicComplex => Path::new("dynamic").join("complex"),
        }
    }

    /// Group of a task directory, from its parent directory names
    pub fn of_task_dir(task_dir: &Path) -> Option<Self> {
        let parent = task_dir.parent()?;
        let name = parent.file_name()?.to_str()?;
        let grandparent = parent.parent().and_then(Path::file_name).and_then(|n| n.to_str());
        match (grandparent, name) {
            (_, "intention") => Some(Self::Intention),
            (_, "static") => Some(Self::Static),
            (Some("dynamic"), "basic") => Some(Self::DynamicBasic),
            (Some("dynamic"), "complex") => Some(Self::DynamicComplex),
            _ => None,
        }
    }
}

/// `metadata.json` of a comparison directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonMetadata {
    pub question_id: String,
    pub model_a: Option<String>,
    pub model_b: Option<String>,
    pub query: String,
    pub label: Verdict,
    pub rubric: RubricTree,
    /// Leaf counts per branch
    pub intention: usize,
    #[serde(rename = "static")]
    pub static_: usize,
    pub dynamic: usize,
}

/// What a preparation run wrote
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrepareSummary {
    pub comparisons: usize,
    /// Candidate directories, in dataset order
    pub candidate_dirs: Vec<PathBuf>,
    pub tasks: usize,
    /// Records without a usable rubric
    pub skipped: usize,
}

/// Every task of one candidate: where it goes and what it asks
fn candidate_tasks(tree: &RubricTree, settings: &AgentSettings) -> Vec<(TaskGroup, TaskMetadata)> {
    let limits = &settings.max_steps;
    let mut tasks = Vec::new();

    for leaf in tree.branch(Branch::Intention).leaf_descriptions() {
        tasks.push((
            TaskGroup::Intention,
            TaskMetadata {
                instruction: prompts::intention_checking(leaf),
                task_type: TaskKind::Intention,
                max_steps: limits.intention,
            },
        ));
    }
    for chunk in chunk_node(tree.branch(Branch::Static), settings.static_chunk_lines) {
        tasks.push((
            TaskGroup::Static,
            TaskMetadata {
                instruction: prompts::static_checking(&chunk.render()),
                task_type: TaskKind::Static,
                max_steps: limits.static_,
            },
        ));
    }
    let dynamic_groups = [
        (TaskGroup::DynamicBasic, tree.dynamic_basic(), limits.basic),
        (TaskGroup::DynamicComplex, tree.dynamic_complex(), limits.complex),
    ];
    for (group, node, max_steps) in dynamic_groups {
        for leaf in node.leaf_descriptions() {
            tasks.push((
                group,
                TaskMetadata {
                    instruction: leaf.to_string(),
                    task_type: TaskKind::Dynamic,
                    max_steps,
                },
            ));
        }
    }
    tasks
}

fn write_lines(path: &Path, lines: &[PathBuf]) -> Result<()> {
    let content: String = lines
        .iter()
        .map(|line| format!("{}\n", line.display()))
        .collect();
    std::fs::write(path, content).with_context(|| format!("Failed to write: {}", path.display()))
}

/// Read a newline-separated list of paths, skipping blank lines
pub fn read_path_list(path: &Path) -> Result<Vec<PathBuf>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read: {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

fn prepare_candidate(
    record: &ArenaRecord,
    candidate: Candidate,
    candidate_dir: &Path,
    tasks: &[(TaskGroup, TaskMetadata)],
) -> Result<usize> {
    std::fs::create_dir_all(candidate_dir)
        .with_context(|| format!("Failed to create directory: {}", candidate_dir.display()))?;
    let code_path = candidate_dir.join(CODE_FILE);
    std::fs::write(&code_path, record.code(candidate)?)
        .with_context(|| format!("Failed to write: {}", code_path.display()))?;

    let mut parts: HashMap<TaskGroup, usize> = HashMap::new();
    let mut task_dirs = Vec::with_capacity(tasks.len());
    for (group, task) in tasks {
        let part = parts.entry(*group).or_insert(0);
        *part += 1;
        let task_dir = candidate_dir.join(group.relative_dir()).join(format!("part{part}"));
        write_json(&task_dir.join("metadata.json"), task)?;
        task_dirs.push(task_dir);
    }
    write_lines(&candidate_dir.join(TASK_LIST_FILE), &task_dirs)?;
    Ok(task_dirs.len())
}

/// Write the task tree for every record that has a rubric, and the list of
/// candidate directories to `path_list`.
pub fn prepare_agent_tasks(
    records: &[ArenaRecord],
    rubrics: &HashMap<String, RubricTree>,
    base_dir: &Path,
    path_list: &Path,
    settings: &AgentSettings,
) -> Result<PrepareSummary> {
    let mut summary = PrepareSummary::default();

    for record in records {
        let Some(tree) = rubrics.get(&record.question_id) else {
            warn!(question_id = %record.question_id, "no valid rubric, skipping");
            summary.skipped += 1;
            continue;
        };

        let comparison_dir = base_dir.join(&record.question_id);
        let metadata = ComparisonMetadata {
            question_id: record.question_id.clone(),
            model_a: record.model_a.clone(),
            model_b: record.model_b.clone(),
            query: record.user_query(),
            label: record.label,
            rubric: tree.clone(),
            intention: tree.branch(Branch::Intention).leaf_count(),
            static_: tree.branch(Branch::Static).leaf_count(),
            dynamic: tree.branch(Branch::Dynamic).leaf_count(),
        };
        write_json(&comparison_dir.join("metadata.json"), &metadata)?;

        let tasks = candidate_tasks(tree, settings);
        for candidate in Candidate::BOTH {
            let candidate_dir = comparison_dir.join(candidate.as_str());
            summary.tasks += prepare_candidate(record, candidate, &candidate_dir, &tasks)
                .with_context(|| format!("Failed to prepare {} of {}", candidate, record.question_id))?;
            summary.candidate_dirs.push(candidate_dir);
        }
        summary.comparisons += 1;
    }

    if let Some(parent) = path_list.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    write_lines(path_list, &summary.candidate_dirs)?;
    info!(
        comparisons = summary.comparisons,
        tasks = summary.tasks,
        skipped = summary.skipped,
        "prepared agent tasks"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::read_json;
    use crate::dataset::tests::arena_record;
    use crate::rubric::tests::sample_tree;
    use tempfile::tempdir;

    fn rubrics() -> HashMap<String, RubricTree> {
        HashMap::from([("q1".to_string(), sample_tree())])
    }

    #[test]
    fn test_layout_for_one_comparison() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("agent");
        let path_list = dir.path().join("webs.txt");
        let records = vec![arena_record("q1", "model_a"), arena_record("q2", "tie")];

        let summary = prepare_agent_tasks(&records, &rubrics(), &base, &path_list, &AgentSettings::default()).unwrap();

        assert_eq!(summary.comparisons, 1);
        assert_eq!(summary.skipped, 1);
        // 2 intention + 1 static chunk + 1 basic + 2 complex, per candidate
        assert_eq!(summary.tasks, 12);
        assert_eq!(read_path_list(&path_list).unwrap(), vec![base.join("q1/a"), base.join("q1/b")]);

        let metadata: ComparisonMetadata = read_json(&base.join("q1/metadata.json")).unwrap();
        assert_eq!(metadata.label, Verdict::ModelA);
        assert_eq!((metadata.intention, metadata.static_, metadata.dynamic), (2, 4, 3));
        assert_eq!(metadata.query, "Build a book review site with ratings");

        let code = std::fs::read_to_string(base.join("q1/b/index.tsx")).unwrap();
        assert_eq!(code, "<html>b</html>");

        let tasks = read_path_list(&base.join("q1/a/tasks.txt")).unwrap();
        assert_eq!(tasks.len(), 6);
        assert_eq!(tasks[0], base.join("q1/a/intention/part1"));
        assert_eq!(tasks[5], base.join("q1/a/dynamic/complex/part2"));

        let static_task: TaskMetadata = read_json(&base.join("q1/a/static/part1/metadata.json")).unwrap();
        assert_eq!(static_task.task_type, TaskKind::Static);
        assert_eq!(static_task.max_steps, 6);
        assert!(static_task.instruction.contains("1. Submission form."));
        assert!(static_task.instruction.contains("    1.2 "));

        let complex: TaskMetadata = read_json(&base.join("q1/a/dynamic/complex/part1/metadata.json")).unwrap();
        assert_eq!(complex.task_type, TaskKind::Dynamic);
        assert_eq!(complex.max_steps, 15);

        let basic: TaskMetadata = read_json(&base.join("q1/a/dynamic/basic/part1/metadata.json")).unwrap();
        assert_eq!(basic.max_steps, 5);
    }

    #[test]
    fn test_static_branch_is_chunked() {
        let settings = AgentSettings {
            static_chunk_lines: 2,
            ..AgentSettings::default()
        };
        let tasks = candidate_tasks(&sample_tree(), &settings);
        let static_tasks = tasks.iter().filter(|(g, _)| *g == TaskGroup::Static).count();
        assert!(static_tasks >= 2);
    }

    #[test]
    fn test_task_group_from_path() {
        let base = Path::new("/runs/q1/a");
        for group in TaskGroup::ALL {
            let dir = base.join(group.relative_dir()).join("part3");
            assert_eq!(TaskGroup::of_task_dir(&dir), Some(group));
        }
        assert_eq!(TaskGroup::of_task_dir(Path::new("/runs/q1/a/other/part1")), None);
    }
}
