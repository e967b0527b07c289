//! Parsing judge responses and checking them against the rubric they judge.
//!
//! A judge answers with free text ending in a fenced JSON block. The JSON
//! must mirror the rubric exactly, adding a `value` to every leaf and
//! nothing else.

use crate::error::{EvalError, Result};
use crate::rubric::{Branch, RubricNode, RubricTree};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// How candidates are judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeMode {
    /// One candidate at a time, boolean leaf values
    #[value(name = "single")]
    #[serde(rename = "single")]
    Pointwise,
    /// Both candidates at once, A/B/tie leaf values
    #[value(name = "pair")]
    #[serde(rename = "pair")]
    Pairwise,
}

/// Which part of the rubric a judge sees
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RubricScope {
    Combined,
    Intention,
    Static,
    Dynamic,
}

impl RubricScope {
    pub fn branches(self) -> Vec<Branch> {
        match self {
            Self::Combined => Branch::ALL.to_vec(),
            Self::Intention => vec![Branch::Intention],
            Self::Static => vec![Branch::Static],
            Self::Dynamic => vec![Branch::Dynamic],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Combined => "combined",
            Self::Intention => "intention",
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }
}

/// Pairwise leaf preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preference {
    A,
    B,
    #[serde(rename = "tie")]
    Tie,
}

/// Judgment attached to a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LeafValue {
    Met(bool),
    Preference(Preference),
}

/// A rubric node with a judgment on every leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgedNode {
    Leaf {
        description: String,
        value: LeafValue,
    },
    Internal {
        description: String,
        children: Vec<JudgedNode>,
    },
}

impl JudgedNode {
    pub fn description(&self) -> &str {
        match self {
            Self::Leaf { description, .. } | Self::Internal { description, .. } => description,
        }
    }
}

/// A validated judge answer, one judged tree per branch in scope
#[derive(Debug, Clone, PartialEq)]
pub struct JudgedResponse {
    pub branches: BTreeMap<Branch, JudgedNode>,
}

fn fenced_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json(.*?)```").expect("static regex"))
}

/// Extract the payload of the last fenced `json` block in `raw`.
pub fn extract_json(raw: &str) -> Result<Value> {
    let block = fenced_json()
        .captures_iter(raw)
        .last()
        .and_then(|caps| caps.get(1))
        .ok_or(EvalError::NoJsonFound)?;
    serde_json::from_str(block.as_str().trim()).map_err(|e| EvalError::MalformedJson(e.to_string()))
}

/// Check `judged` against `template` and build the typed judged tree.
///
/// Descriptions are compared after trimming surrounding whitespace.
pub fn validate_against(
    template: &RubricNode,
    judged: &Value,
    mode: JudgeMode,
    path: &str,
) -> Result<JudgedNode> {
    let object = judged
        .as_object()
        .ok_or_else(|| EvalError::shape(path, "judged node must be an object"))?;

    let description = match object.get("description") {
        Some(Value::String(text)) => text,
        _ => return Err(EvalError::shape(path, "missing description")),
    };
    if description.trim() != template.description().trim() {
        return Err(EvalError::shape(path, "description differs from rubric"));
    }

    let children = object.get("children").unwrap_or(&Value::Null);
    match template {
        RubricNode::Leaf { description } => {
            if !children.is_null() {
                return Err(EvalError::shape(path, "leaf gained children"));
            }
            let raw = object
                .get("value")
                .ok_or_else(|| EvalError::shape(path, "leaf is missing a value"))?;
            let value = leaf_value(raw, mode).ok_or_else(|| {
                EvalError::shape(path, format!("unexpected leaf value {raw} for {mode:?} mode"))
            })?;
            Ok(JudgedNode::Leaf {
                description: description.clone(),
                value,
            })
        }
        RubricNode::Internal {
            description,
            children: template_children,
        } => {
            if object.contains_key("value") {
                return Err(EvalError::shape(path, "internal node carries a value"));
            }
            let items = children
                .as_array()
                .ok_or_else(|| EvalError::shape(path, "internal node lost its children"))?;
            if items.len() != template_children.len() {
                return Err(EvalError::shape(
                    path,
                    format!(
                        "expected {} children, found {}",
                        template_children.len(),
                        items.len()
                    ),
                ));
            }
            let children = template_children
                .iter()
                .zip(items)
                .enumerate()
                .map(|(i, (t, j))| validate_against(t, j, mode, &format!("{path}.children[{i}]")))
                .collect::<Result<Vec<_>>>()?;
            Ok(JudgedNode::Internal {
                description: description.clone(),
                children,
            })
        }
    }
}

fn leaf_value(raw: &Value, mode: JudgeMode) -> Option<LeafValue> {
    match (mode, raw) {
        (JudgeMode::Pointwise, Value::Bool(b)) => Some(LeafValue::Met(*b)),
        (JudgeMode::Pairwise, Value::String(s)) => match s.as_str() {
            "A" => Some(LeafValue::Preference(Preference::A)),
            "B" => Some(LeafValue::Preference(Preference::B)),
            "tie" => Some(LeafValue::Preference(Preference::Tie)),
            _ => None,
        },
        _ => None,
    }
}

/// Whether `judged` has the shape of `template` with valid leaf values.
pub fn conforms(template: &RubricNode, judged: &Value, mode: JudgeMode) -> bool {
    validate_against(template, judged, mode, "$").is_ok()
}

/// Validate a parsed judge payload for the given scope.
///
/// Combined answers are objects keyed by branch name; single-branch answers
/// are the judged branch node itself.
pub fn validate_response(
    tree: &RubricTree,
    scope: RubricScope,
    mode: JudgeMode,
    payload: &Value,
) -> Result<JudgedResponse> {
    let mut branches = BTreeMap::new();
    match scope {
        RubricScope::Combined => {
            for branch in Branch::ALL {
                let judged = payload.get(branch.as_str()).ok_or_else(|| {
                    EvalError::shape("$", format!("missing branch \"{branch}\""))
                })?;
                let node = validate_against(tree.branch(branch), judged, mode, branch.as_str())?;
                branches.insert(branch, node);
            }
        }
        single => {
            let branch = single.branches()[0];
            let node = validate_against(tree.branch(branch), payload, mode, branch.as_str())?;
            branches.insert(branch, node);
        }
    }
    Ok(JudgedResponse { branches })
}

/// Extract and validate a raw judge answer in one step.
pub fn parse_judgment(
    raw: &str,
    tree: &RubricTree,
    scope: RubricScope,
    mode: JudgeMode,
) -> Result<JudgedResponse> {
    let payload = extract_json(raw)?;
    validate_response(tree, scope, mode, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::tests::{sample_tree, sample_tree_json};
    use serde_json::json;

    fn fenced(value: &Value) -> String {
        format!("Reasoning first.\n```json\n{}\n```", serde_json::to_string_pretty(value).unwrap())
    }

    /// Copy of a rubric branch with `value` set on every leaf.
    fn judge_all(node: &Value, value: &Value) -> Value {
        let mut node = node.clone();
        if node["children"].is_array() {
            let children: Vec<Value> = node["children"]
                .as_array()
                .unwrap()
                .iter()
                .map(|child| judge_all(child, value))
                .collect();
            node["children"] = Value::Array(children);
        } else {
            node["value"] = value.clone();
        }
        node
    }

    #[test]
    fn test_extract_json_takes_last_block() {
        let raw = "Draft:\n```json\n{\"draft\": true}\n```\nFinal:\n```json\n{\"final\": 1}\n```";
        assert_eq!(extract_json(raw).unwrap(), json!({"final": 1}));
    }

    #[test]
    fn test_extract_json_without_block() {
        assert_eq!(extract_json("{\"bare\": true}"), Err(EvalError::NoJsonFound));
    }

    #[test]
    fn test_extract_json_malformed() {
        let err = extract_json("```json\n{\"a\": }\n```").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedJson);
    }

    #[test]
    fn test_validate_pointwise_branch() {
        let tree = sample_tree();
        let judged = judge_all(&sample_tree_json()["static"], &json!(true));
        let node = validate_against(tree.branch(Branch::Static), &judged, JudgeMode::Pointwise, "static").unwrap();
        assert_eq!(node.description(), "Static elements.");
        assert!(conforms(tree.branch(Branch::Static), &judged, JudgeMode::Pointwise));
        assert!(!conforms(tree.branch(Branch::Static), &judged, JudgeMode::Pairwise));
    }

    #[test]
    fn test_missing_leaf_value_is_rejected() {
        let tree = sample_tree();
        let mut judged = judge_all(&sample_tree_json()["static"], &json!(false));
        judged["children"][0]["children"][2]
            .as_object_mut()
            .unwrap()
            .remove("value");
        let err = validate_against(tree.branch(Branch::Static), &judged, JudgeMode::Pointwise, "static").unwrap_err();
        assert_eq!(
            err,
            EvalError::shape("static.children[0].children[2]", "leaf is missing a value")
        );
    }

    #[test]
    fn test_spurious_internal_value_is_rejected() {
        let tree = sample_tree();
        let mut judged = judge_all(&sample_tree_json()["static"], &json!(true));
        judged["children"][0]["value"] = json!(true);
        assert!(!conforms(tree.branch(Branch::Static), &judged, JudgeMode::Pointwise));
    }

    #[test]
    fn test_shape_divergence_is_rejected() {
        let tree = sample_tree();
        let mut judged = judge_all(&sample_tree_json()["static"], &json!("A"));
        judged["children"][0]["children"]
            .as_array_mut()
            .unwrap()
            .pop();
        let err = validate_against(tree.branch(Branch::Static), &judged, JudgeMode::Pairwise, "static").unwrap_err();
        assert_eq!(
            err,
            EvalError::shape("static.children[0]", "expected 3 children, found 2")
        );
    }

    #[test]
    fn test_changed_description_is_rejected() {
        let tree = sample_tree();
        let mut judged = judge_all(&sample_tree_json()["intention"], &json!(true));
        judged["children"][1]["description"] = json!("Something else entirely.");
        assert!(!conforms(tree.branch(Branch::Intention), &judged, JudgeMode::Pointwise));
    }

    #[test]
    fn test_pairwise_rejects_unknown_preference() {
        let tree = sample_tree();
        let judged = judge_all(&sample_tree_json()["intention"], &json!("both"));
        assert!(!conforms(tree.branch(Branch::Intention), &judged, JudgeMode::Pairwise));
    }

    #[test]
    fn test_parse_combined_response() {
        let tree = sample_tree();
        let source = sample_tree_json();
        let payload = json!({
            "intention": judge_all(&source["intention"], &json!("tie")),
            "static": judge_all(&source["static"], &json!("A")),
            "dynamic": judge_all(&source["dynamic"], &json!("B")),
        });
        let response =
            parse_judgment(&fenced(&payload), &tree, RubricScope::Combined, JudgeMode::Pairwise).unwrap();
        assert_eq!(response.branches.len(), 3);
    }

    #[test]
    fn test_combined_response_missing_branch() {
        let tree = sample_tree();
        let source = sample_tree_json();
        let payload = json!({
            "intention": judge_all(&source["intention"], &json!(true)),
            "static": judge_all(&source["static"], &json!(true)),
        });
        let err = validate_response(&tree, RubricScope::Combined, JudgeMode::Pointwise, &payload)
            .unwrap_err();
        assert_eq!(err, EvalError::shape("$", "missing branch \"dynamic\""));
    }

    #[test]
    fn test_single_scope_response_is_the_branch() {
        let tree = sample_tree();
        let payload = judge_all(&sample_tree_json()["dynamic"], &json!(false));
        let response =
            validate_response(&tree, RubricScope::Dynamic, JudgeMode::Pointwise, &payload).unwrap();
        assert!(response.branches.contains_key(&Branch::Dynamic));
        assert_eq!(response.branches.len(), 1);
    }
}
