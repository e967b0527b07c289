//! Rubric tree model.
//!
//! A rubric decomposes a task into intention, static and dynamic
//! requirements. Nodes are either leaves (the unit of judgment, serialised
//! with `"children": null`) or internal nodes with a non-empty child list.
//! Trees coming from a model are untrusted JSON, so construction always goes
//! through shape validation.

use crate::error::{EvalError, Result};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// A single rubric node
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Value")]
pub enum RubricNode {
    Leaf {
        description: String,
    },
    Internal {
        description: String,
        children: Vec<RubricNode>,
    },
}

impl RubricNode {
    pub fn leaf(description: impl Into<String>) -> Self {
        Self::Leaf {
            description: description.into(),
        }
    }

    pub fn internal(description: impl Into<String>, children: Vec<RubricNode>) -> Self {
        Self::Internal {
            description: description.into(),
            children,
        }
    }

    /// Parse and validate a node from untyped JSON.
    ///
    /// `path` names the node in error messages, e.g. `static.children[2]`.
    pub fn from_value(value: &Value, path: &str) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| EvalError::shape(path, "node must be an object"))?;
        let description = node_description(object, path)?;

        let children = object
            .get("children")
            .ok_or_else(|| EvalError::shape(path, "missing key \"children\""))?;

        match children {
            Value::Null => Ok(Self::Leaf { description }),
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(EvalError::shape(
                        path,
                        "children must be null or a non-empty list",
                    ));
                }
                let children = items
                    .iter()
                    .enumerate()
                    .map(|(i, child)| Self::from_value(child, &format!("{path}.children[{i}]")))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Internal {
                    description,
                    children,
                })
            }
            _ => Err(EvalError::shape(path, "children must be null or a list")),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Leaf { description } | Self::Internal { description, .. } => description,
        }
    }

    /// Children of an internal node; empty for a leaf.
    pub fn children(&self) -> &[RubricNode] {
        match self {
            Self::Leaf { .. } => &[],
            Self::Internal { children, .. } => children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf { .. })
    }

    /// 1 for a leaf, otherwise 1 + the tallest child.
    pub fn height(&self) -> usize {
        1 + self
            .children()
            .iter()
            .map(RubricNode::height)
            .max()
            .unwrap_or(0)
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf { .. } => 1,
            Self::Internal { children, .. } => children.iter().map(RubricNode::leaf_count).sum(),
        }
    }

    /// Leaf descriptions in document order.
    pub fn leaf_descriptions(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Leaf { description } => out.push(description),
            Self::Internal { children, .. } => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

fn node_description(object: &Map<String, Value>, path: &str) -> Result<String> {
    match object.get("description") {
        None => Err(EvalError::shape(path, "missing key \"description\"")),
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.clone()),
        Some(_) => Err(EvalError::shape(path, "description must be non-empty text")),
    }
}

impl TryFrom<Value> for RubricNode {
    type Error = EvalError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(&value, "$")
    }
}

impl Serialize for RubricNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("RubricNode", 2)?;
        state.serialize_field("description", self.description())?;
        match self {
            Self::Leaf { .. } => state.serialize_field("children", &Option::<()>::None)?,
            Self::Internal { children, .. } => state.serialize_field("children", children)?,
        }
        state.end()
    }
}

/// The three top-level rubric branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Intention,
    Static,
    Dynamic,
}

impl Branch {
    pub const ALL: [Branch; 3] = [Branch::Intention, Branch::Static, Branch::Dynamic];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intention => "intention",
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete, validated rubric tree.
///
/// Only built through [`RubricTree::from_value`], so the dynamic branch
/// always holds exactly two groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct RubricTree {
    intention: RubricNode,
    #[serde(rename = "static")]
    static_: RubricNode,
    dynamic: RubricNode,
}

impl RubricTree {
    /// Validate the full tree shape: exactly the three branch keys, every
    /// branch internal, and a dynamic branch with exactly two groups.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| EvalError::shape("$", "rubric tree must be an object"))?;

        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        if keys != ["dynamic", "intention", "static"] {
            return Err(EvalError::shape(
                "$",
                format!("expected keys intention, static, dynamic; found {}", keys.join(", ")),
            ));
        }

        let branch = |name: &str| -> Result<RubricNode> {
            let node = RubricNode::from_value(&object[name], name)?;
            if node.is_leaf() {
                return Err(EvalError::shape(name, "branch must have non-empty children"));
            }
            Ok(node)
        };

        let intention = branch("intention")?;
        let static_ = branch("static")?;
        let dynamic = branch("dynamic")?;

        let groups = dynamic.children().len();
        if groups != 2 {
            return Err(EvalError::shape(
                "dynamic",
                format!("expected exactly 2 interaction groups, found {groups}"),
            ));
        }

        Ok(Self {
            intention,
            static_,
            dynamic,
        })
    }

    pub fn branch(&self, branch: Branch) -> &RubricNode {
        match branch {
            Branch::Intention => &self.intention,
            Branch::Static => &self.static_,
            Branch::Dynamic => &self.dynamic,
        }
    }

    /// The "basic" interaction group of the dynamic branch.
    pub fn dynamic_basic(&self) -> &RubricNode {
        &self.dynamic.children()[0]
    }

    /// The "complex" interaction group of the dynamic branch.
    pub fn dynamic_complex(&self) -> &RubricNode {
        &self.dynamic.children()[1]
    }

    /// Height counting the implicit root above the three branches.
    pub fn height(&self) -> usize {
        1 + Branch::ALL
            .iter()
            .map(|b| self.branch(*b).height())
            .max()
            .unwrap_or(0)
    }

    pub fn leaf_count(&self) -> usize {
        Branch::ALL.iter().map(|b| self.branch(*b).leaf_count()).sum()
    }
}

impl TryFrom<Value> for RubricTree {
    type Error = EvalError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(&value)
    }
}

/// Validate the shape of an untyped tree without keeping the result.
pub fn validate_shape(value: &Value) -> Result<()> {
    RubricTree::from_value(value).map(|_| ())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_tree_json() -> Value {
        json!({
            "intention": {
                "description": "A book review site.",
                "children": [
                    {"description": "Users can submit reviews.", "children": null},
                    {"description": "Users can browse reviews.", "children": null}
                ]
            },
            "static": {
                "description": "Static elements.",
                "children": [
                    {"description": "Submission form.", "children": [
                        {"description": "Rating field.", "children": null},
                        {"description": "Author field.", "children": null},
                        {"description": "Review text area.", "children": null}
                    ]},
                    {"description": "Page header.", "children": null}
                ]
            },
            "dynamic": {
                "description": "Interactions.",
                "children": [
                    {"description": "Basic interactions.", "children": [
                        {"description": "Submit a review.", "children": null}
                    ]},
                    {"description": "Complex interactions.", "children": [
                        {"description": "Filter reviews by rating.", "children": null},
                        {"description": "Sort reviews by date.", "children": null}
                    ]}
                ]
            }
        })
    }

    pub(crate) fn sample_tree() -> RubricTree {
        RubricTree::from_value(&sample_tree_json()).unwrap()
    }

    #[test]
    fn test_parse_valid_tree() {
        let tree = sample_tree();
        assert_eq!(tree.intention.children().len(), 2);
        assert_eq!(tree.static_.leaf_count(), 4);
        assert_eq!(tree.dynamic_basic().leaf_count(), 1);
        assert_eq!(tree.dynamic_complex().leaf_count(), 2);
        assert_eq!(tree.leaf_count(), 9);
    }

    #[test]
    fn test_height() {
        let tree = sample_tree();
        assert_eq!(RubricNode::leaf("x").height(), 1);
        assert_eq!(tree.intention.height(), 2);
        assert_eq!(tree.static_.height(), 3);
        assert_eq!(tree.dynamic.height(), 3);
        assert_eq!(tree.height(), 4);
    }

    #[test]
    fn test_leaf_count_matches_null_children_markers() {
        // Both counts walk the serialised form, the structural one must agree.
        let tree = sample_tree();
        let serialized = serde_json::to_string_pretty(&tree).unwrap();
        let markers = serialized.matches("\"children\": null").count();
        assert_eq!(tree.leaf_count(), markers);
    }

    #[test]
    fn test_leaf_count_ignores_marker_text_in_descriptions() {
        let node = RubricNode::internal(
            "Mentions \"children\": null in its text",
            vec![RubricNode::leaf("\"children\": null"), RubricNode::leaf("plain")],
        );
        assert_eq!(node.leaf_count(), 2);
    }

    #[test]
    fn test_missing_children_key_is_rejected() {
        let mut value = sample_tree_json();
        value["static"]["children"][1]
            .as_object_mut()
            .unwrap()
            .remove("children");
        let err = RubricTree::from_value(&value).unwrap_err();
        assert_eq!(
            err,
            EvalError::shape("static.children[1]", "missing key \"children\"")
        );
    }

    #[test]
    fn test_empty_description_is_rejected() {
        let mut value = sample_tree_json();
        value["intention"]["children"][0]["description"] = json!("");
        let err = RubricTree::from_value(&value).unwrap_err();
        match err {
            EvalError::InvalidTreeShape { path, .. } => assert_eq!(path, "intention.children[0]"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_children_list_is_rejected() {
        let mut value = sample_tree_json();
        value["static"]["children"][0]["children"] = json!([]);
        assert!(RubricTree::from_value(&value).is_err());
    }

    #[test]
    fn test_dynamic_must_have_two_groups() {
        let mut value = sample_tree_json();
        value["dynamic"]["children"]
            .as_array_mut()
            .unwrap()
            .pop();
        let err = RubricTree::from_value(&value).unwrap_err();
        assert_eq!(
            err,
            EvalError::shape("dynamic", "expected exactly 2 interaction groups, found 1")
        );

        let decoded: std::result::Result<RubricTree, _> = serde_json::from_value(value);
        assert!(decoded.unwrap_err().to_string().contains("interaction groups"));
    }

    #[test]
    fn test_extra_top_level_key_is_rejected() {
        let mut value = sample_tree_json();
        value["extra"] = json!({"description": "x", "children": null});
        assert!(validate_shape(&value).is_err());
    }

    #[test]
    fn test_leaf_branch_is_rejected() {
        let mut value = sample_tree_json();
        value["intention"] = json!({"description": "Only a leaf", "children": null});
        let err = RubricTree::from_value(&value).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidTreeShape);
    }

    #[test]
    fn test_serde_roundtrip_preserves_null_children() {
        let tree = sample_tree();
        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(value, sample_tree_json());
        let parsed: RubricTree = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn test_leaf_descriptions_in_document_order() {
        let tree = sample_tree();
        assert_eq!(
            tree.dynamic_complex().leaf_descriptions(),
            vec!["Filter reviews by rating.", "Sort reviews by date."]
        );
    }
}
