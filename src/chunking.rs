//! Flattening rubric subtrees into numbered lines and splitting them into
//! prompt-sized chunks without cutting into an open subtree.

use crate::rubric::RubricNode;

const INDENT: &str = "    ";

/// One flattened rubric line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatLine {
    /// Dotted hierarchical id, e.g. `1.2.3`
    pub numbering: String,
    pub description: String,
    /// Recursion depth below the flattened node, starting at 0
    pub depth: usize,
    pub has_children: bool,
}

impl FlatLine {
    /// Render as an indented prompt line. Internal nodes get a trailing dot
    /// on their id so the model can tell groups from checkable elements.
    pub fn render(&self) -> String {
        let marker = if self.has_children { "." } else { "" };
        format!(
            "{}{}{} {}",
            INDENT.repeat(self.depth),
            self.numbering,
            marker,
            self.description
        )
    }
}

/// A contiguous run of flattened lines rendered into one prompt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptChunk {
    pub lines: Vec<FlatLine>,
}

impl PromptChunk {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(FlatLine::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Flatten the children of `node` in document order.
pub fn flatten(node: &RubricNode) -> Vec<FlatLine> {
    let mut lines = Vec::new();
    flatten_into(node.children(), "", 0, &mut lines);
    lines
}

fn flatten_into(children: &[RubricNode], prefix: &str, depth: usize, out: &mut Vec<FlatLine>) {
    for (i, child) in children.iter().enumerate() {
        let numbering = format!("{prefix}{}", i + 1);
        let has_children = !child.is_leaf();
        out.push(FlatLine {
            numbering: numbering.clone(),
            description: child.description().to_string(),
            depth,
            has_children,
        });
        if has_children {
            flatten_into(child.children(), &format!("{numbering}."), depth + 1, out);
        }
    }
}

/// Ids of every flattened node, and of the leaves only.
pub fn numbered_ids(node: &RubricNode) -> (Vec<String>, Vec<String>) {
    let lines = flatten(node);
    let leaves = lines
        .iter()
        .filter(|l| !l.has_children)
        .map(|l| l.numbering.clone())
        .collect();
    let all = lines.into_iter().map(|l| l.numbering).collect();
    (all, leaves)
}

/// Split `lines` into chunks of at most `max_lines` lines.
///
/// A cut is only placed before a line whose depth is not greater than the
/// depth of the line before it; a cut that would land on the first child of
/// the preceding line moves back to the nearest earlier line satisfying
/// that rule. When no such line exists within the window the full window is
/// taken. The last chunk takes the remainder.
pub fn chunk(lines: &[FlatLine], max_lines: usize) -> Vec<PromptChunk> {
    let max_lines = max_lines.max(1);
    if lines.len() <= max_lines {
        return vec![PromptChunk {
            lines: lines.to_vec(),
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < lines.len() {
        let end = (start + max_lines).min(lines.len());
        let cut = if end < lines.len() {
            cut_point(lines, start, end)
        } else {
            end
        };
        chunks.push(PromptChunk {
            lines: lines[start..cut].to_vec(),
        });
        start = cut;
    }
    chunks
}

fn cut_point(lines: &[FlatLine], start: usize, end: usize) -> usize {
    let opens_subtree = |i: usize| lines[i].depth > lines[i - 1].depth;
    if !opens_subtree(end) {
        return end;
    }
    ((start + 1)..end)
        .rev()
        .find(|&i| !opens_subtree(i))
        .unwrap_or(end)
}

/// Flatten and chunk a branch in one step.
///
/// A node without children yields a single empty chunk.
pub fn chunk_node(node: &RubricNode, max_lines: usize) -> Vec<PromptChunk> {
    chunk(&flatten(node), max_lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(prefix: &str, n: usize) -> Vec<RubricNode> {
        (1..=n)
            .map(|i| RubricNode::leaf(format!("{prefix} item {i}")))
            .collect()
    }

    /// Root with 5 groups, each holding 5 leaves: 30 lines, 25 leaves.
    fn three_level_tree() -> RubricNode {
        let groups = (1..=5)
            .map(|g| RubricNode::internal(format!("Group {g}"), leaves(&format!("g{g}"), 5)))
            .collect();
        RubricNode::internal("Static elements", groups)
    }

    #[test]
    fn test_flatten_numbering_and_depth() {
        let tree = RubricNode::internal(
            "root",
            vec![
                RubricNode::internal("form", vec![RubricNode::leaf("rating"), RubricNode::leaf("author")]),
                RubricNode::leaf("header"),
            ],
        );
        let lines = flatten(&tree);
        let summary: Vec<(&str, usize, bool)> = lines
            .iter()
            .map(|l| (l.numbering.as_str(), l.depth, l.has_children))
            .collect();
        assert_eq!(
            summary,
            vec![("1", 0, true), ("1.1", 1, false), ("1.2", 1, false), ("2", 0, false)]
        );
        assert_eq!(lines[0].render(), "1. form");
        assert_eq!(lines[1].render(), "    1.1 rating");
        assert_eq!(lines[3].render(), "2 header");
    }

    #[test]
    fn test_small_tree_is_one_chunk() {
        let tree = RubricNode::internal("root", leaves("x", 3));
        let chunks = chunk_node(&tree, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].lines.len(), 3);
    }

    #[test]
    fn test_childless_root_gives_single_empty_chunk() {
        let chunks = chunk_node(&RubricNode::leaf("nothing"), 10);
        assert_eq!(chunks, vec![PromptChunk::default()]);
        assert_eq!(chunks[0].render(), "");
    }

    #[test]
    fn test_chunks_concatenate_to_original_sequence() {
        let lines = flatten(&three_level_tree());
        assert_eq!(lines.len(), 30);
        for max_lines in 1..=31 {
            let chunks = chunk(&lines, max_lines);
            let rejoined: Vec<FlatLine> = chunks.into_iter().flat_map(|c| c.lines).collect();
            assert_eq!(rejoined, lines, "max_lines = {max_lines}");
        }
    }

    #[test]
    fn test_chunks_respect_size_bound() {
        let lines = flatten(&three_level_tree());
        for chunk in chunk(&lines, 10) {
            assert!(!chunk.is_empty());
            assert!(chunk.lines.len() <= 10);
        }
    }

    #[test]
    fn test_chunk_boundaries_never_open_a_subtree() {
        let lines = flatten(&three_level_tree());
        let chunks = chunk(&lines, 10);
        assert!(chunks.len() > 1);

        let mut offset = 0;
        for chunk in &chunks {
            if offset > 0 {
                assert!(
                    lines[offset].depth <= lines[offset - 1].depth,
                    "chunk starting at {} splits it from its parent {}",
                    lines[offset].numbering,
                    lines[offset - 1].numbering
                );
            }
            offset += chunk.lines.len();
        }
    }

    #[test]
    fn test_cut_moves_back_when_boundary_opens_subtree() {
        // Lines: 1(0) 1.1(1) 1.2(1) 2(0) 2.1(1) 2.2(1)
        // A window of 4 would start the next chunk on 2.1, whose parent 2
        // is the last line of the window, so the cut moves before 2.
        let tree = RubricNode::internal(
            "root",
            vec![
                RubricNode::internal("a", leaves("a", 2)),
                RubricNode::internal("b", leaves("b", 2)),
            ],
        );
        let chunks = chunk(&flatten(&tree), 4);
        let ids: Vec<Vec<&str>> = chunks
            .iter()
            .map(|c| c.lines.iter().map(|l| l.numbering.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["1", "1.1", "1.2"], vec!["2", "2.1", "2.2"]]);
    }

    #[test]
    fn test_later_siblings_continue_in_the_next_chunk() {
        // Lines: 1(0) 2(0) 2.1(1) .. 2.5(1)
        // The boundary after 2.3 opens nothing, so 2.4 starts a chunk
        // without repeating its parent 2.
        let tree = RubricNode::internal("root", vec![RubricNode::leaf("a"), RubricNode::internal("b", leaves("b", 5))]);
        let chunks = chunk(&flatten(&tree), 5);
        let ids: Vec<Vec<&str>> = chunks
            .iter()
            .map(|c| c.lines.iter().map(|l| l.numbering.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["1", "2", "2.1", "2.2", "2.3"], vec!["2.4", "2.5"]]);
    }

    #[test]
    fn test_window_without_valid_cut_is_taken_whole() {
        // A single chain deeper at every line offers no valid cut.
        let chain = RubricNode::internal(
            "root",
            vec![RubricNode::internal(
                "l1",
                vec![RubricNode::internal(
                    "l2",
                    vec![RubricNode::internal("l3", vec![RubricNode::leaf("l4")])],
                )],
            )],
        );
        let lines = flatten(&chain);
        let chunks = chunk(&lines, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].lines.len(), 2);
        assert_eq!(chunks[1].lines.len(), 2);
    }

    #[test]
    fn test_numbered_ids_split_leaves() {
        let tree = RubricNode::internal(
            "root",
            vec![RubricNode::internal("form", leaves("f", 2)), RubricNode::leaf("header")],
        );
        let (all, leaf_ids) = numbered_ids(&tree);
        assert_eq!(all, vec!["1", "1.1", "1.2", "2"]);
        assert_eq!(leaf_ids, vec!["1.1", "1.2", "2"]);
    }
}
