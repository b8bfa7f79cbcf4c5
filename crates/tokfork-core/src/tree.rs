//! Branch tree built from session steps.
//!
//! Rows are generation depths and lanes are token columns within a row. A
//! session appends tokens left to right in one row; branching opens a new row
//! directly below the node branched from and starts the sibling in the same
//! lane.
//!
//! ```text
//!   row 0   The ─ cat ─ sat ─ .
//!   row 1         dog ─ ran          (diverged_from = cat)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::candidates::CandidateSet;

/// Stable node identifier. Ids are never reused within a tree's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("row {row} is out of range ({row_count} rows)")]
    InvalidRowIndex { row: usize, row_count: usize },
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("candidate {index} out of range ({len} candidates)")]
    CandidateOutOfRange { index: usize, len: usize },
    #[error("lane {lane} of row {row} is already occupied")]
    LaneOccupied { row: usize, lane: usize },
}

/// One token in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// Row index. Renumbered when rows are inserted above.
    pub depth: usize,
    pub lane: usize,
    /// Response text generated before this token.
    pub prefix: String,
    pub candidates: Arc<CandidateSet>,
    /// Node whose token precedes this one.
    pub parent: Option<NodeId>,
    /// Node this branch root was forked from.
    pub diverged_from: Option<NodeId>,
    pub expanded: bool,
}

impl Node {
    /// Decoded text of the selected token.
    pub fn text(&self) -> &str {
        self.candidates.text()
    }
}

/// Placement request for [`BranchTree::append_node`].
#[derive(Debug, Clone)]
pub struct NewNode {
    pub depth: usize,
    pub lane: usize,
    pub prefix: String,
    pub candidates: Arc<CandidateSet>,
    pub parent: Option<NodeId>,
    pub diverged_from: Option<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct BranchTree {
    /// Node ids per row, sorted by lane.
    rows: Vec<Vec<NodeId>>,
    nodes: BTreeMap<NodeId, Node>,
    next_id: u64,
}

impl BranchTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a node in row `depth`, opening empty rows up to it as needed.
    ///
    /// # Errors
    /// Rejects occupied lanes and relations to unknown nodes. The tree is
    /// unchanged on error.
    pub fn append_node(&mut self, new: NewNode) -> Result<NodeId, TreeError> {
        for related in [new.parent, new.diverged_from].into_iter().flatten() {
            if !self.nodes.contains_key(&related) {
                return Err(TreeError::UnknownNode(related));
            }
        }
        let slot = match self.rows.get(new.depth) {
            Some(row) => match row.binary_search_by_key(&new.lane, |id| self.nodes[id].lane) {
                Ok(_) => {
                    return Err(TreeError::LaneOccupied {
                        row: new.depth,
                        lane: new.lane,
                    });
                }
                Err(slot) => slot,
            },
            None => 0,
        };

        let id = NodeId(self.next_id);
        self.next_id += 1;
        while self.rows.len() <= new.depth {
            self.rows.push(Vec::new());
        }
        self.rows[new.depth].insert(slot, id);
        self.nodes.insert(
            id,
            Node {
                id,
                depth: new.depth,
                lane: new.lane,
                prefix: new.prefix,
                candidates: new.candidates,
                parent: new.parent,
                diverged_from: new.diverged_from,
                expanded: true,
            },
        );
        Ok(id)
    }

    /// Inserts an empty row below `row` and renumbers every node's depth.
    ///
    /// # Errors
    /// Returns `InvalidRowIndex` when `row` does not exist.
    pub fn insert_row_after(&mut self, row: usize) -> Result<(), TreeError> {
        if row >= self.rows.len() {
            return Err(TreeError::InvalidRowIndex {
                row,
                row_count: self.rows.len(),
            });
        }
        self.rows.insert(row + 1, Vec::new());
        for (depth, ids) in self.rows.iter().enumerate().skip(row + 2) {
            for id in ids {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.depth = depth;
                }
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.nodes.clear();
    }

    /// Forks a sibling of `node_id` that selects another candidate.
    ///
    /// The sibling shares the node's prefix and parent and starts a new row
    /// right below it, in the same lane.
    ///
    /// # Errors
    /// Returns `UnknownNode` or `CandidateOutOfRange`; the tree is unchanged.
    pub fn branch(
        &mut self,
        node_id: NodeId,
        candidate_index: usize,
        text: impl Into<String>,
    ) -> Result<NodeId, TreeError> {
        let node = self.node(node_id).ok_or(TreeError::UnknownNode(node_id))?;
        let candidates = node
            .candidates
            .with_selection(candidate_index, text)
            .ok_or(TreeError::CandidateOutOfRange {
                index: candidate_index,
                len: node.candidates.len(),
            })?;
        let depth = node.depth;
        let new = NewNode {
            depth: depth + 1,
            lane: node.lane,
            prefix: node.prefix.clone(),
            candidates: Arc::new(candidates),
            parent: node.parent,
            diverged_from: Some(node_id),
        };
        self.insert_row_after(depth)?;
        self.append_node(new)
    }

    /// The node whose x position a row-leading node lines up under.
    pub fn anchor_of(&self, id: NodeId) -> Option<&Node> {
        let node = self.node(id)?;
        if let Some(source) = node.diverged_from.and_then(|d| self.node(d))
            && source.depth < node.depth
        {
            return Some(source);
        }
        self.rows[..node.depth].iter().rev().find_map(|ids| {
            ids.iter()
                .map(|id| &self.nodes[id])
                .find(|other| other.lane == node.lane)
        })
    }

    /// Concatenated token text of every ancestor along the parent chain.
    pub fn path_text(&self, id: NodeId) -> String {
        let mut pieces = Vec::new();
        let mut cursor = self.node(id).and_then(|n| n.parent);
        while let Some(node) = cursor.and_then(|c| self.node(c)) {
            pieces.push(node.text());
            cursor = node.parent;
        }
        pieces.iter().rev().copied().collect()
    }

    /// Flips the node's display flag and returns the new value.
    ///
    /// # Errors
    /// Returns `UnknownNode` for ids not in the tree.
    pub fn toggle_expanded(&mut self, id: NodeId) -> Result<bool, TreeError> {
        let node = self.nodes.get_mut(&id).ok_or(TreeError::UnknownNode(id))?;
        node.expanded = !node.expanded;
        Ok(node.expanded)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Node ids of every row, each sorted by lane.
    pub fn rows(&self) -> &[Vec<NodeId>] {
        &self.rows
    }

    /// Nodes of one row in lane order. Empty for rows that do not exist.
    pub fn row(&self, index: usize) -> impl Iterator<Item = &Node> {
        self.rows
            .get(index)
            .into_iter()
            .flatten()
            .map(|id| &self.nodes[id])
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// All nodes in id (creation) order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.nodes.values().map(|n| n.depth).max()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::candidates::Candidate;

    pub(crate) fn set(text: &str) -> Arc<CandidateSet> {
        Arc::new(CandidateSet::from_sample(
            1,
            vec![
                Candidate {
                    id: 1,
                    logit: 3.0,
                    probability: 0.6,
                },
                Candidate {
                    id: 2,
                    logit: 2.0,
                    probability: 0.3,
                },
                Candidate {
                    id: 3,
                    logit: 1.0,
                    probability: 0.1,
                },
            ],
            text.to_string(),
        ))
    }

    /// Appends `texts` to row `depth` from lane 0, chaining parents.
    fn append_row(tree: &mut BranchTree, depth: usize, texts: &[&str]) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut prefix = String::new();
        let mut parent = None;
        for (lane, text) in texts.iter().enumerate() {
            let id = tree
                .append_node(NewNode {
                    depth,
                    lane,
                    prefix: prefix.clone(),
                    candidates: set(text),
                    parent,
                    diverged_from: None,
                })
                .unwrap();
            prefix.push_str(text);
            parent = Some(id);
            ids.push(id);
        }
        ids
    }

    fn assert_depths_match_rows(tree: &BranchTree) {
        for (index, ids) in tree.rows().iter().enumerate() {
            for id in ids {
                assert_eq!(tree.node(*id).unwrap().depth, index);
            }
        }
    }

    #[test]
    fn test_append_opens_intermediate_rows() {
        let mut tree = BranchTree::new();
        append_row(&mut tree, 0, &["a", "b"]);
        append_row(&mut tree, 1, &["c"]);
        assert_eq!(tree.row_count(), 2);

        let id = tree
            .append_node(NewNode {
                depth: 5,
                lane: 0,
                prefix: String::new(),
                candidates: set("x"),
                parent: None,
                diverged_from: None,
            })
            .unwrap();
        assert_eq!(tree.node(id).unwrap().depth, 5);
        assert_eq!(tree.row_count(), 6);
        assert_eq!(tree.row_count(), 1 + tree.max_depth().unwrap());
        for row in 2..5 {
            assert_eq!(tree.row(row).count(), 0);
        }
        assert_eq!(tree.row(5).next().map(|n| n.id), Some(id));
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_append_sorts_lanes_and_rejects_occupied() {
        let mut tree = BranchTree::new();
        for lane in [2, 0, 1] {
            tree.append_node(NewNode {
                depth: 0,
                lane,
                prefix: String::new(),
                candidates: set("t"),
                parent: None,
                diverged_from: None,
            })
            .unwrap();
        }
        let lanes: Vec<usize> = tree.row(0).map(|n| n.lane).collect();
        assert_eq!(lanes, vec![0, 1, 2]);

        let err = tree
            .append_node(NewNode {
                depth: 0,
                lane: 1,
                prefix: String::new(),
                candidates: set("t"),
                parent: None,
                diverged_from: None,
            })
            .unwrap_err();
        assert_eq!(err, TreeError::LaneOccupied { row: 0, lane: 1 });
    }

    #[test]
    fn test_append_rejects_unknown_parent() {
        let mut tree = BranchTree::new();
        let err = tree
            .append_node(NewNode {
                depth: 0,
                lane: 0,
                prefix: String::new(),
                candidates: set("t"),
                parent: Some(NodeId(9)),
                diverged_from: None,
            })
            .unwrap_err();
        assert_eq!(err, TreeError::UnknownNode(NodeId(9)));
        assert!(tree.is_empty());
        assert_eq!(tree.row_count(), 0);
    }

    #[test]
    fn test_insert_row_after_renumbers_depths() {
        let mut tree = BranchTree::new();
        append_row(&mut tree, 0, &["a"]);
        append_row(&mut tree, 1, &["b"]);
        let lowest = append_row(&mut tree, 2, &["c"]);

        tree.insert_row_after(0).unwrap();
        assert_eq!(tree.row_count(), 4);
        assert_eq!(tree.row(1).count(), 0);
        assert_eq!(tree.node(lowest[0]).unwrap().depth, 3);
        assert_depths_match_rows(&tree);
    }

    #[test]
    fn test_insert_row_after_invalid_index_leaves_tree_unchanged() {
        let mut tree = BranchTree::new();
        append_row(&mut tree, 0, &["a", "b"]);

        let err = tree.insert_row_after(1).unwrap_err();
        assert_eq!(
            err,
            TreeError::InvalidRowIndex {
                row: 1,
                row_count: 1
            }
        );
        assert_eq!(tree.row_count(), 1);
        assert_eq!(tree.len(), 2);
    }

    /// Verifies branching from depth 2 lane 0 lands at depth 3 lane 0 and
    /// pushes the rows below down by one.
    #[test]
    fn test_branch_opens_row_below_source() {
        let mut tree = BranchTree::new();
        append_row(&mut tree, 0, &["a", "b"]);
        append_row(&mut tree, 1, &["c"]);
        let source = append_row(&mut tree, 2, &["d", "e"]);
        let below = append_row(&mut tree, 3, &["f"]);

        let branched = tree.branch(source[0], 1, "D").unwrap();
        let node = tree.node(branched).unwrap();
        assert_eq!((node.depth, node.lane), (3, 0));
        assert_eq!(node.text(), "D");
        assert_eq!(node.candidates.selected_index(), 1);
        assert_eq!(node.diverged_from, Some(source[0]));
        assert_eq!(node.prefix, tree.node(source[0]).unwrap().prefix);
        assert_eq!(tree.node(below[0]).unwrap().depth, 4);
        assert_depths_match_rows(&tree);
    }

    #[test]
    fn test_branch_errors_leave_tree_unchanged() {
        let mut tree = BranchTree::new();
        let ids = append_row(&mut tree, 0, &["a"]);

        assert_eq!(
            tree.branch(ids[0], 3, "x").unwrap_err(),
            TreeError::CandidateOutOfRange { index: 3, len: 3 }
        );
        assert_eq!(
            tree.branch(NodeId(42), 0, "x").unwrap_err(),
            TreeError::UnknownNode(NodeId(42))
        );
        assert_eq!(tree.row_count(), 1);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_path_text_matches_prefix() {
        let mut tree = BranchTree::new();
        let first = append_row(&mut tree, 0, &["The", " cat", " sat"]);
        let fork = tree.branch(first[1], 2, " dog").unwrap();
        let after = tree
            .append_node(NewNode {
                depth: 1,
                lane: 2,
                prefix: "The dog".to_string(),
                candidates: set(" ran"),
                parent: Some(fork),
                diverged_from: None,
            })
            .unwrap();

        for node in tree.nodes() {
            assert_eq!(tree.path_text(node.id), node.prefix, "node {}", node.id);
        }
        assert_eq!(tree.path_text(after), "The dog");
    }

    #[test]
    fn test_anchor_prefers_diverged_from() {
        let mut tree = BranchTree::new();
        let first = append_row(&mut tree, 0, &["a", "b", "c"]);
        let late = tree.branch(first[2], 1, "C").unwrap();
        // a second fork from an earlier lane goes between the source and `late`
        let early = tree.branch(first[1], 1, "B").unwrap();

        assert_eq!(tree.node(early).unwrap().depth, 1);
        assert_eq!(tree.node(late).unwrap().depth, 2);
        assert_eq!(tree.anchor_of(late).unwrap().id, first[2]);
        assert_eq!(tree.anchor_of(early).unwrap().id, first[1]);
        assert!(tree.anchor_of(first[0]).is_none());
    }

    #[test]
    fn test_anchor_falls_back_to_same_lane_scan() {
        let mut tree = BranchTree::new();
        append_row(&mut tree, 0, &["a", "b"]);
        let lower = tree
            .append_node(NewNode {
                depth: 1,
                lane: 1,
                prefix: String::new(),
                candidates: set("x"),
                parent: None,
                diverged_from: None,
            })
            .unwrap();
        let anchor = tree.anchor_of(lower).unwrap();
        assert_eq!((anchor.depth, anchor.lane), (0, 1));
    }

    #[test]
    fn test_toggle_expanded_and_clear() {
        let mut tree = BranchTree::new();
        let ids = append_row(&mut tree, 0, &["a"]);
        assert!(tree.node(ids[0]).unwrap().expanded);
        assert!(!tree.toggle_expanded(ids[0]).unwrap());
        assert!(tree.toggle_expanded(ids[0]).unwrap());

        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.row_count(), 0);
        assert_eq!(tree.max_depth(), None);
        assert!(tree.toggle_expanded(ids[0]).is_err());
    }
}
