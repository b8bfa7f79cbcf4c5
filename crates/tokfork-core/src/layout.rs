//! Node placement for the branch tree.
//!
//! A pure function from tree to rectangles. Rows stack top to bottom; a
//! row's leading node lines up under the node it was forked from and the
//! rest of the row follows contiguously.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use unicode_width::UnicodeWidthStr;

use crate::tree::{BranchTree, Node, NodeId};

/// Spacing and sizing parameters, in canvas units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub margin: u32,
    pub row_gap: u32,
    /// Width of one display column of label text.
    pub cell_width: u32,
    /// Horizontal padding added to the label width.
    pub padding: u32,
    pub expanded_height: u32,
    pub collapsed_height: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            margin: 10,
            row_gap: 10,
            cell_width: 8,
            padding: 10,
            expanded_height: 100,
            collapsed_height: 36,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl NodeRect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Layout {
    pub rects: BTreeMap<NodeId, NodeRect>,
    pub canvas: CanvasSize,
}

impl Layout {
    pub fn rect(&self, id: NodeId) -> Option<NodeRect> {
        self.rects.get(&id).copied()
    }
}

/// Lines shown for a node: the token, plus its scores when expanded.
pub fn label_lines(node: &Node) -> Vec<String> {
    let mut lines = vec![node.text().trim().to_string()];
    if node.expanded {
        let selected = node.candidates.selected();
        lines.push(format!("logit = {:.2}", selected.logit));
        lines.push(format!("p = {:.2}", selected.probability));
    }
    lines
}

/// Width and height a node asks for.
pub fn preferred_size(node: &Node, config: &LayoutConfig) -> (u32, u32) {
    let columns = label_lines(node)
        .iter()
        .map(|line| line.width())
        .max()
        .unwrap_or(0) as u32;
    let height = if node.expanded {
        config.expanded_height
    } else {
        config.collapsed_height
    };
    (columns * config.cell_width + config.padding, height)
}

/// Computes the rectangle of every node.
pub fn layout(tree: &BranchTree, config: &LayoutConfig) -> Layout {
    let mut rects: BTreeMap<NodeId, NodeRect> = BTreeMap::new();
    let mut y = config.margin;
    let mut right = config.margin;
    let mut bottom = config.margin;

    for index in 0..tree.row_count() {
        let mut row = tree.row(index).peekable();
        let Some(leading) = row.peek() else {
            continue;
        };
        let mut x = if leading.lane == 0 {
            config.margin
        } else {
            tree.anchor_of(leading.id)
                .and_then(|anchor| rects.get(&anchor.id))
                .map_or(config.margin, |rect| rect.x)
        };

        let mut row_height = 0;
        for node in row {
            let (width, height) = preferred_size(node, config);
            let rect = NodeRect {
                x,
                y,
                width,
                height,
            };
            x = rect.right();
            right = right.max(rect.right());
            bottom = bottom.max(rect.bottom());
            row_height = row_height.max(height);
            rects.insert(node.id, rect);
        }
        y += row_height + config.row_gap;
    }

    Layout {
        rects,
        canvas: CanvasSize {
            width: right + config.margin,
            height: bottom + config.margin,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NewNode;
    use crate::tree::tests::set;

    fn chain(tree: &mut BranchTree, depth: usize, first_lane: usize, texts: &[&str]) -> Vec<NodeId> {
        texts
            .iter()
            .enumerate()
            .map(|(offset, text)| {
                tree.append_node(NewNode {
                    depth,
                    lane: first_lane + offset,
                    prefix: String::new(),
                    candidates: set(text),
                    parent: None,
                    diverged_from: None,
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_empty_tree_is_margins_only() {
        let config = LayoutConfig::default();
        let out = layout(&BranchTree::new(), &config);
        assert!(out.rects.is_empty());
        assert_eq!(
            out.canvas,
            CanvasSize {
                width: 20,
                height: 20
            }
        );
    }

    #[test]
    fn test_preferred_size_uses_display_width() {
        let mut tree = BranchTree::new();
        let ids = chain(&mut tree, 0, 0, &[" 猫"]);
        let config = LayoutConfig::default();
        let node = tree.node(ids[0]).unwrap();
        // "logit = 3.00" is the widest line
        assert_eq!(preferred_size(node, &config), (12 * 8 + 10, 100));

        tree.toggle_expanded(ids[0]).unwrap();
        let node = tree.node(ids[0]).unwrap();
        assert_eq!(label_lines(node), vec!["猫".to_string()]);
        assert_eq!(preferred_size(node, &config), (2 * 8 + 10, 36));
    }

    #[test]
    fn test_rows_stack_and_nodes_follow_contiguously() {
        let mut tree = BranchTree::new();
        let top = chain(&mut tree, 0, 0, &["a", "b"]);
        tree.toggle_expanded(top[1]).unwrap();
        let config = LayoutConfig::default();
        let out = layout(&tree, &config);

        let a = out.rect(top[0]).unwrap();
        let b = out.rect(top[1]).unwrap();
        assert_eq!((a.x, a.y), (10, 10));
        assert_eq!(b.x, a.right());
        assert_eq!(b.height, 36);

        let lower = chain(&mut tree, 1, 0, &["c"]);
        let out = layout(&tree, &config);
        // row height is the tallest node in the row
        assert_eq!(out.rect(lower[0]).unwrap().y, 10 + 100 + 10);
        assert_eq!(out.canvas.height, out.rect(lower[0]).unwrap().bottom() + 10);
        assert_eq!(out.canvas.width, b.right() + 10);
    }

    #[test]
    fn test_layout_is_idempotent() {
        let mut tree = BranchTree::new();
        let top = chain(&mut tree, 0, 0, &["The", " cat", " sat"]);
        tree.branch(top[1], 2, " dog").unwrap();
        let config = LayoutConfig::default();
        assert_eq!(layout(&tree, &config), layout(&tree, &config));
    }

    #[test]
    fn test_branch_lines_up_under_source_after_row_insertions() {
        let mut tree = BranchTree::new();
        let top = chain(&mut tree, 0, 0, &["The", " cat", " sat", "."]);
        let config = LayoutConfig::default();

        let fork = tree.branch(top[2], 1, " ran").unwrap();
        let out = layout(&tree, &config);
        assert_eq!(out.rect(fork).unwrap().x, out.rect(top[2]).unwrap().x);

        // another fork lands between the source row and `fork`
        let other = tree.branch(top[1], 2, " dog").unwrap();
        let out = layout(&tree, &config);
        assert_eq!(tree.node(fork).unwrap().depth, 2);
        assert_eq!(out.rect(fork).unwrap().x, out.rect(top[2]).unwrap().x);
        assert_eq!(out.rect(other).unwrap().x, out.rect(top[1]).unwrap().x);
        assert!(out.rect(fork).unwrap().y > out.rect(other).unwrap().y);
    }

    #[test]
    fn test_empty_rows_take_no_space() {
        let mut tree = BranchTree::new();
        let top = chain(&mut tree, 0, 0, &["a"]);
        let lower = chain(&mut tree, 1, 0, &["b"]);
        let config = LayoutConfig::default();
        let before = layout(&tree, &config);

        tree.insert_row_after(0).unwrap();
        let after = layout(&tree, &config);
        assert_eq!(before.rect(top[0]), after.rect(top[0]));
        assert_eq!(before.rect(lower[0]), after.rect(lower[0]));
    }

    #[test]
    fn test_deep_append_lays_out_below_previous_row() {
        let mut tree = BranchTree::new();
        let top = chain(&mut tree, 0, 0, &["a"]);
        let deep = chain(&mut tree, 4, 0, &["b"]);
        let out = layout(&tree, &LayoutConfig::default());
        let a = out.rect(top[0]).unwrap();
        let b = out.rect(deep[0]).unwrap();
        assert_eq!(b.y, a.bottom() + 10);
        assert_eq!(out.canvas.height, b.bottom() + 10);
    }

    #[test]
    fn test_unanchored_leading_node_falls_back_to_margin() {
        let mut tree = BranchTree::new();
        let ids = chain(&mut tree, 0, 3, &["x"]);
        let out = layout(&tree, &LayoutConfig::default());
        assert_eq!(out.rect(ids[0]).unwrap().x, 10);
    }
}
