//! Decision tree produced by one distillation cycle
//!
//! Nodes own their children exclusively; a tree lives only long enough for
//! the optimizer to flatten it into rules.

use crate::rule::ActionId;

/// A decision tree node (internal split or leaf)
#[derive(Debug, Clone, PartialEq)]
pub enum TreeNode {
    /// Single-feature threshold split; `value <= threshold` goes left
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
    /// Terminal node naming the dominant action of its samples
    Leaf {
        action: ActionId,
        confidence: f64,
        samples: usize,
        impurity: f64,
    },
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self, TreeNode::Leaf { .. })
    }

    fn depth(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 0,
            TreeNode::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    fn count(&self) -> (usize, usize) {
        match self {
            TreeNode::Leaf { .. } => (1, 1),
            TreeNode::Split { left, right, .. } => {
                let (ln, ll) = left.count();
                let (rn, rl) = right.count();
                (1 + ln + rn, ll + rl)
            }
        }
    }
}

/// Classification tree over state vectors
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionTree {
    pub root: TreeNode,
    /// State dimensionality the tree was grown on
    pub feature_count: usize,
    /// Samples the root was grown from
    pub total_samples: usize,
}

impl DecisionTree {
    pub fn new(root: TreeNode, feature_count: usize, total_samples: usize) -> Self {
        Self {
            root,
            feature_count,
            total_samples,
        }
    }

    /// Walk the tree for `state` and return the leaf's action and confidence
    ///
    /// A feature missing from `state` is read as `0.0`.
    pub fn predict(&self, state: &[f64]) -> (ActionId, f64) {
        let mut node = &self.root;
        loop {
            match node {
                TreeNode::Leaf {
                    action, confidence, ..
                } => return (*action, *confidence),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = state.get(*feature).copied().unwrap_or(0.0);
                    node = if value <= *threshold { left } else { right };
                }
            }
        }
    }

    /// Number of split levels on the longest root-to-leaf path
    pub fn depth(&self) -> usize {
        self.root.depth()
    }

    pub fn node_count(&self) -> usize {
        self.root.count().0
    }

    pub fn leaf_count(&self) -> usize {
        self.root.count().1
    }
}
