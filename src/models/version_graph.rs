//! Diff dependency graph of an object's versions.
//!
//! Nodes live in an arena indexed by position; each node points at the node
//! of its diff base, if any. Reachability is an explicit worklist walk.

use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct VersionNode {
    version: u64,
    base: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct VersionGraph {
    nodes: Vec<VersionNode>,
    index: HashMap<u64, usize>,
}

impl VersionGraph {
    /// Build from a `diff -> base` edge map.
    pub fn from_diff_edges(diff_to_base: &BTreeMap<u64, u64>) -> Self {
        let mut graph = Self::default();
        for (&diff, &base) in diff_to_base {
            let base_idx = graph.node(base);
            let diff_idx = graph.node(diff);
            graph.nodes[diff_idx].base = Some(base_idx);
        }
        graph
    }

    fn node(&mut self, version: u64) -> usize {
        if let Some(&idx) = self.index.get(&version) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(VersionNode {
            version,
            base: None,
        });
        self.index.insert(version, idx);
        idx
    }

    /// Every version reachable from `roots` by following diff-to-base edges,
    /// roots included.
    pub fn reachable_from(&self, roots: impl IntoIterator<Item = u64>) -> BTreeSet<u64> {
        let mut reached = BTreeSet::new();
        let mut visited = vec![false; self.nodes.len()];
        let mut worklist: Vec<usize> = Vec::new();
        for root in roots {
            reached.insert(root);
            if let Some(&idx) = self.index.get(&root) {
                worklist.push(idx);
            }
        }
        while let Some(idx) = worklist.pop() {
            if visited[idx] {
                continue;
            }
            visited[idx] = true;
            let node = &self.nodes[idx];
            reached.insert(node.version);
            if let Some(base) = node.base {
                worklist.push(base);
            }
        }
        reached
    }
}
