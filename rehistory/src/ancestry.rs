use std::collections::HashMap;

use crate::elements::ParentRef;

/// DAG of commits for answering "is a an ancestor of b" during
/// degenerate-merge trimming. Nodes are interned to indices into one
/// arena; the recorded depth (1 + max parent depth) bounds the search
/// so queries only walk the history they can possibly reach.
#[derive(Debug, Default)]
pub struct AncestryGraph {
    index: HashMap<ParentRef, usize>,
    // (depth, parent indices)
    nodes: Vec<(u32, Vec<usize>)>,
}

impl AncestryGraph {
    pub fn new() -> Self {
        AncestryGraph::default()
    }

    /// Register a commit known only by its external id. Such commits
    /// act as roots: depth 1, no recorded parents.
    pub fn record_external(&mut self, id: &ParentRef) {
        if !self.index.contains_key(id) {
            self.index.insert(id.clone(), self.nodes.len());
            self.nodes.push((1, Vec::new()));
        }
    }

    /// Record `commit` with the given parents, all of which must have
    /// been recorded earlier.
    pub fn add(&mut self, commit: ParentRef, parents: &[ParentRef]) {
        debug_assert!(!self.index.contains_key(&commit));
        let parent_idx: Vec<usize> = parents
            .iter()
            .filter_map(|p| self.index.get(p).copied())
            .collect();
        let depth = 1 + parent_idx
            .iter()
            .map(|&i| self.nodes[i].0)
            .max()
            .unwrap_or(0);
        self.index.insert(commit, self.nodes.len());
        self.nodes.push((depth, parent_idx));
    }

    pub fn contains(&self, id: &ParentRef) -> bool {
        self.index.contains_key(id)
    }

    /// Whether `ancestor` is reachable from `descendant` by walking
    /// parent edges. Unknown nodes are never ancestors.
    pub fn is_ancestor(&self, ancestor: &ParentRef, descendant: &ParentRef) -> bool {
        let (a, b) = match (self.index.get(ancestor), self.index.get(descendant)) {
            (Some(&a), Some(&b)) => (a, b),
            _ => return false,
        };
        let a_depth = self.nodes[a].0;
        let mut stack = vec![b];
        let mut visited = vec![false; self.nodes.len()];
        while let Some(cur) = stack.pop() {
            if visited[cur] {
                continue;
            }
            visited[cur] = true;
            if cur == a {
                return true;
            }
            let (depth, parents) = &self.nodes[cur];
            if *depth <= a_depth {
                continue;
            }
            stack.extend(parents.iter().copied());
        }
        false
    }
}
