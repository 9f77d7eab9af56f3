//! Process tree pane model.
//!
//! The tree is rooted at the selected process and grows lazily: children are read from the
//! process cache when a node is expanded, never ahead of time.

use crate::process_cache::ProcessCache;
use proctrace::Pid;

/// What a tree row points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    /// A row with nothing behind it, e.g. the hint of an empty tree
    Empty,
    Process(Pid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub reference: NodeRef,
    pub label: String,
    /// Whether the process had children when the node was built
    pub has_children: bool,
    pub expanded: bool,
    children: Vec<TreeNode>,
}

impl TreeNode {
    fn empty(label: impl Into<String>) -> Self {
        Self {
            reference: NodeRef::Empty,
            label: label.into(),
            has_children: false,
            expanded: false,
            children: Vec::new(),
        }
    }

    fn process(processes: &ProcessCache, pid: Pid) -> Self {
        let record = processes.get_process(pid);
        Self {
            reference: NodeRef::Process(pid),
            label: format!("[{pid}] {}", record.command),
            has_children: !record.children.is_empty(),
            expanded: false,
            children: Vec::new(),
        }
    }

    /// Read the current children and show them
    fn expand(&mut self, processes: &ProcessCache) {
        let NodeRef::Process(pid) = self.reference else {
            return;
        };
        let children = processes.children(pid);
        self.has_children = !children.is_empty();
        self.children = children
            .into_iter()
            .map(|child| TreeNode::process(processes, child))
            .collect();
        self.expanded = true;
    }

    fn collapse(&mut self) {
        self.expanded = false;
    }
}

/// A visible row of the tree
#[derive(Debug, Clone, Copy)]
pub struct TreeRow<'a> {
    pub depth: usize,
    pub node: &'a TreeNode,
}

#[derive(Debug, Default)]
pub struct ProcessTree {
    root: Option<TreeNode>,
    selected: usize,
}

impl ProcessTree {
    /// Re-root the tree at `pid`, expanded one level. Re-rooting at the current root keeps the
    /// tree as it is.
    pub fn set_root(&mut self, processes: &ProcessCache, pid: Pid) {
        if self.root_pid() == Some(pid) {
            return;
        }
        self.rebuild(processes, pid);
    }

    /// Build the tree at `pid` from scratch, e.g. after killing one of its processes
    pub fn rebuild(&mut self, processes: &ProcessCache, pid: Pid) {
        let mut root = TreeNode::process(processes, pid);
        root.expand(processes);
        self.root = Some(root);
        self.selected = 0;
    }

    pub fn clear(&mut self, hint: &str) {
        self.root = Some(TreeNode::empty(hint));
        self.selected = 0;
    }

    pub fn root_pid(&self) -> Option<Pid> {
        match self.root.as_ref()?.reference {
            NodeRef::Process(pid) => Some(pid),
            NodeRef::Empty => None,
        }
    }

    /// Rows in display order, children of collapsed nodes are skipped
    pub fn visible_rows(&self) -> Vec<TreeRow<'_>> {
        fn walk<'a>(node: &'a TreeNode, depth: usize, rows: &mut Vec<TreeRow<'a>>) {
            rows.push(TreeRow { depth, node });
            if node.expanded {
                for child in &node.children {
                    walk(child, depth + 1, rows);
                }
            }
        }

        let mut rows = Vec::new();
        if let Some(root) = &self.root {
            walk(root, 0, &mut rows);
        }
        rows
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected(&self) -> NodeRef {
        self.visible_rows()
            .get(self.selected)
            .map(|row| row.node.reference)
            .unwrap_or(NodeRef::Empty)
    }

    /// Move the cursor down, returns whether it moved
    pub fn select_next(&mut self) -> bool {
        if self.selected + 1 < self.visible_rows().len() {
            self.selected += 1;
            true
        } else {
            false
        }
    }

    pub fn select_previous(&mut self) -> bool {
        if self.selected > 0 {
            self.selected -= 1;
            true
        } else {
            false
        }
    }

    pub fn expand_selected(&mut self, processes: &ProcessCache) {
        if let Some(node) = self.selected_node_mut() {
            node.expand(processes);
        }
    }

    pub fn collapse_selected(&mut self) {
        if let Some(node) = self.selected_node_mut() {
            node.collapse();
        }
    }

    pub fn toggle_selected(&mut self, processes: &ProcessCache) {
        if let Some(node) = self.selected_node_mut() {
            if node.expanded {
                node.collapse();
            } else {
                node.expand(processes);
            }
        }
    }

    fn selected_node_mut(&mut self) -> Option<&mut TreeNode> {
        fn nth_visible<'a>(node: &'a mut TreeNode, n: &mut usize) -> Option<&'a mut TreeNode> {
            if *n == 0 {
                return Some(node);
            }
            *n -= 1;
            if node.expanded {
                for child in &mut node.children {
                    if let Some(found) = nth_visible(child, n) {
                        return Some(found);
                    }
                }
            }
            None
        }

        let mut n = self.selected;
        nth_visible(self.root.as_mut()?, &mut n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc_table::testing::{FakeProcessTable, pid};
    use std::sync::Arc;

    /// 1 (init) -> 10 (sshd) -> 100 (bash) -> 1000 (vim)
    ///          -> 2 (cron)
    fn fixture() -> (Arc<FakeProcessTable>, ProcessCache) {
        let table = Arc::new(FakeProcessTable::with_commands(&[
            (1, "init"),
            (2, "cron"),
            (10, "sshd"),
            (100, "bash"),
            (1000, "vim"),
        ]));
        table.set_children(pid(1), &[10, 2]);
        table.set_children(pid(10), &[100]);
        table.set_children(pid(100), &[1000]);
        let cache = ProcessCache::new(table.clone()).unwrap();
        (table, cache)
    }

    fn labels(tree: &ProcessTree) -> Vec<String> {
        tree.visible_rows()
            .iter()
            .map(|row| format!("{}{}", "  ".repeat(row.depth), row.node.label))
            .collect()
    }

    #[test]
    fn test_root_is_expanded_one_level() {
        let (_table, cache) = fixture();
        let mut tree = ProcessTree::default();
        tree.set_root(&cache, pid(1));

        assert_eq!(labels(&tree), ["[1] init", "  [2] cron", "  [10] sshd"]);
        assert_eq!(tree.selected(), NodeRef::Process(pid(1)));
        let rows = tree.visible_rows();
        assert!(!rows[1].node.has_children);
        assert!(rows[2].node.has_children);
    }

    #[test]
    fn test_expand_collapse_and_toggle() {
        let (_table, cache) = fixture();
        let mut tree = ProcessTree::default();
        tree.set_root(&cache, pid(1));

        assert!(tree.select_next());
        assert!(tree.select_next());
        assert!(!tree.select_next());
        tree.expand_selected(&cache);
        assert_eq!(
            labels(&tree),
            ["[1] init", "  [2] cron", "  [10] sshd", "    [100] bash"]
        );

        assert!(tree.select_next());
        tree.toggle_selected(&cache);
        assert_eq!(labels(&tree).last().unwrap(), "      [1000] vim");

        assert!(tree.select_previous());
        tree.collapse_selected();
        assert_eq!(labels(&tree), ["[1] init", "  [2] cron", "  [10] sshd"]);
        tree.toggle_selected(&cache);
        assert_eq!(labels(&tree).len(), 4);
    }

    #[test]
    fn test_expand_reads_fresh_children() {
        let (table, cache) = fixture();
        let mut tree = ProcessTree::default();
        tree.set_root(&cache, pid(10));
        assert_eq!(labels(&tree), ["[10] sshd", "  [100] bash"]);

        table.set_children(pid(10), &[]);
        tree.collapse_selected();
        tree.expand_selected(&cache);
        assert_eq!(labels(&tree), ["[10] sshd"]);
        assert!(!tree.visible_rows()[0].node.has_children);
    }

    #[test]
    fn test_set_root_keeps_same_root() {
        let (_table, cache) = fixture();
        let mut tree = ProcessTree::default();
        tree.set_root(&cache, pid(1));
        tree.select_next();

        tree.set_root(&cache, pid(1));
        assert_eq!(tree.selected_index(), 1);

        tree.set_root(&cache, pid(10));
        assert_eq!(tree.selected_index(), 0);
        assert_eq!(tree.root_pid(), Some(pid(10)));

        tree.rebuild(&cache, pid(10));
        assert_eq!(tree.selected(), NodeRef::Process(pid(10)));
    }

    #[test]
    fn test_empty_tree() {
        let (_table, cache) = fixture();
        let mut tree = ProcessTree::default();
        assert_eq!(tree.selected(), NodeRef::Empty);
        assert!(!tree.select_next());

        tree.clear("no process selected");
        assert_eq!(tree.root_pid(), None);
        tree.toggle_selected(&cache);
        assert_eq!(labels(&tree), ["no process selected"]);
    }
}
