#![forbid(unsafe_code)]
//! Hierarchical path index carrying per-node change status.
//!
//! The tree is rooted at the implicit snapshot root. Each node owns an
//! ordered map from one path segment to a child node plus its own
//! [`Status`] mask. Paths are `/`-separated sequences of non-empty
//! segments, relative to the snapshot root.
//!
//! A node exists iff it is an ancestor of a node with non-zero status,
//! itself has non-zero status, or is required transiently during a
//! rename/merge. `erase` prunes scaffolding that stops satisfying this
//! rule.

use sdf_types::Status;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Default)]
struct Node {
    status: Status,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn find(&self, path: &str) -> Option<&Node> {
        match path.split_once('/') {
            None => self.children.get(path),
            Some((head, rest)) => self.children.get(head)?.find(rest),
        }
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut Node> {
        match path.split_once('/') {
            None => self.children.get_mut(path),
            Some((head, rest)) => self.children.get_mut(head)?.find_mut(rest),
        }
    }

    fn insert(&mut self, path: &str) -> &mut Node {
        match path.split_once('/') {
            None => self.children.entry(path.to_owned()).or_default(),
            Some((head, rest)) => self
                .children
                .entry(head.to_owned())
                .or_default()
                .insert(rest),
        }
    }

    fn erase(&mut self, path: &str) -> bool {
        match path.split_once('/') {
            None => {
                let Some(child) = self.children.get_mut(path) else {
                    return false;
                };
                if child.children.is_empty() {
                    self.children.remove(path);
                } else {
                    // Directory stays as a scaffold for live descendants.
                    child.status = Status::EMPTY;
                }
                true
            }
            Some((head, rest)) => {
                let Some(child) = self.children.get_mut(head) else {
                    return false;
                };
                let existed = child.erase(rest);
                if child.status.is_empty() && child.children.is_empty() {
                    self.children.remove(head);
                }
                existed
            }
        }
    }

    fn visit<F: FnMut(&str, Status)>(&self, prefix: &str, f: &mut F) {
        for (name, child) in &self.children {
            let path = join(prefix, name);
            f(&path, child.status);
            child.visit(&path, f);
        }
    }

    fn refine<F: FnMut(&str, Status) -> Status>(&mut self, prefix: &str, f: &mut F) {
        for (name, child) in &mut self.children {
            let path = join(prefix, name);
            child.status = f(&path, child.status);
            child.refine(&path, f);
        }
    }

    fn has_live_descendant(&self) -> bool {
        self.children
            .values()
            .any(|c| !c.status.is_empty() || c.has_live_descendant())
    }

    fn validate(&self, prefix: &str) -> Result<(), TreeInvariantError> {
        for (name, child) in &self.children {
            let path = join(prefix, name);
            if child.status.contains(Status::CREATED) && child.status.contains(Status::DELETED) {
                return Err(TreeInvariantError::CreateDeleteConflict { path });
            }
            if child.status.is_empty() && !child.has_live_descendant() {
                return Err(TreeInvariantError::DanglingScaffold { path });
            }
            child.validate(&path)?;
        }
        Ok(())
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Invariant violations reported by [`ChangeTree::validate_invariants`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeInvariantError {
    #[error("node {path} carries both created and deleted")]
    CreateDeleteConflict { path: String },
    #[error("node {path} has zero status and no live descendant")]
    DanglingScaffold { path: String },
}

/// A subtree detached during a rename-over-existing merge. The statuses
/// of its nodes survive; its structure is walked once and discarded.
#[derive(Debug)]
pub struct DetachedSubtree {
    children: BTreeMap<String, Node>,
}

impl DetachedSubtree {
    /// Visit every node of the detached subtree in pre-order with its
    /// path relative to the detach point.
    pub fn visit<F: FnMut(&str, Status)>(&self, mut f: F) {
        for (name, child) in &self.children {
            f(name, child.status);
            child.visit(name, &mut f);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// The change tree: a trie of touched paths, each carrying a status mask.
#[derive(Debug, Default)]
pub struct ChangeTree {
    root: Node,
}

impl ChangeTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Pure lookup; `None` when no node exists at `path`.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<Status> {
        self.root.find(path).map(|n| n.status)
    }

    /// Mutable status access for an existing node.
    pub fn status_mut(&mut self, path: &str) -> Option<&mut Status> {
        self.root.find_mut(path).map(|n| &mut n.status)
    }

    /// Find-or-insert: missing intermediates are created with status 0.
    pub fn insert(&mut self, path: &str) -> &mut Status {
        &mut self.root.insert(path).status
    }

    /// Erase per the pruning rule: a leaf is unlinked; a node with live
    /// children is zeroed; ancestors left with zero status and no
    /// children are unlinked as well. Returns whether `path` existed.
    pub fn erase(&mut self, path: &str) -> bool {
        self.root.erase(path)
    }

    /// Relocate the node at `from` to `to`, moving status and children.
    /// Fails (returns `false`, tree untouched) if `from` is absent or
    /// `to` already exists.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if self.root.find(to).is_some() {
            return false;
        }
        let (status, children) = {
            let Some(node) = self.root.find_mut(from) else {
                return false;
            };
            (
                std::mem::take(&mut node.status),
                std::mem::take(&mut node.children),
            )
        };
        self.root.erase(from);
        let dst = self.root.insert(to);
        dst.status = status;
        dst.children = children;
        true
    }

    /// Detach the children of the node at `path`, leaving the node
    /// itself in place. Returns an empty subtree when `path` is absent.
    pub fn take_children(&mut self, path: &str) -> DetachedSubtree {
        let children = match self.root.find_mut(path) {
            Some(node) => std::mem::take(&mut node.children),
            None => BTreeMap::new(),
        };
        DetachedSubtree { children }
    }

    /// Pre-order walk over every node; siblings in lexicographic order.
    pub fn visit<F: FnMut(&str, Status)>(&self, mut f: F) {
        self.root.visit("", &mut f);
    }

    /// Pre-order walk replacing each node's status with `f(path, status)`.
    pub fn refine<F: FnMut(&str, Status) -> Status>(&mut self, mut f: F) {
        self.root.refine("", &mut f);
    }

    /// Check structural invariants: no node carries both `CREATED` and
    /// `DELETED`, and no zero-status node lacks a live descendant.
    pub fn validate_invariants(&self) -> Result<(), TreeInvariantError> {
        self.root.validate("")
    }

    /// Log the whole tree at debug level.
    pub fn dump(&self) {
        self.visit(|path, status| {
            debug!(path, status = %status, "change_tree_node");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect(tree: &ChangeTree) -> Vec<(String, Status)> {
        let mut out = Vec::new();
        tree.visit(|p, s| out.push((p.to_owned(), s)));
        out
    }

    #[test]
    fn insert_creates_zero_status_intermediates() {
        let mut tree = ChangeTree::new();
        *tree.insert("a/b/c") = Status::CREATED;
        assert_eq!(tree.find("a"), Some(Status::EMPTY));
        assert_eq!(tree.find("a/b"), Some(Status::EMPTY));
        assert_eq!(tree.find("a/b/c"), Some(Status::CREATED));
        assert_eq!(tree.find("a/b/c/d"), None);
        tree.validate_invariants().expect("invariants");
    }

    #[test]
    fn erase_leaf_prunes_scaffolding() {
        let mut tree = ChangeTree::new();
        *tree.insert("a/b/c") = Status::CONTENT;
        assert!(tree.erase("a/b/c"));
        assert!(tree.is_empty(), "empty ancestors must be unlinked");
    }

    #[test]
    fn erase_keeps_scaffold_with_live_children() {
        let mut tree = ChangeTree::new();
        *tree.insert("a") = Status::DELETED;
        *tree.insert("a/x") = Status::CREATED;
        assert!(tree.erase("a"));
        // `a` survives as a scaffold because `a/x` is live.
        assert_eq!(tree.find("a"), Some(Status::EMPTY));
        assert_eq!(tree.find("a/x"), Some(Status::CREATED));
        tree.validate_invariants().expect("invariants");
    }

    #[test]
    fn erase_missing_path_reports_false() {
        let mut tree = ChangeTree::new();
        *tree.insert("a") = Status::CREATED;
        assert!(!tree.erase("b"));
        assert!(!tree.erase("a/b"));
        assert!(tree.erase("a"));
    }

    #[test]
    fn rename_moves_status_and_children() {
        let mut tree = ChangeTree::new();
        *tree.insert("d") = Status::CREATED;
        *tree.insert("d/x") = Status::CREATED;
        assert!(tree.rename("d", "e"));
        assert_eq!(
            collect(&tree),
            vec![
                ("e".to_owned(), Status::CREATED),
                ("e/x".to_owned(), Status::CREATED),
            ]
        );
    }

    #[test]
    fn rename_fails_without_source_or_onto_existing() {
        let mut tree = ChangeTree::new();
        *tree.insert("a") = Status::CREATED;
        *tree.insert("b") = Status::CONTENT;
        assert!(!tree.rename("missing", "c"));
        assert!(!tree.rename("a", "b"));
        // Failed renames leave the tree untouched.
        assert_eq!(tree.find("a"), Some(Status::CREATED));
        assert_eq!(tree.find("b"), Some(Status::CONTENT));
    }

    #[test]
    fn rename_then_reverse_is_identity() {
        let mut tree = ChangeTree::new();
        *tree.insert("d/x") = Status::CONTENT;
        *tree.insert("d/y/z") = Status::CREATED;
        let before = collect(&tree);
        assert!(tree.rename("d", "e"));
        assert!(tree.rename("e", "d"));
        assert_eq!(collect(&tree), before);
    }

    #[test]
    fn take_children_detaches_subtree() {
        let mut tree = ChangeTree::new();
        *tree.insert("d") = Status::CREATED;
        *tree.insert("d/x") = Status::CONTENT;
        *tree.insert("d/y/z") = Status::CREATED;
        let detached = tree.take_children("d");
        assert_eq!(tree.find("d"), Some(Status::CREATED));
        assert_eq!(tree.find("d/x"), None);

        let mut seen = Vec::new();
        detached.visit(|p, s| seen.push((p.to_owned(), s)));
        assert_eq!(
            seen,
            vec![
                ("x".to_owned(), Status::CONTENT),
                ("y".to_owned(), Status::EMPTY),
                ("y/z".to_owned(), Status::CREATED),
            ]
        );
        assert!(tree.take_children("missing").is_empty());
    }

    #[test]
    fn visit_is_preorder_lexicographic() {
        let mut tree = ChangeTree::new();
        *tree.insert("b") = Status::CONTENT;
        *tree.insert("a/z") = Status::CREATED;
        *tree.insert("a/k") = Status::DELETED;
        let paths: Vec<String> = collect(&tree).into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a", "a/k", "a/z", "b"]);
    }

    #[test]
    fn refine_replaces_statuses() {
        let mut tree = ChangeTree::new();
        *tree.insert("a") = Status::CONTENT | Status::PERMISSIONS;
        *tree.insert("b") = Status::CREATED;
        tree.refine(|path, status| {
            if path == "a" {
                Status::PERMISSIONS
            } else {
                status
            }
        });
        assert_eq!(tree.find("a"), Some(Status::PERMISSIONS));
        assert_eq!(tree.find("b"), Some(Status::CREATED));
    }

    #[test]
    fn validate_flags_conflicting_node() {
        let mut tree = ChangeTree::new();
        *tree.insert("a") = Status::CREATED | Status::DELETED;
        assert_eq!(
            tree.validate_invariants(),
            Err(TreeInvariantError::CreateDeleteConflict {
                path: "a".to_owned()
            })
        );
    }

    // Random create/delete/rename sequences keep the structural
    // invariants, as long as every inserted node gets a real status,
    // which is how the stream aggregator always drives the tree.
    proptest! {
        #[test]
        fn random_ops_preserve_invariants(ops in proptest::collection::vec((0_u8..3, 0_usize..6, 0_usize..6), 0..40)) {
            let paths = ["a", "b", "a/x", "a/y", "b/x", "a/x/q"];
            let mut tree = ChangeTree::new();
            for (op, i, j) in ops {
                match op {
                    0 => *tree.insert(paths[i]) = Status::CREATED,
                    1 => { tree.erase(paths[i]); }
                    _ => { tree.rename(paths[i], paths[j]); }
                }
            }
            prop_assert!(tree.validate_invariants().is_ok());
        }
    }
}
