//! Prefix tree keyed by slash-delimited object paths.
//!
//! Nodes carry an optional payload; a node without a payload is a structural
//! ancestor kept alive only by its descendants. Removal prunes such
//! ancestors, so the tree never accumulates empty branches.

use std::collections::BTreeMap;

/// Non-empty elements of an object path, in order.
pub fn path_elements(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|e| !e.is_empty())
}

/// Canonical form of an object path: leading slash, no empty elements.
pub fn canonical_path(path: &str) -> String {
    let joined = path_elements(path).collect::<Vec<_>>().join("/");
    format!("/{}", joined)
}

#[derive(Debug)]
struct Node<T> {
    data: Option<T>,
    children: BTreeMap<String, Node<T>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Node { data: None, children: BTreeMap::new() }
    }
}

/// Ordered mapping from object path to an optional payload.
#[derive(Debug)]
pub struct PathTree<T> {
    root: Node<T>,
}

impl<T> Default for PathTree<T> {
    fn default() -> Self {
        PathTree::new()
    }
}

impl<T> PathTree<T> {
    pub fn new() -> Self {
        PathTree { root: Node::new() }
    }

    fn node(&self, path: &str) -> Option<&Node<T>> {
        let mut node = &self.root;
        for element in path_elements(path) {
            node = node.children.get(element)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, path: &str) -> Option<&mut Node<T>> {
        let mut node = &mut self.root;
        for element in path_elements(path) {
            node = node.children.get_mut(element)?;
        }
        Some(node)
    }

    fn ensure(&mut self, path: &str) -> &mut Node<T> {
        let mut node = &mut self.root;
        for element in path_elements(path) {
            node = node.children.entry(element.to_string()).or_insert_with(Node::new);
        }
        node
    }

    /// Payload at `path`, if the node exists and carries one.
    pub fn get(&self, path: &str) -> Option<&T> {
        self.node(path)?.data.as_ref()
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut T> {
        self.node_mut(path)?.data.as_mut()
    }

    /// True when the node exists, payload-bearing or not.
    pub fn contains_node(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    /// True when the node exists and has at least one child.
    pub fn has_children(&self, path: &str) -> bool {
        self.node(path).map(|n| !n.children.is_empty()).unwrap_or(false)
    }

    /// Stores `data` at `path`, creating payload-less ancestors as needed.
    pub fn insert(&mut self, path: &str, data: T) {
        self.ensure(path).data = Some(data);
    }

    /// Payload at `path`, created with `T::default()` if absent. Missing
    /// ancestors are created without payloads.
    pub fn setdefault(&mut self, path: &str) -> &mut T
    where
        T: Default,
    {
        let node = self.ensure(path);
        if node.data.is_none() {
            node.data = Some(T::default());
        }
        node.data.as_mut().unwrap()
    }

    /// Clears the payload at `path` while keeping the node. Used when live
    /// descendants still reference it as an ancestor.
    pub fn demote(&mut self, path: &str) {
        if let Some(node) = self.node_mut(path) {
            node.data = None;
        }
    }

    /// Removes the node at `path` and prunes any ancestors left without both
    /// payload and children, up to but not including the root.
    pub fn remove(&mut self, path: &str) -> Option<T> {
        let elements: Vec<&str> = path_elements(path).collect();
        if elements.is_empty() {
            return self.root.data.take();
        }
        Self::remove_in(&mut self.root, &elements)
    }

    fn remove_in(node: &mut Node<T>, elements: &[&str]) -> Option<T> {
        let removed;
        let prune;
        {
            let child = node.children.get_mut(elements[0])?;
            removed = if elements.len() == 1 {
                child.data.take()
            } else {
                Self::remove_in(child, &elements[1..])
            };
            prune = child.data.is_none() && child.children.is_empty();
        }
        if prune {
            node.children.remove(elements[0]);
        }
        removed
    }

    /// Payload-bearing nodes strictly inside `subtree`, as
    /// `(absolute_path, payload)` pairs in tree order. `depth` bounds how many
    /// path elements below the subtree root are reported; `0` means
    /// unbounded. Returns `None` when the subtree root node does not exist.
    pub fn items(&self, subtree: &str, depth: usize) -> Option<Vec<(String, &T)>> {
        let root = self.node(subtree)?;
        let mut base = {
            let joined = path_elements(subtree).collect::<Vec<_>>().join("/");
            if joined.is_empty() { String::new() } else { format!("/{}", joined) }
        };
        let mut out = Vec::new();
        Self::collect(root, &mut base, 1, depth, &mut out);
        Some(out)
    }

    fn collect<'a>(
        node: &'a Node<T>,
        base: &mut String,
        level: usize,
        depth: usize,
        out: &mut Vec<(String, &'a T)>,
    ) {
        for (name, child) in &node.children {
            let saved = base.len();
            base.push('/');
            base.push_str(name);
            if depth == 0 || level <= depth {
                if let Some(data) = &child.data {
                    out.push((base.clone(), data));
                }
            }
            Self::collect(child, base, level + 1, depth, out);
            base.truncate(saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[(String, &i32)]) -> Vec<String> {
        items.iter().map(|(p, _)| p.clone()).collect()
    }

    #[test]
    fn canonicalizes() {
        assert_eq!(canonical_path("/a//b/"), "/a/b");
        assert_eq!(canonical_path("a/b"), "/a/b");
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path(""), "/");
    }

    #[test]
    fn insert_creates_ancestors() {
        let mut t = PathTree::new();
        t.insert("/a/b/c", 1);
        assert_eq!(t.get("/a/b/c"), Some(&1));
        assert!(t.contains_node("/a"));
        assert!(t.contains_node("/a/b"));
        assert_eq!(t.get("/a"), None);
        assert!(t.has_children("/a"));
        assert!(!t.has_children("/a/b/c"));
    }

    #[test]
    fn remove_prunes_empty_ancestors() {
        let mut t = PathTree::new();
        t.insert("/a/b/c", 1);
        assert_eq!(t.remove("/a/b/c"), Some(1));
        assert!(!t.contains_node("/a"));
        assert!(t.contains_node("/"));
    }

    #[test]
    fn remove_keeps_populated_ancestors() {
        let mut t = PathTree::new();
        t.insert("/a/b", 1);
        t.insert("/a/b/c", 2);
        assert_eq!(t.remove("/a/b/c"), Some(2));
        assert_eq!(t.get("/a/b"), Some(&1));

        t.insert("/a/x/y", 3);
        t.remove("/a/x/y");
        assert!(!t.contains_node("/a/x"));
        assert!(t.contains_node("/a/b"));
    }

    #[test]
    fn demote_keeps_the_node() {
        let mut t = PathTree::new();
        t.insert("/a/b", 1);
        t.demote("/a/b");
        assert_eq!(t.get("/a/b"), None);
        assert!(t.contains_node("/a/b"));
    }

    #[test]
    fn items_excludes_the_subtree_root() {
        let mut t = PathTree::new();
        t.insert("/", 0);
        t.insert("/a", 1);
        t.insert("/a/b", 2);
        let got = t.items("/", 0).unwrap();
        assert_eq!(paths(&got), vec!["/a", "/a/b"]);

        let got = t.items("/a", 0).unwrap();
        assert_eq!(paths(&got), vec!["/a/b"]);
    }

    #[test]
    fn items_bounds_depth() {
        let mut t = PathTree::new();
        t.insert("/a", 1);
        t.insert("/a/b", 2);
        t.insert("/a/b/c", 3);
        let got = t.items("/a", 1).unwrap();
        assert_eq!(paths(&got), vec!["/a/b"]);

        let got = t.items("/a", 2).unwrap();
        assert_eq!(paths(&got), vec!["/a/b", "/a/b/c"]);
    }

    #[test]
    fn items_skips_structural_nodes() {
        let mut t = PathTree::new();
        t.insert("/a/b/c", 1);
        let got = t.items("/", 0).unwrap();
        assert_eq!(paths(&got), vec!["/a/b/c"]);
    }

    #[test]
    fn items_requires_the_subtree_node() {
        let t: PathTree<i32> = PathTree::new();
        assert!(t.items("/missing", 0).is_none());
        assert!(t.items("/", 0).is_some());
    }
}
