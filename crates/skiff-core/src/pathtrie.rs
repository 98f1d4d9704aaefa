//! Segment-level path trie over mount destinations.

use std::collections::BTreeMap;

/// Trie keyed by absolute paths, one node per path segment.
///
/// Drives archive stream dispatch: `visit_prefixes` finds the mounts
/// covering a path (most specific last), `visit_subtree` finds the mounts
/// rooted under a path.
pub struct PathTrie<T> {
    root: Node<T>,
}

struct Node<T> {
    children: BTreeMap<String, Node<T>>,
    value: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: BTreeMap::new(),
            value: None,
        }
    }
}

/// Splits an absolute path into segments, dropping empty components.
fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn join_key(segs: &[&str]) -> String {
    if segs.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segs.join("/"))
    }
}

impl<T> Default for PathTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PathTrie<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    pub fn insert(&mut self, path: &str, value: T) {
        let mut node = &mut self.root;
        for seg in segments(path) {
            node = node.children.entry(seg.to_string()).or_default();
        }
        node.value = Some(value);
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&T> {
        let mut node = &self.root;
        for seg in segments(path) {
            node = node.children.get(seg)?;
        }
        node.value.as_ref()
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut T> {
        let mut node = &mut self.root;
        for seg in segments(path) {
            node = node.children.get_mut(seg)?;
        }
        node.value.as_mut()
    }

    /// Calls `f` on every stored key that is a prefix of `path`, walking
    /// root to leaf so the deepest (most specific) match comes last.
    pub fn visit_prefixes(&self, path: &str, mut f: impl FnMut(&str, &T)) {
        let segs = segments(path);
        let mut node = &self.root;
        if let Some(value) = &node.value {
            f("/", value);
        }
        for (depth, seg) in segs.iter().enumerate() {
            match node.children.get(*seg) {
                Some(child) => {
                    node = child;
                    if let Some(value) = &node.value {
                        f(&join_key(&segs[..=depth]), value);
                    }
                }
                None => return,
            }
        }
    }

    /// Calls `f` on every stored key that has `path` as a prefix,
    /// including an exact match.
    pub fn visit_subtree(&self, path: &str, mut f: impl FnMut(&str, &T)) {
        let segs = segments(path);
        let mut node = &self.root;
        for seg in &segs {
            match node.children.get(*seg) {
                Some(child) => node = child,
                None => return,
            }
        }
        let mut prefix: Vec<&str> = segs;
        Self::walk(node, &mut prefix, &mut f);
    }

    fn walk<'a>(node: &'a Node<T>, prefix: &mut Vec<&'a str>, f: &mut impl FnMut(&str, &T)) {
        if let Some(value) = &node.value {
            f(&join_key(prefix), value);
        }
        for (seg, child) in &node.children {
            prefix.push(seg);
            Self::walk(child, prefix, f);
            prefix.pop();
        }
    }

    /// Deepest stored key covering `path`, if any.
    #[must_use]
    pub fn deepest_prefix(&self, path: &str) -> Option<String> {
        let mut found = None;
        self.visit_prefixes(path, |key, _| found = Some(key.to_string()));
        found
    }

    /// All stored keys, root first.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.visit_subtree("/", |key, _| keys.push(key.to_string()));
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PathTrie<u32> {
        let mut trie = PathTrie::new();
        trie.insert("/", 0);
        trie.insert("/mnt/A", 1);
        trie.insert("/mnt/A/AB", 2);
        trie.insert("/mnt/B", 3);
        trie
    }

    #[test]
    fn prefixes_visit_most_specific_last() {
        let trie = sample();
        let mut seen = Vec::new();
        trie.visit_prefixes("/mnt/A/AB/file.txt", |key, value| {
            seen.push((key.to_string(), *value));
        });
        assert_eq!(
            seen,
            vec![
                ("/".to_string(), 0),
                ("/mnt/A".to_string(), 1),
                ("/mnt/A/AB".to_string(), 2),
            ]
        );
    }

    #[test]
    fn deepest_prefix_dispatch() {
        let trie = sample();
        assert_eq!(trie.deepest_prefix("/mnt/A/b/file.txt").as_deref(), Some("/mnt/A"));
        assert_eq!(trie.deepest_prefix("/mnt/A/AB/x").as_deref(), Some("/mnt/A/AB"));
        assert_eq!(trie.deepest_prefix("/etc/hosts").as_deref(), Some("/"));
    }

    #[test]
    fn subtree_finds_nested_mounts() {
        let trie = sample();
        let mut seen = Vec::new();
        trie.visit_subtree("/mnt/A", |key, _| seen.push(key.to_string()));
        assert_eq!(seen, vec!["/mnt/A".to_string(), "/mnt/A/AB".to_string()]);

        let mut all = Vec::new();
        trie.visit_subtree("/", |key, _| all.push(key.to_string()));
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn subtree_of_unknown_path_is_empty() {
        let trie = sample();
        let mut seen = Vec::new();
        trie.visit_subtree("/does/not/exist", |key, _| seen.push(key.to_string()));
        assert!(seen.is_empty());
    }

    #[test]
    fn get_and_get_mut() {
        let mut trie = sample();
        assert_eq!(trie.get("/mnt/A"), Some(&1));
        assert_eq!(trie.get("/mnt"), None);
        *trie.get_mut("/mnt/A").unwrap() = 9;
        assert_eq!(trie.get("/mnt/A"), Some(&9));
    }
}
