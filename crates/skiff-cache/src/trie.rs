//! Character-level prefix trie for short-id resolution.

use std::collections::HashMap;

/// Outcome of a prefix lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixLookup {
    /// No id starts with the prefix.
    None,
    /// Exactly one id starts with the prefix (or the prefix is itself a
    /// complete id, which wins over longer ids sharing it).
    Unique(String),
    /// Two or more ids start with the prefix.
    Ambiguous,
}

#[derive(Default)]
struct Node {
    children: HashMap<u8, Node>,
    /// Set when a complete id terminates at this node.
    terminal: bool,
}

impl Node {
    fn count_terminals(&self) -> usize {
        let mut count = usize::from(self.terminal);
        for child in self.children.values() {
            count += child.count_terminals();
            if count > 1 {
                return count;
            }
        }
        count
    }

    fn first_terminal(&self, prefix: &mut Vec<u8>) -> Option<String> {
        if self.terminal {
            return Some(String::from_utf8_lossy(prefix).into_owned());
        }
        for (byte, child) in &self.children {
            prefix.push(*byte);
            if let Some(id) = child.first_terminal(prefix) {
                return Some(id);
            }
            prefix.pop();
        }
        None
    }
}

/// Prefix trie over opaque id strings.
#[derive(Default)]
pub struct IdTrie {
    root: Node,
}

impl IdTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &str) {
        let mut node = &mut self.root;
        for byte in id.bytes() {
            node = node.children.entry(byte).or_default();
        }
        node.terminal = true;
    }

    pub fn remove(&mut self, id: &str) {
        Self::remove_inner(&mut self.root, id.as_bytes());
    }

    fn remove_inner(node: &mut Node, rest: &[u8]) -> bool {
        match rest.split_first() {
            None => {
                node.terminal = false;
            }
            Some((byte, tail)) => {
                if let Some(child) = node.children.get_mut(byte) {
                    if Self::remove_inner(child, tail) {
                        node.children.remove(byte);
                    }
                }
            }
        }
        !node.terminal && node.children.is_empty()
    }

    /// Resolves a prefix to a full id. A prefix that is itself a complete
    /// id resolves to it even when longer ids share the prefix.
    #[must_use]
    pub fn lookup(&self, prefix: &str) -> PrefixLookup {
        if prefix.is_empty() {
            return PrefixLookup::None;
        }
        let mut node = &self.root;
        for byte in prefix.bytes() {
            match node.children.get(&byte) {
                Some(child) => node = child,
                None => return PrefixLookup::None,
            }
        }
        if node.terminal {
            return PrefixLookup::Unique(prefix.to_string());
        }
        match node.count_terminals() {
            0 => PrefixLookup::None,
            1 => {
                let mut buf = prefix.as_bytes().to_vec();
                node.first_terminal(&mut buf)
                    .map_or(PrefixLookup::None, PrefixLookup::Unique)
            }
            _ => PrefixLookup::Ambiguous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_prefix_resolves_to_full_id() {
        let mut trie = IdTrie::new();
        trie.insert("abcd1234");
        assert_eq!(
            trie.lookup("ab"),
            PrefixLookup::Unique("abcd1234".to_string())
        );
        assert_eq!(
            trie.lookup("abcd1234"),
            PrefixLookup::Unique("abcd1234".to_string())
        );
    }

    #[test]
    fn shared_prefix_is_ambiguous() {
        let mut trie = IdTrie::new();
        trie.insert("abcd1234");
        trie.insert("abef5678");
        assert_eq!(trie.lookup("ab"), PrefixLookup::Ambiguous);
        assert_eq!(
            trie.lookup("abc"),
            PrefixLookup::Unique("abcd1234".to_string())
        );
    }

    #[test]
    fn exact_id_wins_over_longer_sibling() {
        let mut trie = IdTrie::new();
        trie.insert("abcd");
        trie.insert("abcd99");
        assert_eq!(trie.lookup("abcd"), PrefixLookup::Unique("abcd".to_string()));
        assert_eq!(trie.lookup("abc"), PrefixLookup::Ambiguous);
    }

    #[test]
    fn remove_prunes_dead_branches() {
        let mut trie = IdTrie::new();
        trie.insert("abcd1234");
        trie.insert("abef5678");
        trie.remove("abcd1234");
        assert_eq!(
            trie.lookup("ab"),
            PrefixLookup::Unique("abef5678".to_string())
        );
        assert_eq!(trie.lookup("abc"), PrefixLookup::None);
    }

    #[test]
    fn empty_prefix_matches_nothing() {
        let mut trie = IdTrie::new();
        trie.insert("abcd");
        assert_eq!(trie.lookup(""), PrefixLookup::None);
    }
}
