//! Trie of topic filters for dispatching incoming messages.
//!
//! Each filter level is a node; `+` and `#` get dedicated child slots so a
//! lookup walks at most three branches per level. Unlike a router that picks
//! one best handler, [`TopicTrie::matches`] returns every value whose filter
//! matches the topic.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// Trie node for MQTT topic filter matching.
pub struct TrieNode<T> {
    children: HashMap<String, TrieNode<T>>,
    match_any: Option<Box<TrieNode<T>>>, // + wildcard
    match_all: Option<Box<TrieNode<T>>>, // # wildcard
    values: Vec<T>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TrieNode<T> {
    /// Create a new empty trie node.
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            match_any: None,
            match_all: None,
            values: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.children.is_empty()
            && self.match_any.is_none()
            && self.match_all.is_none()
    }

    fn node_mut(&mut self, filter: &str) -> Result<&mut TrieNode<T>> {
        let mut node = self;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            node = match level {
                "+" => node.match_any.get_or_insert_with(Box::default).as_mut(),
                "#" => {
                    if levels.peek().is_some() {
                        return Err(Error::InvalidTopic("# must be the last level".to_string()));
                    }
                    node.match_all.get_or_insert_with(Box::default).as_mut()
                }
                _ => node.children.entry(level.to_string()).or_default(),
            };
        }

        Ok(node)
    }

    fn collect<'a>(&'a self, levels: &[&str], at_root: bool, out: &mut Vec<&'a T>) {
        // `#` also matches the parent level ("a/#" matches "a")
        if let Some(ref all) = self.match_all {
            let dollar = at_root && levels.first().is_some_and(|l| l.starts_with('$'));
            if !dollar {
                out.extend(all.values.iter());
            }
        }

        let Some((first, rest)) = levels.split_first() else {
            out.extend(self.values.iter());
            return;
        };

        if let Some(child) = self.children.get(*first) {
            child.collect(rest, false, out);
        }

        if let Some(ref any) = self.match_any {
            if !(at_root && first.starts_with('$')) {
                any.collect(rest, false, out);
            }
        }
    }

    fn remove_where<F>(&mut self, levels: &[&str], predicate: &mut F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        let Some((first, rest)) = levels.split_first() else {
            let before = self.values.len();
            self.values.retain(|v| !predicate(v));
            return self.values.len() != before;
        };

        match *first {
            "+" => match self.match_any.as_mut() {
                Some(child) => {
                    let removed = child.remove_where(rest, predicate);
                    if child.is_empty() {
                        self.match_any = None;
                    }
                    removed
                }
                None => false,
            },
            "#" => match self.match_all.as_mut() {
                Some(child) => {
                    let removed = child.remove_where(rest, predicate);
                    if child.is_empty() {
                        self.match_all = None;
                    }
                    removed
                }
                None => false,
            },
            level => match self.children.get_mut(level) {
                Some(child) => {
                    let removed = child.remove_where(rest, predicate);
                    if child.is_empty() {
                        self.children.remove(level);
                    }
                    removed
                }
                None => false,
            },
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for TrieNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieNode")
            .field("values", &self.values)
            .field("children", &self.children)
            .field("+", &self.match_any)
            .field("#", &self.match_all)
            .finish()
    }
}

/// Topic filter trie.
#[derive(Debug)]
pub struct TopicTrie<T> {
    root: TrieNode<T>,
}

impl<T> Default for TopicTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TopicTrie<T> {
    pub fn new() -> Self {
        Self { root: TrieNode::new() }
    }

    /// Insert a value under the given filter.
    pub fn insert(&mut self, filter: &str, value: T) -> Result<()> {
        self.root.node_mut(filter)?.values.push(value);
        Ok(())
    }

    /// Values of every filter matching `topic`.
    pub fn matches(&self, topic: &str) -> Vec<&T> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut out = Vec::new();
        self.root.collect(&levels, true, &mut out);
        out
    }

    /// Remove values under `filter` for which `predicate` returns true.
    ///
    /// Returns true if anything was removed. Empty branches are pruned.
    pub fn remove<F>(&mut self, filter: &str, mut predicate: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.remove_where(&levels, &mut predicate)
    }

    pub fn clear(&mut self) {
        self.root = TrieNode::new();
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(values: Vec<&&'static str>) -> Vec<&'static str> {
        let mut values: Vec<_> = values.into_iter().copied().collect();
        values.sort();
        values
    }

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        trie.insert("device/gear-001/state", "exact").unwrap();

        assert_eq!(sorted(trie.matches("device/gear-001/state")), vec!["exact"]);
        assert!(trie.matches("device/gear-002/state").is_empty());
        assert!(trie.matches("device/gear-001").is_empty());
    }

    #[test]
    fn test_collects_every_matching_filter() {
        let mut trie = TopicTrie::new();
        trie.insert("a/b/c", "exact").unwrap();
        trie.insert("a/+/c", "plus").unwrap();
        trie.insert("a/#", "hash").unwrap();
        trie.insert("#", "all").unwrap();
        trie.insert("x/y", "other").unwrap();

        assert_eq!(sorted(trie.matches("a/b/c")), vec!["all", "exact", "hash", "plus"]);
        assert_eq!(sorted(trie.matches("a")), vec!["all", "hash"]);
        assert_eq!(sorted(trie.matches("a/b/c/d")), vec!["all", "hash"]);
    }

    #[test]
    fn test_dollar_topics_skip_root_wildcards() {
        let mut trie = TopicTrie::new();
        trie.insert("#", "all").unwrap();
        trie.insert("+/broker", "plus").unwrap();
        trie.insert("$SYS/#", "sys").unwrap();

        assert_eq!(sorted(trie.matches("$SYS/broker")), vec!["sys"]);
    }

    #[test]
    fn test_multi_level_wildcard_must_be_last() {
        let mut trie = TopicTrie::new();
        assert!(trie.insert("device/#/state", "invalid").is_err());
    }

    #[test]
    fn test_remove_prunes() {
        let mut trie = TopicTrie::new();
        trie.insert("device/+/state", "handler1").unwrap();
        trie.insert("device/+/state", "handler2").unwrap();

        assert!(trie.remove("device/+/state", |v| *v == "handler1"));
        assert_eq!(sorted(trie.matches("device/x/state")), vec!["handler2"]);

        assert!(!trie.remove("device/+/state", |v| *v == "missing"));
        assert!(trie.remove("device/+/state", |_| true));
        assert!(trie.is_empty());
    }
}
