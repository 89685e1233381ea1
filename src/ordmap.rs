//! Prefix-indexed, order-preserving map from byte-string keys to payloads.
//!
//! The original keeps these in a critbit tree so that pattern expansion can
//! seek to "the first key starting with P" and walk forward until the prefix
//! breaks. `BTreeMap::range` gives the same seek-and-walk contract directly,
//! so `OrderedStringMap` is a thin wrapper rather than a from-scratch trie.

use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Default, Clone)]
pub struct OrderedStringMap<T> {
    inner: BTreeMap<Box<str>, T>,
}

impl<T> OrderedStringMap<T> {
    pub fn new() -> Self {
        OrderedStringMap { inner: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.inner.get_mut(key)
    }

    /// Inserts `payload` under `key` unless an equal key is already present.
    /// Returns `true` iff the insertion happened.
    pub fn insert(&mut self, key: &str, payload: T) -> bool {
        if self.inner.contains_key(key) {
            return false;
        }
        self.inner.insert(key.into(), payload);
        true
    }

    /// Inserts, overwriting any existing payload under `key`.
    pub fn insert_or_replace(&mut self, key: &str, payload: T) -> Option<T> {
        self.inner.insert(key.into(), payload)
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.inner.remove(key)
    }

    /// Returns the entry whose key equals `key`, or (if none does) the
    /// nearest entry sharing the longest common prefix -- mirroring
    /// `critbit_find`'s "never fails on a non-empty tree" contract. Returns
    /// `None` only when the map itself is empty.
    pub fn find(&self, key: &str) -> Option<(&str, &T)> {
        if let Some(v) = self.inner.get(key) {
            return Some((key, v));
        }
        // Longest-common-prefix neighbor is one of the two entries adjacent
        // to where `key` would sort; a BTreeMap gives us that directly via
        // range split at `key`.
        let mut before = self
            .inner
            .range::<str, _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back();
        let after = self
            .inner
            .range::<str, _>((Bound::Excluded(key), Bound::Unbounded))
            .next();
        match (before.take(), after) {
            (Some((bk, bv)), Some((ak, av))) => {
                if common_prefix_len(bk, key) >= common_prefix_len(ak, key) {
                    Some((bk, bv))
                } else {
                    Some((ak, av))
                }
            }
            (Some(pair), None) | (None, Some(pair)) => Some(pair),
            (None, None) => None,
        }
    }

    /// Iterates all entries in lexicographic key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.inner.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// Iterates entries whose key is `>= from`, in lexicographic order --
    /// the seek operation pattern expansion relies on.
    pub fn iter_from<'a>(&'a self, from: &str) -> impl Iterator<Item = (&'a str, &'a T)> {
        self.inner
            .range::<str, _>((Bound::Included(from), Bound::Unbounded))
            .map(|(k, v)| (k.as_ref(), v))
    }

    /// Iterates entries whose key starts with `prefix`, stopping at the
    /// first key that doesn't -- used by pattern-match expansion (§4.2.2).
    pub fn iter_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a T)> {
        self.iter_from(prefix)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_duplicate_key() {
        let mut m = OrderedStringMap::new();
        assert!(m.insert("a", 1));
        assert!(!m.insert("a", 2));
        assert_eq!(*m.get("a").unwrap(), 1);
    }

    #[test]
    fn iterates_in_lexicographic_order() {
        let mut m = OrderedStringMap::new();
        for k in ["c.c", "a.c", "b.c"] {
            m.insert(k, ());
        }
        let keys: Vec<_> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a.c", "b.c", "c.c"]);
    }

    #[test]
    fn iter_from_seeks_to_first_ge_key() {
        let mut m = OrderedStringMap::new();
        for k in ["a", "b", "d", "e"] {
            m.insert(k, ());
        }
        let keys: Vec<_> = m.iter_from("c").map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["d", "e"]);
    }

    #[test]
    fn iter_prefix_stops_at_first_non_matching_key() {
        let mut m = OrderedStringMap::new();
        for k in ["foo.a", "foo.b", "foq.a", "zzz"] {
            m.insert(k, ());
        }
        let keys: Vec<_> = m.iter_prefix("foo.").map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["foo.a", "foo.b"]);
    }

    #[test]
    fn find_on_exact_key_returns_it() {
        let mut m = OrderedStringMap::new();
        m.insert("x", 42);
        assert_eq!(m.find("x"), Some(("x", &42)));
    }

    #[test]
    fn find_on_missing_key_returns_nearest_neighbor() {
        let mut m = OrderedStringMap::new();
        m.insert("aaa", 1);
        m.insert("zzz", 2);
        let (k, _) = m.find("mmm").unwrap();
        assert!(k == "aaa" || k == "zzz");
    }

    #[test]
    fn find_on_empty_map_returns_none() {
        let m: OrderedStringMap<()> = OrderedStringMap::new();
        assert_eq!(m.find("anything"), None);
    }
}
