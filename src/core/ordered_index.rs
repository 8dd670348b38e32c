//! Skip-list backed ordered index
//!
//! Entries are `(key, score, value)` with unique keys, kept in ascending
//! `(score, key)` order. Nodes live in an arena and refer to each other by
//! slot index. Every forward link records its span (how many level-0 steps
//! it covers) so rank lookups and rank windows stay logarithmic.
//!
//! The mempool ranks transactions by fee with it and the chain selector
//! ranks fork tips by chain weight.

use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;

pub const MAX_LEVEL: usize = 32;
const LEVEL_PROBABILITY: f64 = 0.25;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    next: Option<usize>,
    span: usize,
}

#[derive(Debug, Clone)]
struct Entry<K, S, V> {
    key: K,
    score: S,
    value: V,
    links: Vec<Link>,
    backward: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct OrderedIndex<K, S, V> {
    head: Vec<Link>,
    slots: Vec<Option<Entry<K, S, V>>>,
    free: Vec<usize>,
    by_key: HashMap<K, usize>,
    tail: Option<usize>,
    level: usize,
    len: usize,
}

impl<K, S, V> Default for OrderedIndex<K, S, V>
where
    K: Ord + Hash + Clone,
    S: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S, V> OrderedIndex<K, S, V>
where
    K: Ord + Hash + Clone,
    S: Ord + Clone,
{
    pub fn new() -> OrderedIndex<K, S, V> {
        OrderedIndex {
            head: vec![Link::default(); MAX_LEVEL],
            slots: Vec::new(),
            free: Vec::new(),
            by_key: HashMap::new(),
            tail: None,
            level: 1,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<(&S, &V)> {
        let entry = self.entry(*self.by_key.get(key)?);
        Some((&entry.score, &entry.value))
    }

    /// Insert an entry; an existing entry with the same key is replaced and returned
    pub fn insert(&mut self, key: K, score: S, value: V) -> Option<(S, V)> {
        let replaced = self.remove(&key);

        let mut update: [Option<usize>; MAX_LEVEL] = [None; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];
        let mut cursor: Option<usize> = None;
        for i in (0..self.level).rev() {
            rank[i] = if i + 1 == self.level { 0 } else { rank[i + 1] };
            while let Some(next) = self.link(cursor, i).next {
                if !self.precedes(next, &score, &key) {
                    break;
                }
                rank[i] += self.link(cursor, i).span;
                cursor = Some(next);
            }
            update[i] = cursor;
        }

        let level = random_level();
        if level > self.level {
            for i in self.level..level {
                rank[i] = 0;
                update[i] = None;
                self.head[i].span = self.len;
            }
            self.level = level;
        }

        let mut links = vec![Link::default(); level];
        for (i, link) in links.iter_mut().enumerate() {
            let before = self.link(update[i], i);
            link.next = before.next;
            link.span = before.span - (rank[0] - rank[i]);
        }
        let idx = self.allocate(Entry {
            key: key.clone(),
            score,
            value,
            links,
            backward: update[0],
        });
        for i in 0..level {
            *self.link_mut(update[i], i) = Link {
                next: Some(idx),
                span: rank[0] - rank[i] + 1,
            };
        }
        for i in level..self.level {
            self.link_mut(update[i], i).span += 1;
        }

        match self.entry(idx).links[0].next {
            Some(next) => self.entry_mut(next).backward = Some(idx),
            None => self.tail = Some(idx),
        }

        self.by_key.insert(key, idx);
        self.len += 1;
        replaced
    }

    /// Remove by key; absent keys (and an empty index) are a no-op
    pub fn remove(&mut self, key: &K) -> Option<(S, V)> {
        let idx = *self.by_key.get(key)?;
        let entry = self.unlink(idx);
        Some((entry.score, entry.value))
    }

    pub fn min(&self) -> Option<(&K, &S, &V)> {
        self.head[0].next.map(|idx| self.triple(idx))
    }

    pub fn max(&self) -> Option<(&K, &S, &V)> {
        self.tail.map(|idx| self.triple(idx))
    }

    pub fn pop_max(&mut self) -> Option<(K, S, V)> {
        let entry = self.unlink(self.tail?);
        Some((entry.key, entry.score, entry.value))
    }

    /// Entries ranked `[m, n)` from the top score down, returned in ascending order
    pub fn top_max(&self, m: usize, n: usize) -> Vec<(&K, &S, &V)> {
        let n = n.min(self.len);
        if m >= n {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(n - m);
        // descending ranks [m, n) are ascending 1-based ranks [len - n + 1, len - m]
        let mut cursor = self.at_rank(self.len - n + 1);
        while let Some(idx) = cursor {
            if out.len() == n - m {
                break;
            }
            out.push(self.triple(idx));
            cursor = self.entry(idx).links[0].next;
        }
        out
    }

    /// 1-based ascending rank of a key
    pub fn rank(&self, key: &K) -> Option<usize> {
        let idx = *self.by_key.get(key)?;
        let (score, key) = (&self.entry(idx).score, &self.entry(idx).key);
        let mut traversed = 0;
        let mut cursor: Option<usize> = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.link(cursor, i).next {
                if next != idx && !self.precedes(next, score, key) {
                    break;
                }
                traversed += self.link(cursor, i).span;
                cursor = Some(next);
                if next == idx {
                    return Some(traversed);
                }
            }
        }
        None
    }

    /// Level-0 traversal in ascending order
    pub fn iter(&self) -> Iter<'_, K, S, V> {
        Iter {
            index: self,
            cursor: self.head[0].next,
        }
    }

    fn at_rank(&self, rank: usize) -> Option<usize> {
        let mut traversed = 0;
        let mut cursor: Option<usize> = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.link(cursor, i).next {
                let span = self.link(cursor, i).span;
                if traversed + span > rank {
                    break;
                }
                traversed += span;
                cursor = Some(next);
            }
            if traversed == rank {
                return cursor;
            }
        }
        None
    }

    fn unlink(&mut self, idx: usize) -> Entry<K, S, V> {
        let mut update: [Option<usize>; MAX_LEVEL] = [None; MAX_LEVEL];
        let (score, key) = {
            let entry = self.entry(idx);
            (entry.score.clone(), entry.key.clone())
        };
        let mut cursor: Option<usize> = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.link(cursor, i).next {
                if next == idx || !self.precedes(next, &score, &key) {
                    break;
                }
                cursor = Some(next);
            }
            update[i] = cursor;
        }

        let links = self.entry(idx).links.clone();
        for i in 0..self.level {
            let before = self.link(update[i], i);
            if before.next == Some(idx) {
                *self.link_mut(update[i], i) = Link {
                    next: links[i].next,
                    span: before.span + links[i].span - 1,
                };
            } else {
                self.link_mut(update[i], i).span -= 1;
            }
        }

        let backward = self.entry(idx).backward;
        match links[0].next {
            Some(next) => self.entry_mut(next).backward = backward,
            None => self.tail = backward,
        }
        while self.level > 1 && self.head[self.level - 1].next.is_none() {
            self.level -= 1;
        }

        self.by_key.remove(&key);
        self.len -= 1;
        self.free.push(idx);
        self.slots[idx]
            .take()
            .unwrap_or_else(|| unreachable!("linked slot {idx} is occupied"))
    }

    // Strict (score, key) ordering of an entry against a lookup key
    fn precedes(&self, idx: usize, score: &S, key: &K) -> bool {
        let entry = self.entry(idx);
        (&entry.score, &entry.key) < (score, key)
    }

    fn link(&self, at: Option<usize>, level: usize) -> Link {
        match at {
            None => self.head[level],
            Some(idx) => self.entry(idx).links[level],
        }
    }

    fn link_mut(&mut self, at: Option<usize>, level: usize) -> &mut Link {
        match at {
            None => &mut self.head[level],
            Some(idx) => &mut self.entry_mut(idx).links[level],
        }
    }

    fn allocate(&mut self, entry: Entry<K, S, V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    fn triple(&self, idx: usize) -> (&K, &S, &V) {
        let entry = self.entry(idx);
        (&entry.key, &entry.score, &entry.value)
    }

    fn entry(&self, idx: usize) -> &Entry<K, S, V> {
        self.slots[idx]
            .as_ref()
            .unwrap_or_else(|| unreachable!("linked slot {idx} is occupied"))
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry<K, S, V> {
        self.slots[idx]
            .as_mut()
            .unwrap_or_else(|| unreachable!("linked slot {idx} is occupied"))
    }
}

fn random_level() -> usize {
    let mut rng = rand::thread_rng();
    let mut level = 1;
    while level < MAX_LEVEL && rng.gen::<f64>() < LEVEL_PROBABILITY {
        level += 1;
    }
    level
}

pub struct Iter<'a, K, S, V> {
    index: &'a OrderedIndex<K, S, V>,
    cursor: Option<usize>,
}

impl<'a, K, S, V> Iterator for Iter<'a, K, S, V>
where
    K: Ord + Hash + Clone,
    S: Ord + Clone,
{
    type Item = (&'a K, &'a S, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let entry = self.index.entry(idx);
        self.cursor = entry.links[0].next;
        Some((&entry.key, &entry.score, &entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn assert_consistent(index: &OrderedIndex<u32, u64, String>) {
        let entries: Vec<_> = index.iter().collect();
        assert_eq!(entries.len(), index.len());
        for pair in entries.windows(2) {
            assert!(pair[0].1 <= pair[1].1, "level 0 out of order");
        }
        for (rank, (key, _, _)) in entries.iter().enumerate() {
            assert_eq!(index.rank(key), Some(rank + 1));
        }
        assert_eq!(index.max().map(|e| e.0), entries.last().map(|e| e.0));
        assert_eq!(index.min().map(|e| e.0), entries.first().map(|e| e.0));
    }

    #[test]
    fn test_max_tracks_highest_insert() {
        let mut index = OrderedIndex::new();
        for i in 1..=200u32 {
            index.insert(i, i as u64, format!("v{i}"));
            let (key, score, _) = index.max().unwrap();
            assert_eq!((*key, *score), (i, i as u64));
            assert_eq!(index.len(), i as usize);
        }
        assert_consistent(&index);
    }

    #[test]
    fn test_pop_max_drains_in_descending_order() {
        let mut index = OrderedIndex::new();
        let mut keys: Vec<u32> = (1..=100).collect();
        keys.shuffle(&mut rand::thread_rng());
        for &k in &keys {
            index.insert(k, k as u64 * 10, k.to_string());
        }

        let mut expected = 100;
        while let Some((key, score, value)) = index.pop_max() {
            assert_eq!(key, expected);
            assert_eq!(score, expected as u64 * 10);
            assert_eq!(value, expected.to_string());
            expected -= 1;
            assert_eq!(index.len(), expected as usize);
        }
        assert_eq!(index.len(), 0);
        assert!(index.is_empty());
        assert!(index.max().is_none());
        assert!(index.min().is_none());
    }

    #[test]
    fn test_top_max_windows() {
        let mut index = OrderedIndex::new();
        for i in 1..=20u32 {
            index.insert(i, i as u64, String::new());
        }

        let all: Vec<u32> = index.top_max(0, 20).iter().map(|e| *e.0).collect();
        assert_eq!(all, (1..=20).collect::<Vec<u32>>());

        let best_three: Vec<u32> = index.top_max(0, 3).iter().map(|e| *e.0).collect();
        assert_eq!(best_three, vec![18, 19, 20]);

        let middle: Vec<u32> = index.top_max(5, 8).iter().map(|e| *e.0).collect();
        assert_eq!(middle, vec![13, 14, 15]);

        assert_eq!(index.top_max(0, 100).len(), 20);
        assert!(index.top_max(7, 7).is_empty());
        assert!(index.top_max(30, 40).is_empty());
    }

    #[test]
    fn test_insert_overwrites_existing_key() {
        let mut index = OrderedIndex::new();
        index.insert(7u32, 1u64, "old".to_string());
        index.insert(8, 5, "other".to_string());
        let replaced = index.insert(7, 9, "new".to_string());
        assert_eq!(replaced, Some((1, "old".to_string())));
        assert_eq!(index.len(), 2);
        assert_eq!(index.max().map(|e| *e.0), Some(7));
        assert_eq!(index.get(&7), Some((&9, &"new".to_string())));
        assert_consistent(&index);
    }

    #[test]
    fn test_equal_scores_break_ties_by_key() {
        let mut index = OrderedIndex::new();
        for key in [5u32, 1, 3, 2, 4] {
            index.insert(key, 42u64, String::new());
        }
        let keys: Vec<u32> = index.iter().map(|e| *e.0).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        assert_eq!(index.remove(&3), Some((42, String::new())));
        assert_consistent(&index);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut index: OrderedIndex<u32, u64, String> = OrderedIndex::new();
        assert_eq!(index.remove(&1), None);
        index.insert(1, 1, String::new());
        assert_eq!(index.remove(&2), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_random_operations_keep_order_and_spans() {
        let mut rng = rand::thread_rng();
        let mut index = OrderedIndex::new();
        let mut live: HashMap<u32, u64> = HashMap::new();

        for round in 0..2000 {
            let key = rng.gen_range(0..300u32);
            if rng.gen_bool(0.6) {
                let score = rng.gen_range(0..50u64);
                index.insert(key, score, format!("{round}"));
                live.insert(key, score);
            } else {
                assert_eq!(index.remove(&key).map(|e| e.0), live.remove(&key));
            }
            if round % 100 == 0 {
                assert_consistent(&index);
            }
        }
        assert_consistent(&index);
        assert_eq!(index.len(), live.len());

        let mut expected: Vec<(u64, u32)> = live.iter().map(|(k, s)| (*s, *k)).collect();
        expected.sort();
        let top: Vec<(u64, u32)> = index
            .top_max(0, 10)
            .iter()
            .map(|e| (*e.1, *e.0))
            .collect();
        assert_eq!(top, expected[expected.len().saturating_sub(10)..].to_vec());
    }
}
