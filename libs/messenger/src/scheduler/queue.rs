use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Insertion-ordered set with removal by identity
///
/// Members leave from the front in arrival order, or from anywhere by key.
#[derive(Debug, Clone)]
pub struct FifoSet<K> {
    order: BTreeMap<u64, K>,
    index: HashMap<K, u64>,
    next: u64,
}

impl<K> Default for FifoSet<K> {
    fn default() -> Self {
        Self {
            order: BTreeMap::new(),
            index: HashMap::new(),
            next: 0,
        }
    }
}

impl<K: Clone + Eq + Hash> FifoSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the back; a key already present keeps its place
    pub fn push_back(&mut self, key: K) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        let stamp = self.next;
        self.next += 1;
        self.order.insert(stamp, key.clone());
        self.index.insert(key, stamp);
        true
    }

    pub fn pop_front(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.index.remove(&key);
        Some(key)
    }

    pub fn remove(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(stamp) => {
                self.order.remove(&stamp);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Members, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }
}
