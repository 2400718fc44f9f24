//! Committed tier
//!
//! Size-bounded map evicting the least recently used entry. Recency is a
//! monotonically increasing tick; `order` maps ticks back to keys.

use std::collections::{BTreeMap, HashMap};

use super::CacheEntry;

/// LRU map of confirmed base-store state
#[derive(Debug)]
pub struct CommittedCache {
    capacity: usize,
    entries: HashMap<Vec<u8>, (CacheEntry, u64)>,
    order: BTreeMap<u64, Vec<u8>>,
    tick: u64,
}

impl CommittedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    /// Look up and mark as most recently used
    pub fn get(&mut self, key: &[u8]) -> Option<&CacheEntry> {
        let tick = self.next_tick();
        let (_, used) = self.entries.get_mut(key)?;
        let previous = std::mem::replace(used, tick);
        if let Some(owned) = self.order.remove(&previous) {
            self.order.insert(tick, owned);
        }
        self.entries.get(key).map(|(entry, _)| entry)
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &[u8]) -> Option<&CacheEntry> {
        self.entries.get(key).map(|(entry, _)| entry)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace, evicting the least recently used entry when full
    pub fn insert(&mut self, key: Vec<u8>, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }
        let tick = self.next_tick();
        if let Some((_, previous)) = self.entries.insert(key.clone(), (entry, tick)) {
            self.order.remove(&previous);
        }
        self.order.insert(tick, key);

        while self.entries.len() > self.capacity {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<CacheEntry> {
        let (entry, tick) = self.entries.remove(key)?;
        self.order.remove(&tick);
        Some(entry)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &CacheEntry)> {
        self.entries.iter().map(|(key, (entry, _))| (key, entry))
    }

    /// Entries from least to most recently used
    pub fn iter_by_recency(&self) -> impl Iterator<Item = (&Vec<u8>, &CacheEntry)> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key).map(|(entry, _)| (key, entry)))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}
