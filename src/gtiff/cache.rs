//! Strile location cache
//!
//! A bounded LRU of `block -> StrileLocation` so repeated availability checks
//! on a read-only dataset do not hit the strile arrays again.

use crate::tiff::StrileLocation;
use std::collections::{HashMap, VecDeque};

pub struct StrileCache {
    entries: HashMap<usize, StrileLocation>,
    /// Access order for eviction (front = oldest)
    order: VecDeque<usize>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl StrileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, block: usize) -> Option<StrileLocation> {
        match self.entries.get(&block).copied() {
            Some(location) => {
                self.hits += 1;
                self.touch(block);
                Some(location)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, block: usize, location: StrileLocation) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(block, location).is_some() {
            self.touch(block);
            return;
        }
        self.order.push_back(block);
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&mut self, block: usize) {
        if self.entries.remove(&block).is_some() {
            self.order.retain(|&b| b != block);
        }
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

    /// `(hits, misses)` since creation
    pub fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn touch(&mut self, block: usize) {
        if let Some(pos) = self.order.iter().position(|&b| b == block) {
            self.order.remove(pos);
        }
        self.order.push_back(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(offset: u64) -> StrileLocation {
        StrileLocation {
            offset,
            byte_count: 10,
        }
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = StrileCache::new(2);
        cache.insert(1, loc(100));
        cache.insert(2, loc(200));
        assert_eq!(cache.get(1), Some(loc(100)));
        cache.insert(3, loc(300));
        // 2 was least recently used
        assert_eq!(cache.get(2), None);
        assert_eq!(cache.get(1), Some(loc(100)));
        assert_eq!(cache.get(3), Some(loc(300)));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.counters(), (3, 1));
    }

    #[test]
    fn test_invalidate_and_disabled() {
        let mut cache = StrileCache::new(4);
        cache.insert(7, loc(1));
        cache.invalidate(7);
        assert!(cache.is_empty());

        let mut off = StrileCache::new(0);
        off.insert(1, loc(1));
        assert_eq!(off.get(1), None);
    }
}
