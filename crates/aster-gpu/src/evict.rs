//! Recency tracking for watermark eviction.
//!
//! The decimator's idle-frame threshold handles the common case; the recency
//! queue exists for the degenerate one, where a guest cycles through more
//! distinct texture keys per frame than the watermark allows. Eviction order
//! must then be oldest-bind-first even among entries touched this frame.

use hashbrown::HashMap;
use std::hash::Hash;

#[derive(Debug)]
pub struct RecencyQueue<K> {
    ticks: HashMap<K, u64>,
    next_tick: u64,
}

impl<K> RecencyQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            ticks: HashMap::new(),
            next_tick: 0,
        }
    }

    /// Marks `key` as the most recently used.
    pub fn touch(&mut self, key: &K) {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.ticks.insert(key.clone(), tick);
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.ticks.remove(key).is_some()
    }

    /// Removes and returns the least recently touched key.
    pub fn pop_oldest(&mut self) -> Option<K> {
        let key = self
            .ticks
            .iter()
            .min_by_key(|(_, &tick)| tick)
            .map(|(k, _)| k.clone())?;
        self.ticks.remove(&key);
        Some(key)
    }

    pub fn clear(&mut self) {
        self.ticks.clear();
    }
}

impl<K> Default for RecencyQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
