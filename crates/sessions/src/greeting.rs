//! Process-wide greeting audio cache.
//!
//! Keyed immutably by `(voice_id, text)`; populated once after the first
//! synthesis, read by every later call using the same prompt. Entries hold
//! ready-to-send 20 ms frames.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Default)]
pub struct GreetingCache {
    inner: RwLock<HashMap<(String, String), Arc<Vec<Vec<u8>>>>>,
}

impl GreetingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, voice_id: &str, text: &str) -> Option<Arc<Vec<Vec<u8>>>> {
        self.inner
            .read()
            .get(&(voice_id.to_owned(), text.to_owned()))
            .cloned()
    }

    /// First writer wins; later inserts for the same key are ignored.
    pub fn insert(&self, voice_id: &str, text: &str, frames: Vec<Vec<u8>>) {
        self.inner
            .write()
            .entry((voice_id.to_owned(), text.to_owned()))
            .or_insert_with(|| Arc::new(frames));
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = GreetingCache::new();
        assert!(cache.get("luna", "Olá").is_none());
        cache.insert("luna", "Olá", vec![vec![0u8; 320]]);
        let frames = cache.get("luna", "Olá").unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn keyed_by_voice_and_text() {
        let cache = GreetingCache::new();
        cache.insert("luna", "Olá", vec![]);
        assert!(cache.get("atlas", "Olá").is_none());
        assert!(cache.get("luna", "Oi").is_none());
    }

    #[test]
    fn first_insert_wins() {
        let cache = GreetingCache::new();
        cache.insert("luna", "Olá", vec![vec![1u8; 320]]);
        cache.insert("luna", "Olá", vec![vec![2u8; 320], vec![3u8; 320]]);
        assert_eq!(cache.get("luna", "Olá").unwrap().len(), 1);
    }
}
