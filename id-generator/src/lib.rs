use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Hands out ids that increase monotonically per key, starting at 1.
pub struct IdGenerator {}

static ID_MAP: Lazy<RwLock<HashMap<&'static str, AtomicUsize>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

impl IdGenerator {
    pub fn next_id(key: &'static str) -> usize {
        if let Ok(map) = ID_MAP.read() {
            if let Some(id) = map.get(key) {
                return id.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut map = ID_MAP.write().unwrap_or_else(|e| e.into_inner());
        map.entry(key)
            .or_insert_with(|| AtomicUsize::new(1))
            .fetch_add(1, Ordering::Relaxed)
    }
}
