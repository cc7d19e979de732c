use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a rejected write: the map stayed exactly as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded;

/// Quota-aware, copy-on-write key/value snapshot of one storage area.
///
/// Cloning is cheap: clones share their entries until one of them is written
/// to, at which point the writer gets its own copy.
#[derive(Debug, Clone)]
pub struct StorageMap {
    items: Arc<HashMap<String, String>>,
    /// Estimated size in bytes of every key and value.
    size: usize,
    quota: usize,
}

/// Estimated storage footprint of a string: two bytes per UTF-16 code unit.
pub fn estimated_size(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

impl StorageMap {
    pub fn new(quota: usize) -> Self {
        Self {
            items: Arc::new(HashMap::new()),
            size: 0,
            quota,
        }
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(String::as_str)
    }

    /// Point-in-time copy of every entry.
    pub fn items(&self) -> HashMap<String, String> {
        (*self.items).clone()
    }

    /// Sets `key` to `value` and returns the previous value.
    ///
    /// Fails without touching the map when the result would exceed the quota.
    pub fn set_item(&mut self, key: &str, value: &str) -> Result<Option<String>, QuotaExceeded> {
        let value_size = estimated_size(value);
        let new_size = match self.items.get(key) {
            Some(old) => self.size - estimated_size(old) + value_size,
            None => self.size.saturating_add(estimated_size(key)).saturating_add(value_size),
        };
        if new_size > self.quota {
            return Err(QuotaExceeded);
        }

        let old = Arc::make_mut(&mut self.items).insert(key.to_string(), value.to_string());
        self.size = new_size;
        Ok(old)
    }

    /// Removes `key` and returns its value, if it was present.
    pub fn remove_item(&mut self, key: &str) -> Option<String> {
        if !self.items.contains_key(key) {
            return None;
        }
        let old = Arc::make_mut(&mut self.items).remove(key)?;
        self.size -= estimated_size(key) + estimated_size(&old);
        Some(old)
    }

    pub fn clear(&mut self) {
        self.items = Arc::new(HashMap::new());
        self.size = 0;
    }

    /// Loads an entry read from disk. Imports are not subject to the quota.
    pub fn import_item(&mut self, key: String, value: String) {
        let added = estimated_size(&key) + estimated_size(&value);
        let map = Arc::make_mut(&mut self.items);
        if let Some(old) = map.insert(key.clone(), value) {
            self.size -= estimated_size(&key) + estimated_size(&old);
        }
        self.size += added;
    }
}
