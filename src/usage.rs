//! Throttling of `last_usage` writes.
//!
//! [`LruUsageTracker`] remembers, for a bounded number of tables, the last
//! UTC day a usage was recorded. When the cache is full the least recently
//! touched table is evicted; an evicted table simply gets one extra write
//! the next time it is used.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::NaiveDate;
use lru::LruCache;

pub trait UsageTracker: Send + Sync {
    /// True when the table's usage for `today` has not been recorded yet.
    /// A `true` answer marks it recorded.
    fn should_record(&self, table: &str, today: NaiveDate) -> bool;

    fn forget(&self, table: &str);
}

pub struct LruUsageTracker {
    cache: Mutex<LruCache<String, NaiveDate>>,
}

impl LruUsageTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UsageTracker for LruUsageTracker {
    fn should_record(&self, table: &str, today: NaiveDate) -> bool {
        // A poisoned cache only costs redundant writes.
        let Ok(mut cache) = self.cache.lock() else {
            return true;
        };

        match cache.get(table) {
            Some(day) if *day >= today => false,
            _ => {
                cache.put(table.to_string(), today);
                true
            }
        }
    }

    fn forget(&self, table: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(table);
        }
    }
}
