use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use xxhash_rust::xxh3::xxh3_64;

use crate::utils::Metrics;

const DEFAULT_CAPACITY: usize = 2048;

/// "Seen before" translations for repeated source text.
///
/// An explicit context object owned by whoever drives the pages (never a
/// process-wide singleton), so tests can build isolated instances.
/// Keys are xxHash3 digests of whitespace-normalized, lowercased source text.
pub struct TranslationMemo {
    entries: Mutex<LruCache<u64, String>>,
    metrics: Option<Metrics>,
}

impl TranslationMemo {
    pub fn new(capacity: Option<usize>, metrics: Option<Metrics>) -> Self {
        let capacity = NonZeroUsize::new(capacity.unwrap_or(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            metrics,
        }
    }

    pub fn key(source_text: &str) -> u64 {
        let normalized: String = source_text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        xxh3_64(normalized.as_bytes())
    }

    pub fn get(&self, source_text: &str) -> Option<String> {
        let hit = self.entries.lock().get(&Self::key(source_text)).cloned();
        if let Some(ref m) = self.metrics {
            if hit.is_some() {
                m.record_memo_hit();
            } else {
                m.record_memo_miss();
            }
        }
        hit
    }

    /// Remember a translation; empty strings are not stored
    pub fn put(&self, source_text: &str, target_text: &str) {
        if source_text.trim().is_empty() || target_text.trim().is_empty() {
            return;
        }
        self.entries
            .lock()
            .put(Self::key(source_text), target_text.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for TranslationMemo {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memo_normalizes_whitespace_and_case() {
        let memo = TranslationMemo::default();
        memo.put("Hello   World", "안녕 세상");
        assert_eq!(memo.get(" hello world ").as_deref(), Some("안녕 세상"));
        assert_eq!(memo.get("hello"), None);
    }

    #[test]
    fn test_memo_evicts_lru() {
        let memo = TranslationMemo::new(Some(2), None);
        memo.put("a", "A");
        memo.put("b", "B");
        memo.get("a");
        memo.put("c", "C");
        assert_eq!(memo.get("b"), None);
        assert_eq!(memo.get("a").as_deref(), Some("A"));
        assert_eq!(memo.len(), 2);
    }

    #[test]
    fn test_isolated_instances() {
        let first = TranslationMemo::default();
        let second = TranslationMemo::default();
        first.put("같은 말", "same words");
        assert!(second.get("같은 말").is_none());
        assert!(second.is_empty());
    }

    #[test]
    fn test_empty_not_stored() {
        let memo = TranslationMemo::default();
        memo.put("소리", "");
        assert!(memo.is_empty());
    }
}
