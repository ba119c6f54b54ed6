//! Plaintexts of our own recent ciphertexts.
//!
//! The server echoes every event we send back to us in the next sync. We
//! cannot decrypt our own olm ciphertexts (they are addressed to the other
//! devices) and would needlessly ratchet our own megolm session, so the
//! plaintext is remembered at send time and looked up by the exact
//! ciphertext content when the echo arrives.

use std::num::NonZeroUsize;

use keyward_proto::Event;
use lru::LruCache;
use serde_json::Value;

/// Bounded LRU map from encrypted content to the plaintext event it carried.
///
/// `None` when configured with a capacity of zero.
pub(crate) struct EchoCache {
    entries: Option<LruCache<String, Event>>,
}

impl EchoCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { entries: NonZeroUsize::new(capacity).map(LruCache::new) }
    }

    /// Remember the plaintext sent as `content`, evicting the least recently
    /// used entry when full.
    pub(crate) fn insert(&mut self, content: &Value, event: Event) {
        if let Some(entries) = &mut self.entries {
            entries.put(content.to_string(), event);
        }
    }

    /// Plaintext sent as `content`, marked as recently used.
    pub(crate) fn get(&mut self, content: &Value) -> Option<&Event> {
        self.entries.as_mut()?.get(&content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use keyward_proto::UserId;
    use serde_json::json;

    use super::*;

    fn event(body: &str) -> Event {
        Event::new("m.room.message", UserId::from("@a:x"), json!({ "body": body }))
    }

    #[test]
    fn least_recent_entry_is_evicted() {
        let mut cache = EchoCache::new(2);
        cache.insert(&json!({ "c": 1 }), event("one"));
        cache.insert(&json!({ "c": 2 }), event("two"));
        cache.insert(&json!({ "c": 3 }), event("three"));

        assert!(cache.get(&json!({ "c": 1 })).is_none());
        assert_eq!(cache.get(&json!({ "c": 2 })), Some(&event("two")));
        assert_eq!(cache.get(&json!({ "c": 3 })), Some(&event("three")));
    }

    #[test]
    fn lookup_keeps_entry_alive() {
        let mut cache = EchoCache::new(2);
        cache.insert(&json!({ "c": 1 }), event("one"));
        cache.insert(&json!({ "c": 2 }), event("two"));
        assert!(cache.get(&json!({ "c": 1 })).is_some());
        cache.insert(&json!({ "c": 3 }), event("three"));

        assert_eq!(cache.get(&json!({ "c": 1 })), Some(&event("one")));
        assert!(cache.get(&json!({ "c": 2 })).is_none());
    }

    #[test]
    fn reinserting_replaces_and_refreshes() {
        let mut cache = EchoCache::new(2);
        cache.insert(&json!({ "c": 1 }), event("one"));
        cache.insert(&json!({ "c": 2 }), event("two"));
        cache.insert(&json!({ "c": 1 }), event("one again"));
        cache.insert(&json!({ "c": 3 }), event("three"));

        assert_eq!(cache.get(&json!({ "c": 1 })), Some(&event("one again")));
        assert!(cache.get(&json!({ "c": 2 })).is_none());
    }

    #[test]
    fn zero_capacity_disables() {
        let mut cache = EchoCache::new(0);
        cache.insert(&json!({ "c": 1 }), event("one"));
        assert!(cache.get(&json!({ "c": 1 })).is_none());
    }
}
