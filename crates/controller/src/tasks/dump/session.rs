//! In-flight capture sessions
//!
//! At most one reconciliation attempt may drive a given `DumpRequest` at a
//! time. An attempt claims the resource key through [`SessionRegistry`] and
//! holds the returned [`SessionGuard`] for its whole duration; dropping the
//! guard releases the claim on every exit path.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    active: Arc<DashMap<String, Instant>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if another attempt holds it
    #[must_use]
    pub fn try_acquire(&self, key: &str) -> Option<SessionGuard> {
        match self.active.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(SessionGuard {
                    active: Arc::clone(&self.active),
                    key: key.to_string(),
                })
            }
        }
    }

    #[must_use]
    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Claim on one resource; released on drop
pub struct SessionGuard {
    active: Arc<DashMap<String, Instant>>,
    key: String,
}

impl SessionGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_refused_until_release() {
        let registry = SessionRegistry::new();
        let guard = registry.try_acquire("ns1/test-dump").unwrap();
        assert_eq!(guard.key(), "ns1/test-dump");
        assert!(registry.try_acquire("ns1/test-dump").is_none());
        assert!(registry.is_active("ns1/test-dump"));

        drop(guard);
        assert!(!registry.is_active("ns1/test-dump"));
        assert!(registry.try_acquire("ns1/test-dump").is_some());
    }

    #[test]
    fn distinct_resources_do_not_block_each_other() {
        let registry = SessionRegistry::new();
        let _a = registry.try_acquire("ns1/a").unwrap();
        let _b = registry.try_acquire("ns1/b").unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn guard_released_when_attempt_panics() {
        let registry = SessionRegistry::new();
        let cloned = registry.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_acquire("ns1/a").unwrap();
            panic!("reconcile blew up");
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }
}
