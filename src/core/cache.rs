//! Content-addressable translation cache with single-flight resolution

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use crate::core::config::CacheScope;
use crate::core::errors::TranslateError;

/// Deterministic key identifying translation-equivalent requests
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash of normalized text, target language, and glossary version.
    ///
    /// Text is NFC-normalized and whitespace-collapsed, so cosmetic edits do
    /// not defeat deduplication. Two requests with different glossary
    /// versions never collide even for identical text.
    pub fn compute(text: &str, target_lang: &str, glossary_version: &str) -> Self {
        let normalized: String = text.nfc().collect::<String>();
        let collapsed = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

        let mut hasher = Sha256::new();
        hasher.update(collapsed.as_bytes());
        hasher.update([0x1f]);
        hasher.update(target_lang.as_bytes());
        hasher.update([0x1f]);
        hasher.update(glossary_version.as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

/// Cached translation plus diagnostics
#[derive(Debug, Clone)]
struct Entry {
    translated: String,
    /// Distinct content units mapped to this entry; never drives eviction
    refs: u64,
}

type Published = Option<std::result::Result<String, TranslateError>>;

#[derive(Debug)]
enum Slot {
    Ready(Entry),
    /// A resolution is in flight; waiters park on the receiver
    Pending(watch::Receiver<Published>),
}

/// Cache counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Shared translation cache.
///
/// The single-flight contract: concurrent `resolve` calls for one key run
/// the resolver exactly once; every caller observes the same result. Failed
/// resolutions are not cached, so a later attempt may succeed.
#[derive(Debug, Default)]
pub struct SmartCache {
    slots: Mutex<HashMap<Fingerprint, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

enum Role {
    Hit(String),
    Waiter(watch::Receiver<Published>),
    Leader(watch::Sender<Published>),
}

impl SmartCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached translation, if any
    pub fn lookup(&self, key: &Fingerprint) -> Option<String> {
        let slots = self.slots.lock().unwrap();
        match slots.get(key) {
            Some(Slot::Ready(entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.translated.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Resolve `key`, invoking `resolver` at most once process-wide.
    ///
    /// Cached keys return immediately. If another caller is already
    /// resolving the key, this call suspends until that resolution finishes
    /// and shares its outcome, success or failure alike.
    pub async fn resolve<F, Fut>(
        &self,
        key: &Fingerprint,
        resolver: F,
    ) -> std::result::Result<String, TranslateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<String, TranslateError>>,
    {
        let role = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(key) {
                Some(Slot::Ready(entry)) => Role::Hit(entry.translated.clone()),
                Some(Slot::Pending(rx)) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.clone(), Slot::Pending(rx));
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Hit(text) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(text)
            }
            Role::Waiter(rx) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.wait_for_leader(key, rx).await
            }
            Role::Leader(tx) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.lead(key, tx, resolver()).await
            }
        }
    }

    /// Record that one more content unit maps to this cached entry
    pub fn record_reference(&self, key: &Fingerprint) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(Slot::Ready(entry)) = slots.get_mut(key) {
            entry.refs += 1;
        }
    }

    /// Reference count for a cached entry, for diagnostics
    pub fn reference_count(&self, key: &Fingerprint) -> u64 {
        let slots = self.slots.lock().unwrap();
        match slots.get(key) {
            Some(Slot::Ready(entry)) => entry.refs,
            _ => 0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let slots = self.slots.lock().unwrap();
        let entries = slots
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count();
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Run the resolver and publish its outcome to all waiters
    async fn lead<Fut>(
        &self,
        key: &Fingerprint,
        tx: watch::Sender<Published>,
        fut: Fut,
    ) -> std::result::Result<String, TranslateError>
    where
        Fut: Future<Output = std::result::Result<String, TranslateError>>,
    {
        // If this future is dropped mid-flight (cancellation), the guard
        // clears the pending slot so the key can be resolved again later.
        let mut guard = PendingGuard {
            cache: self,
            key,
            published: false,
        };

        let result = fut.await;

        {
            let mut slots = self.slots.lock().unwrap();
            match &result {
                Ok(text) => {
                    slots.insert(
                        key.clone(),
                        Slot::Ready(Entry {
                            translated: text.clone(),
                            refs: 0,
                        }),
                    );
                }
                Err(e) => {
                    debug!("resolution failed for {}: {}", key.as_hex(), e);
                    slots.remove(key);
                }
            }
        }
        guard.published = true;

        let _ = tx.send(Some(result.clone()));
        result
    }

    /// Park until the in-flight leader publishes
    async fn wait_for_leader(
        &self,
        key: &Fingerprint,
        mut rx: watch::Receiver<Published>,
    ) -> std::result::Result<String, TranslateError> {
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Leader dropped without publishing
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
                debug!("resolution abandoned for {}", key.as_hex());
                return Err(TranslateError::Transient {
                    message: "in-flight resolution was abandoned".to_string(),
                    retry_after: None,
                });
            }
        }
    }
}

/// Hands out caches according to the configured scope.
///
/// `Project` scope gives every project a fresh cache; `Shared` scope hands
/// every caller the same instance, so identical text across projects in one
/// process is resolved once.
#[derive(Debug)]
pub struct CacheProvider {
    scope: CacheScope,
    shared: Mutex<Option<Arc<SmartCache>>>,
}

impl CacheProvider {
    pub fn new(scope: CacheScope) -> Self {
        Self {
            scope,
            shared: Mutex::new(None),
        }
    }

    pub fn scope(&self) -> CacheScope {
        self.scope
    }

    /// Cache for the next project
    pub fn cache(&self) -> Arc<SmartCache> {
        match self.scope {
            CacheScope::Project => Arc::new(SmartCache::new()),
            CacheScope::Shared => self
                .shared
                .lock()
                .unwrap()
                .get_or_insert_with(|| Arc::new(SmartCache::new()))
                .clone(),
        }
    }
}

/// Clears a still-pending slot when its leader is dropped before publishing
struct PendingGuard<'a> {
    cache: &'a SmartCache,
    key: &'a Fingerprint,
    published: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.published {
            let mut slots = self.cache.slots.lock().unwrap();
            if matches!(slots.get(self.key), Some(Slot::Pending(_))) {
                slots.remove(self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[test]
    fn test_fingerprint_deterministic() {
        let a = Fingerprint::compute("Chapter 1: The Beginning", "zh", "v1");
        let b = Fingerprint::compute("Chapter 1: The Beginning", "zh", "v1");
        assert_eq!(a, b);
        assert_eq!(a.as_hex().len(), 64);
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace() {
        let a = Fingerprint::compute("  hello   world \n", "zh", "v1");
        let b = Fingerprint::compute("hello world", "zh", "v1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_separates_language_and_glossary() {
        let base = Fingerprint::compute("hello", "zh", "v1");
        assert_ne!(base, Fingerprint::compute("hello", "ja", "v1"));
        assert_ne!(base, Fingerprint::compute("hello", "zh", "v2"));
        // Separator prevents ambiguity between lang and glossary fields
        assert_ne!(
            Fingerprint::compute("hello", "zhv", "1"),
            Fingerprint::compute("hello", "zh", "v1")
        );
    }

    #[tokio::test]
    async fn test_resolve_then_lookup_round_trip() {
        let cache = SmartCache::new();
        let key = Fingerprint::compute("hello", "zh", "none");
        let calls = AtomicUsize::new(0);

        let out = cache
            .resolve(&key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("你好".to_string())
            })
            .await
            .unwrap();
        assert_eq!(out, "你好");
        assert_eq!(cache.lookup(&key), Some("你好".to_string()));

        // Second resolve must not call the resolver again
        let out = cache
            .resolve(&key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("unreachable".to_string())
            })
            .await
            .unwrap();
        assert_eq!(out, "你好");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_calls() {
        let cache = Arc::new(SmartCache::new());
        let key = Fingerprint::compute("same text", "zh", "none");
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(10));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let key = key.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                cache
                    .resolve(&key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("译文".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "译文");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_shared_and_not_cached() {
        let cache = Arc::new(SmartCache::new());
        let key = Fingerprint::compute("doomed", "zh", "none");
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let key = key.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                cache
                    .resolve(&key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(TranslateError::Permanent {
                            message: "bad input".to_string(),
                        })
                    })
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(
                err,
                TranslateError::Permanent {
                    message: "bad input".to_string()
                }
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Failure is not cached: a later attempt runs the resolver again
        assert_eq!(cache.lookup(&key), None);
        let out = cache
            .resolve(&key, || async { Ok("recovered".to_string()) })
            .await
            .unwrap();
        assert_eq!(out, "recovered");
    }

    #[test]
    fn test_project_scope_yields_fresh_caches() {
        let provider = CacheProvider::new(CacheScope::Project);
        assert!(!Arc::ptr_eq(&provider.cache(), &provider.cache()));
    }

    #[test]
    fn test_shared_scope_reuses_one_cache() {
        let provider = CacheProvider::new(CacheScope::Shared);
        let first = provider.cache();
        assert!(Arc::ptr_eq(&first, &provider.cache()));
    }

    #[tokio::test]
    async fn test_reference_counting_is_diagnostic_only() {
        let cache = SmartCache::new();
        let key = Fingerprint::compute("shared", "zh", "none");
        cache
            .resolve(&key, || async { Ok("共享".to_string()) })
            .await
            .unwrap();
        cache.record_reference(&key);
        cache.record_reference(&key);
        assert_eq!(cache.reference_count(&key), 2);
        // Entry survives regardless of refs
        assert_eq!(cache.lookup(&key), Some("共享".to_string()));
    }
}
