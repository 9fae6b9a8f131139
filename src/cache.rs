//! Compiled template cache.
//!
//! Keys identify one templated field of one stub. Entries are evicted least
//! recently used first once the configured bound is reached; a bound of zero
//! disables storage entirely. Concurrent misses on the same key share a
//! single compile. Each entry remembers its source, so a key whose template
//! text changed is recompiled rather than served stale.

use crate::error::TemplateError;
use crate::template::{CompiledTemplate, TemplateProvider};
use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Identifies one templated field occurrence of one stub.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    stub_id: String,
    field: TemplateField,
}

/// Which field of a response description a template came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateField {
    /// Inline text or JSON body
    InlineBody,
    /// Body file contents, by resolved path
    FileBody { path: String },
    /// One value of a response header
    Header { key: String, index: usize },
    /// Proxy base URL
    ProxyUrl,
    /// One value of an additional proxy request header
    ProxyRequestHeader { key: String, index: usize },
}

impl CacheKey {
    pub fn new(stub_id: impl Into<String>, field: TemplateField) -> Self {
        Self {
            stub_id: stub_id.into(),
            field,
        }
    }

    pub fn inline_body(stub_id: &str) -> Self {
        Self::new(stub_id, TemplateField::InlineBody)
    }

    pub fn file_body(stub_id: &str, path: &str) -> Self {
        Self::new(
            stub_id,
            TemplateField::FileBody {
                path: path.to_string(),
            },
        )
    }

    pub fn header(stub_id: &str, key: &str, index: usize) -> Self {
        Self::new(
            stub_id,
            TemplateField::Header {
                key: key.to_string(),
                index,
            },
        )
    }

    pub fn proxy_url(stub_id: &str) -> Self {
        Self::new(stub_id, TemplateField::ProxyUrl)
    }

    pub fn proxy_request_header(stub_id: &str, key: &str, index: usize) -> Self {
        Self::new(
            stub_id,
            TemplateField::ProxyRequestHeader {
                key: key.to_string(),
                index,
            },
        )
    }
}

/// Filled at most once; shared by every caller that missed on the same key
/// with the same source.
struct Slot {
    source: String,
    compiled: OnceCell<CompiledTemplate>,
}

impl Slot {
    fn new(source: &str) -> Arc<Self> {
        Arc::new(Self {
            source: source.to_string(),
            compiled: OnceCell::new(),
        })
    }
}

/// Bounded, thread-safe store of compiled templates.
pub struct TemplateCache {
    provider: Arc<dyn TemplateProvider>,
    /// `None` when the bound is zero.
    entries: Option<Mutex<LruCache<CacheKey, Arc<Slot>>>>,
    max_entries: Option<usize>,
}

impl TemplateCache {
    /// Create a cache; `max_entries` of `None` means unbounded.
    pub fn new(provider: Arc<dyn TemplateProvider>, max_entries: Option<usize>) -> Self {
        let entries = match max_entries.map(NonZeroUsize::new) {
            None => Some(Mutex::new(LruCache::unbounded())),
            Some(None) => None,
            Some(Some(capacity)) => Some(Mutex::new(LruCache::new(capacity))),
        };
        Self {
            provider,
            entries,
            max_entries,
        }
    }

    /// Return the template for `key`, compiling `source` on a miss.
    ///
    /// An entry compiled from a different source than `source` counts as a
    /// miss and is replaced.
    pub fn get(&self, key: &CacheKey, source: &str) -> Result<CompiledTemplate, TemplateError> {
        let Some(entries) = &self.entries else {
            return self.get_uncached(source);
        };

        let slot = {
            let mut guard = entries.lock();
            let hit = guard
                .get(key)
                .filter(|slot| slot.source == source)
                .cloned();
            match hit {
                Some(slot) => slot,
                None => {
                    if guard.contains(key) {
                        debug!(stub_id = %key.stub_id, field = ?key.field, "Template source changed");
                    }
                    let slot = Slot::new(source);
                    guard.put(key.clone(), Arc::clone(&slot));
                    slot
                }
            }
        };

        // Compile outside the map lock; other callers for this key wait on the slot.
        let compiled = slot.compiled.get_or_try_init(|| {
            debug!(stub_id = %key.stub_id, field = ?key.field, "Compiling template");
            self.provider.compile(source)
        });

        match compiled {
            Ok(template) => Ok(template.clone()),
            Err(err) => {
                let mut guard = entries.lock();
                if guard.peek(key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    guard.pop(key);
                }
                Err(err)
            }
        }
    }

    /// Compile `source` without consulting or filling the cache.
    pub fn get_uncached(&self, source: &str) -> Result<CompiledTemplate, TemplateError> {
        debug!("Compiling uncached template");
        self.provider.compile(source)
    }

    /// Drop every entry. Templates already handed out stay usable.
    pub fn invalidate_all(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    /// Number of entries currently held.
    pub fn size(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.lock().len())
    }

    /// Configured bound; `None` means unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.max_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Parameters;
    use crate::model::ContextModel;
    use crate::request::Request;
    use crate::test_support::CountingProvider;
    use serde_json::Map;
    use std::time::Duration;

    fn model() -> ContextModel {
        ContextModel::build(&Request::new("GET", "/a"), None, &Parameters::new(), Map::new())
            .unwrap()
    }

    #[test]
    fn test_repeated_gets_compile_once() {
        let provider = CountingProvider::new();
        let cache = TemplateCache::new(provider.clone(), None);
        let key = CacheKey::inline_body("stub-1");

        for _ in 0..5 {
            let template = cache.get(&key, "{{request.path}}").unwrap();
            assert_eq!(template.render(&model()).unwrap(), "/a");
        }

        assert_eq!(provider.compiles(), 1);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_distinct_keys() {
        let provider = CountingProvider::new();
        let cache = TemplateCache::new(provider.clone(), None);

        cache.get(&CacheKey::header("s", "X-A", 0), "a").unwrap();
        cache.get(&CacheKey::header("s", "X-A", 1), "b").unwrap();
        cache.get(&CacheKey::file_body("s", "one.json"), "c").unwrap();
        cache.get(&CacheKey::file_body("s", "two.json"), "d").unwrap();
        cache.get(&CacheKey::proxy_request_header("s", "X-A", 0), "e").unwrap();
        cache.get(&CacheKey::inline_body("other"), "f").unwrap();

        assert_eq!(provider.compiles(), 6);
        assert_eq!(cache.size(), 6);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let provider = CountingProvider::new();
        let cache = TemplateCache::new(provider.clone(), Some(2));
        let a = CacheKey::inline_body("a");
        let b = CacheKey::inline_body("b");
        let c = CacheKey::inline_body("c");

        cache.get(&a, "a").unwrap();
        cache.get(&b, "b").unwrap();
        cache.get(&a, "a").unwrap();
        cache.get(&c, "c").unwrap();
        assert_eq!(provider.compiles(), 3);
        assert_eq!(cache.size(), 2);

        // `a` was used more recently than `b`
        cache.get(&a, "a").unwrap();
        assert_eq!(provider.compiles(), 3);
        cache.get(&b, "b").unwrap();
        assert_eq!(provider.compiles(), 4);
    }

    #[test]
    fn test_changed_source_recompiles() {
        let provider = CountingProvider::new();
        let cache = TemplateCache::new(provider.clone(), None);
        let key = CacheKey::inline_body("stub-1");

        let first = cache.get(&key, "v1 {{request.path}}").unwrap();
        let second = cache.get(&key, "v2 {{request.path}}").unwrap();
        assert_eq!(first.render(&model()).unwrap(), "v1 /a");
        assert_eq!(second.render(&model()).unwrap(), "v2 /a");
        assert_eq!(provider.compiles(), 2);
        assert_eq!(cache.size(), 1);

        cache.get(&key, "v2 {{request.path}}").unwrap();
        assert_eq!(provider.compiles(), 2);
    }

    #[test]
    fn test_invalidate_all() {
        let provider = CountingProvider::new();
        let cache = TemplateCache::new(provider.clone(), None);
        let key = CacheKey::proxy_url("stub");

        let template = cache.get(&key, "{{request.path}}").unwrap();
        cache.invalidate_all();
        assert_eq!(cache.size(), 0);

        // Held templates still render after invalidation
        assert_eq!(template.render(&model()).unwrap(), "/a");

        cache.get(&key, "{{request.path}}").unwrap();
        assert_eq!(provider.compiles(), 2);
    }

    #[test]
    fn test_compile_failure_not_cached() {
        let provider = CountingProvider::new();
        let cache = TemplateCache::new(provider.clone(), None);
        let key = CacheKey::inline_body("broken");

        assert!(cache.get(&key, "{{#if x}}{{/each}}").is_err());
        assert_eq!(cache.size(), 0);
        assert!(cache.get(&key, "{{#if x}}{{/each}}").is_err());
        assert_eq!(provider.compiles(), 2);
    }

    #[test]
    fn test_uncached_never_stores() {
        let provider = CountingProvider::new();
        let cache = TemplateCache::new(provider.clone(), None);

        cache.get_uncached("{{request.query.f}}.json").unwrap();
        cache.get_uncached("{{request.query.f}}.json").unwrap();

        assert_eq!(provider.compiles(), 2);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_zero_bound_disables_caching() {
        let provider = CountingProvider::new();
        let cache = TemplateCache::new(provider.clone(), Some(0));
        let key = CacheKey::inline_body("s");

        cache.get(&key, "x").unwrap();
        cache.get(&key, "x").unwrap();

        assert_eq!(provider.compiles(), 2);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.capacity(), Some(0));
    }

    #[test]
    fn test_capacity_reported() {
        let provider = CountingProvider::new();
        assert_eq!(TemplateCache::new(provider.clone(), None).capacity(), None);
        assert_eq!(TemplateCache::new(provider, Some(10)).capacity(), Some(10));
    }

    #[test]
    fn test_concurrent_misses_compile_once() {
        let provider = CountingProvider::slow(Duration::from_millis(50));
        let cache = TemplateCache::new(provider.clone(), None);
        let key = CacheKey::inline_body("hot");

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let template = cache.get(&key, "{{request.path}}").unwrap();
                    assert_eq!(template.render(&model()).unwrap(), "/a");
                });
            }
        });

        assert_eq!(provider.compiles(), 1);
        assert_eq!(cache.size(), 1);
    }
}
