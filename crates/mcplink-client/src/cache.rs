use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::error::Result;

/// Anything that can invoke a named tool. Implemented by
/// [`McpClient`](crate::client::McpClient); the cache decorates any
/// implementor.
pub trait ToolCaller {
    fn call_tool(&self, name: &str, arguments: Value, timeout: Option<Duration>) -> Result<Value>;
}

/// Cache behavior knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch; disabled means every call goes straight through.
    pub enabled: bool,
    /// Tool names whose results may be memoized. Only idempotent,
    /// read-only tools belong here.
    pub cacheable: Vec<String>,
    /// Entry limit; the least recently used entry is evicted at the cap.
    /// `None` means unbounded.
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cacheable: vec!["hybrid_search".to_string()],
            max_entries: None,
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Hit fraction over all lookups, 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    value: Value,
    created_at: Instant,
    last_used: Instant,
}

/// Memoizing decorator over a [`ToolCaller`].
///
/// Results for tools listed in [`CacheConfig::cacheable`] are stored under
/// a canonical key, so argument order never splits the cache. Errors are
/// never stored; only a successful result is worth replaying. Racing
/// misses for the same key each reach the server, and the first result
/// back is the one that sticks.
pub struct ToolCache<C> {
    inner: C,
    config: CacheConfig,
    store: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<C: ToolCaller> ToolCache<C> {
    /// Wrap a caller with the default configuration.
    pub fn new(inner: C) -> Self {
        Self::with_config(inner, CacheConfig::default())
    }

    /// Wrap a caller with explicit configuration.
    pub fn with_config(inner: C, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            store: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Invoke a tool, serving cacheable calls from memory when possible.
    pub fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if !self.is_cacheable(name) {
            return self.inner.call_tool(name, arguments, timeout);
        }

        let key = cache_key(name, &arguments);

        {
            let mut store = self.lock_store();
            if let Some(entry) = store.get_mut(&key) {
                entry.last_used = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(tool = name, "cache hit");
                return Ok(entry.value.clone());
            }
        }

        // Miss: call with the store unlocked so one slow tool call never
        // stalls hits on other keys.
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = self.inner.call_tool(name, arguments, timeout)?;

        let mut store = self.lock_store();
        if !store.contains_key(&key) {
            if let Some(max) = self.config.max_entries {
                while store.len() >= max && !store.is_empty() {
                    evict_least_recently_used(&mut store);
                }
            }
            let now = Instant::now();
            store.insert(
                key,
                CacheEntry {
                    value: value.clone(),
                    created_at: now,
                    last_used: now,
                },
            );
        }
        Ok(value)
    }

    /// Invoke a tool without consulting or updating the cache.
    pub fn call_tool_bypassing(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.inner.call_tool(name, arguments, timeout)
    }

    /// Hit/miss counters and current size.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock_store().len(),
        }
    }

    /// Drop every cached entry. Counters are kept.
    pub fn clear(&self) {
        self.lock_store().clear();
    }

    /// Age of the entry under this tool/arguments pair, if cached.
    pub fn entry_age(&self, name: &str, arguments: &Value) -> Option<Duration> {
        let key = cache_key(name, arguments);
        self.lock_store()
            .get(&key)
            .map(|entry| entry.created_at.elapsed())
    }

    /// The wrapped caller.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Unwrap, discarding cached entries.
    pub fn into_inner(self) -> C {
        self.inner
    }

    fn is_cacheable(&self, name: &str) -> bool {
        self.config.enabled && self.config.cacheable.iter().any(|tool| tool == name)
    }

    fn lock_store(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: ToolCaller> ToolCaller for ToolCache<C> {
    fn call_tool(&self, name: &str, arguments: Value, timeout: Option<Duration>) -> Result<Value> {
        ToolCache::call_tool(self, name, arguments, timeout)
    }
}

fn evict_least_recently_used(store: &mut HashMap<String, CacheEntry>) {
    let oldest = store
        .iter()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
        debug!(key = %key, "evicting least recently used entry");
        store.remove(&key);
    }
}

/// Canonical cache key for a tool invocation.
///
/// Object keys are sorted at every depth, so argument maps that differ
/// only in member order produce the same key. Array order is meaningful
/// and preserved.
pub fn cache_key(tool: &str, arguments: &Value) -> String {
    let mut key = String::with_capacity(tool.len() + 32);
    key.push_str(tool);
    key.push('\n');
    write_canonical(arguments, &mut key);
    key
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
