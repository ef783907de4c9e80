//! Two-tier persistent cache with single-flight and stale-while-revalidate.
//!
//! The memory tier is authoritative; the disk tier survives restarts. Keys
//! are derived from `(namespace, canonical(args))`. Concurrent callers for
//! the same key coalesce onto one computation, and the computation runs on a
//! detached task so a disconnected caller never wastes completed work.

pub mod disk;
pub mod key;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};

use crate::error::{ErrorKind, ToolError, ToolResult};
use disk::{DiskEntry, DiskStore};

/// Flush interval for the background persister.
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Stored outcome of a computation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CachedValue {
    /// Successful computation result.
    Success { value: serde_json::Value },
    /// Cached failure (only stored when `cache_errors` is requested).
    Failure { kind: String, message: String },
}

/// Per-call cache options.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// TTL override; falls back to the cache default.
    pub ttl: Option<Duration>,

    /// Serve a stale entry immediately and refresh in the background.
    pub stale_while_revalidate: bool,

    /// Grace window after expiry in which stale entries remain servable.
    pub stale_time: Option<Duration>,

    /// Byte-size hint used for byte-based eviction.
    pub size_hint: Option<u64>,

    /// Cache failed computations too (off by default).
    pub cache_errors: bool,
}

/// Cache construction parameters.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub storage_path: std::path::PathBuf,
    pub default_ttl: Duration,
    pub max_entries: usize,
    pub max_bytes: u64,
    /// Soft per-namespace entry quota; over-quota namespaces evict first.
    pub namespace_quota: Option<usize>,
}

/// Aggregate cache counters.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub hit_ratio: f64,
    pub entries_by_namespace: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: CachedValue,
    created_at_ms: i64,
    expires_at_ms: i64,
    stale_until_ms: i64,
    size: u64,
    last_access: u64,
    dirty: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<(String, String), Entry>,
    bytes: u64,
    access_seq: u64,
}

type FlightOutcome = Result<serde_json::Value, FlightFailure>;

#[derive(Debug, Clone)]
struct FlightFailure {
    kind: ErrorKind,
    message: String,
}

/// Two-tier keyed cache shared by the dispatcher and tools.
pub struct PersistentCache {
    inner: Mutex<Inner>,
    inflight: Mutex<HashMap<(String, String), watch::Receiver<Option<FlightOutcome>>>>,
    refreshing: Mutex<HashSet<(String, String)>>,
    disk: DiskStore,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
}

impl PersistentCache {
    /// Open the cache, loading any persisted entries that are still live.
    pub async fn open(config: CacheConfig) -> Arc<Self> {
        let disk = DiskStore::new(config.storage_path.clone());
        let loaded = disk.load_all(now_ms()).await;

        let cache = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            inflight: Mutex::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
            disk,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
        });

        if !loaded.is_empty() {
            let mut inner = cache.inner.lock().await;
            for entry in loaded {
                inner.access_seq += 1;
                let seq = inner.access_seq;
                inner.bytes += entry.size;
                inner.entries.insert(
                    (entry.namespace, entry.key_hash),
                    Entry {
                        value: entry.value,
                        created_at_ms: entry.created_at_ms,
                        expires_at_ms: entry.expires_at_ms,
                        stale_until_ms: entry.stale_until_ms,
                        size: entry.size,
                        last_access: seq,
                        dirty: false,
                    },
                );
            }
            tracing::info!(entries = inner.entries.len(), "Loaded persisted cache entries");
        }

        cache
    }

    /// Return the cached value if fresh, otherwise run `compute` at most once
    /// across concurrent callers and store the result.
    pub async fn get_or_compute<F, Fut>(
        self: &Arc<Self>,
        namespace: &str,
        args: &serde_json::Value,
        opts: CacheOptions,
        compute: F,
    ) -> ToolResult<serde_json::Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ToolResult<serde_json::Value>> + Send + 'static,
    {
        let hash = key::key_hash(namespace, args);
        let entry_key = (namespace.to_owned(), hash);
        let now = now_ms();

        // Fast path: fresh or stale-servable hit.
        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.entries.get(&entry_key) {
                if now < entry.expires_at_ms {
                    let value = entry.value.clone();
                    touch(&mut inner, &entry_key);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return unwrap_cached(value);
                }
                if opts.stale_while_revalidate && now < entry.stale_until_ms {
                    let value = entry.value.clone();
                    touch(&mut inner, &entry_key);
                    drop(inner);
                    self.stale_hits.fetch_add(1, Ordering::Relaxed);
                    self.schedule_refresh(entry_key, opts, compute).await;
                    return unwrap_cached(value);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.run_single_flight(entry_key, opts, compute).await
    }

    /// Remove a single entry, or the whole namespace when `args` is `None`.
    /// Returns the number of entries removed.
    pub async fn invalidate(&self, namespace: &str, args: Option<&serde_json::Value>) -> usize {
        let mut inner = self.inner.lock().await;
        match args {
            Some(args) => {
                let hash = key::key_hash(namespace, args);
                let key = (namespace.to_owned(), hash.clone());
                if let Some(entry) = inner.entries.remove(&key) {
                    inner.bytes = inner.bytes.saturating_sub(entry.size);
                    drop(inner);
                    self.disk.remove_entry(namespace, &hash).await;
                    1
                } else {
                    0
                }
            }
            None => {
                let keys: Vec<(String, String)> = inner
                    .entries
                    .keys()
                    .filter(|(ns, _)| ns == namespace)
                    .cloned()
                    .collect();
                for key in &keys {
                    if let Some(entry) = inner.entries.remove(key) {
                        inner.bytes = inner.bytes.saturating_sub(entry.size);
                    }
                }
                drop(inner);
                self.disk.remove_namespace(namespace).await;
                keys.len()
            }
        }
    }

    /// Force a disk write of all dirty entries. Returns how many were written.
    pub async fn persist_now(&self) -> usize {
        let dirty: Vec<DiskEntry> = {
            let inner = self.inner.lock().await;
            inner
                .entries
                .iter()
                .filter(|(_, e)| e.dirty)
                .map(|((ns, hash), e)| DiskEntry {
                    namespace: ns.clone(),
                    key_hash: hash.clone(),
                    value: e.value.clone(),
                    created_at_ms: e.created_at_ms,
                    expires_at_ms: e.expires_at_ms,
                    stale_until_ms: e.stale_until_ms,
                    size: e.size,
                })
                .collect()
        };

        let mut written = 0;
        for entry in dirty {
            let key = (entry.namespace.clone(), entry.key_hash.clone());
            match self.disk.write_entry(&entry).await {
                Ok(()) => {
                    written += 1;
                    let mut inner = self.inner.lock().await;
                    if let Some(e) = inner.entries.get_mut(&key) {
                        e.dirty = false;
                    }
                }
                Err(e) => {
                    // Reads stay healthy; the flusher retries next interval.
                    tracing::warn!(namespace = %entry.namespace, error = %e, "Cache persist failed");
                }
            }
        }
        written
    }

    /// Current counters.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let mut by_namespace: HashMap<String, usize> = HashMap::new();
        for (ns, _) in inner.entries.keys() {
            *by_namespace.entry(ns.clone()).or_insert(0) += 1;
        }

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            size: inner.entries.len(),
            bytes: inner.bytes,
            hits,
            misses,
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            hit_ratio: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            entries_by_namespace: by_namespace,
        }
    }

    /// Start the background flusher.
    pub fn start_flush_task(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let written = cache.persist_now().await;
                if written > 0 {
                    tracing::debug!(written, "Cache flush completed");
                }
            }
        });
    }

    async fn run_single_flight<F, Fut>(
        self: &Arc<Self>,
        entry_key: (String, String),
        opts: CacheOptions,
        compute: F,
    ) -> ToolResult<serde_json::Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ToolResult<serde_json::Value>> + Send + 'static,
    {
        let mut receiver = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(&entry_key) {
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(entry_key.clone(), rx.clone());
                drop(inflight);

                // Detached so a cancelled caller never discards completed work.
                let cache = Arc::clone(self);
                let flight_key = entry_key.clone();
                tokio::spawn(async move {
                    let outcome = match compute().await {
                        Ok(value) => {
                            cache.admit(&flight_key, CachedValue::Success { value: value.clone() }, &opts).await;
                            Ok(value)
                        }
                        Err(e) => {
                            let failure =
                                FlightFailure { kind: e.kind(), message: e.to_user_message() };
                            if opts.cache_errors {
                                cache
                                    .admit(
                                        &flight_key,
                                        CachedValue::Failure {
                                            kind: failure.kind.as_str().to_owned(),
                                            message: failure.message.clone(),
                                        },
                                        &opts,
                                    )
                                    .await;
                            }
                            Err(failure)
                        }
                    };
                    cache.inflight.lock().await.remove(&flight_key);
                    let _ = tx.send(Some(outcome));
                });
                rx
            }
        };

        let outcome = receiver
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| ToolError::internal("cache computation aborted"))?
            .clone();

        match outcome.unwrap_or_else(|| unreachable!("wait_for guarantees Some")) {
            Ok(value) => Ok(value),
            Err(failure) => {
                Err(ToolError::Coalesced { kind: failure.kind, message: failure.message })
            }
        }
    }

    async fn schedule_refresh<F, Fut>(
        self: &Arc<Self>,
        entry_key: (String, String),
        opts: CacheOptions,
        compute: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ToolResult<serde_json::Value>> + Send + 'static,
    {
        {
            let mut refreshing = self.refreshing.lock().await;
            if !refreshing.insert(entry_key.clone()) {
                return; // one background recompute per key
            }
        }

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            match compute().await {
                Ok(value) => {
                    cache.admit(&entry_key, CachedValue::Success { value }, &opts).await;
                }
                Err(e) => {
                    tracing::debug!(
                        namespace = %entry_key.0,
                        error = %e,
                        "Stale-while-revalidate refresh failed; keeping stale entry"
                    );
                }
            }
            cache.refreshing.lock().await.remove(&entry_key);
        });
    }

    async fn admit(&self, entry_key: &(String, String), value: CachedValue, opts: &CacheOptions) {
        let now = now_ms();
        let ttl = opts.ttl.unwrap_or(self.config.default_ttl);
        let stale_grace = opts.stale_time.unwrap_or(crate::config::ttl::STALE_GRACE);
        let size = opts.size_hint.unwrap_or_else(|| estimate_size(&value));

        let expires_at_ms = now + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let stale_until_ms =
            expires_at_ms + i64::try_from(stale_grace.as_millis()).unwrap_or(i64::MAX);

        let evicted = {
            let mut inner = self.inner.lock().await;
            if let Some(old) = inner.entries.remove(entry_key) {
                inner.bytes = inner.bytes.saturating_sub(old.size);
            }
            inner.access_seq += 1;
            let seq = inner.access_seq;
            inner.bytes += size;
            inner.entries.insert(
                entry_key.clone(),
                Entry {
                    value,
                    created_at_ms: now,
                    expires_at_ms,
                    stale_until_ms,
                    size,
                    last_access: seq,
                    dirty: true,
                },
            );
            self.evict_over_caps(&mut inner)
        };

        for (ns, hash) in evicted {
            self.disk.remove_entry(&ns, &hash).await;
        }
    }

    /// Evict least-recently-accessed entries until under caps; over-quota
    /// namespaces lose entries first when a soft quota is configured.
    fn evict_over_caps(&self, inner: &mut Inner) -> Vec<(String, String)> {
        let mut evicted = Vec::new();

        while inner.entries.len() > self.config.max_entries || inner.bytes > self.config.max_bytes
        {
            let victim = self
                .config
                .namespace_quota
                .and_then(|quota| {
                    let mut counts: HashMap<&str, usize> = HashMap::new();
                    for (ns, _) in inner.entries.keys() {
                        *counts.entry(ns.as_str()).or_insert(0) += 1;
                    }
                    inner
                        .entries
                        .iter()
                        .filter(|((ns, _), _)| counts.get(ns.as_str()).copied().unwrap_or(0) > quota)
                        .min_by_key(|(_, e)| e.last_access)
                        .map(|(k, _)| k.clone())
                })
                .or_else(|| {
                    inner.entries.iter().min_by_key(|(_, e)| e.last_access).map(|(k, _)| k.clone())
                });

            let Some(key) = victim else { break };
            if let Some(entry) = inner.entries.remove(&key) {
                inner.bytes = inner.bytes.saturating_sub(entry.size);
            }
            evicted.push(key);
        }

        evicted
    }
}

impl std::fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache").finish()
    }
}

fn touch(inner: &mut Inner, key: &(String, String)) {
    inner.access_seq += 1;
    let seq = inner.access_seq;
    if let Some(entry) = inner.entries.get_mut(key) {
        entry.last_access = seq;
    }
}

fn unwrap_cached(value: CachedValue) -> ToolResult<serde_json::Value> {
    match value {
        CachedValue::Success { value } => Ok(value),
        CachedValue::Failure { kind, message } => Err(ToolError::Coalesced {
            kind: ErrorKind::parse(&kind).unwrap_or(ErrorKind::InternalError),
            message,
        }),
    }
}

fn estimate_size(value: &CachedValue) -> u64 {
    match value {
        CachedValue::Success { value } => {
            serde_json::to_string(value).map(|s| s.len() as u64).unwrap_or(0)
        }
        CachedValue::Failure { message, .. } => message.len() as u64,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_config(dir: &std::path::Path) -> CacheConfig {
        CacheConfig {
            storage_path: dir.to_path_buf(),
            default_ttl: Duration::from_secs(60),
            max_entries: 100,
            max_bytes: 1024 * 1024,
            namespace_quota: None,
        }
    }

    #[tokio::test]
    async fn test_hit_after_compute() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(test_config(dir.path())).await;
        let args = serde_json::json!({"q": "acme"});

        let v1 = cache
            .get_or_compute("search", &args, CacheOptions::default(), || async {
                Ok(serde_json::json!({"n": 1}))
            })
            .await
            .unwrap();
        let v2 = cache
            .get_or_compute("search", &args, CacheOptions::default(), || async {
                panic!("must not recompute")
            })
            .await
            .unwrap();

        assert_eq!(v1, v2);
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_single_flight_runs_compute_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(test_config(dir.path())).await;
        let args = serde_json::json!({"q": "acme"});
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let args = args.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("search", &args, CacheOptions::default(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(serde_json::json!({"n": 42}))
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), serde_json::json!({"n": 42}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_not_cached_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(test_config(dir.path())).await;
        let args = serde_json::json!({"q": "acme"});

        let err = cache
            .get_or_compute("search", &args, CacheOptions::default(), || async {
                Err(ToolError::internal("boom"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);

        // Second call recomputes and succeeds.
        let ok = cache
            .get_or_compute("search", &args, CacheOptions::default(), || async {
                Ok(serde_json::json!({"n": 2}))
            })
            .await
            .unwrap();
        assert_eq!(ok, serde_json::json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_invalidate_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(test_config(dir.path())).await;

        for i in 0..3 {
            let args = serde_json::json!({"q": i});
            cache
                .get_or_compute("search", &args, CacheOptions::default(), move || async move {
                    Ok(serde_json::json!(i))
                })
                .await
                .unwrap();
        }

        assert_eq!(cache.invalidate("search", None).await, 3);
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_over_entry_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_entries = 2;
        let cache = PersistentCache::open(config).await;

        for i in 0..3 {
            let args = serde_json::json!({"q": i});
            cache
                .get_or_compute("search", &args, CacheOptions::default(), move || async move {
                    Ok(serde_json::json!(i))
                })
                .await
                .unwrap();
        }

        let stats = cache.stats().await;
        assert_eq!(stats.size, 2);

        // Oldest entry (q=0) was evicted; recompute happens.
        let recomputed = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&recomputed);
        cache
            .get_or_compute("search", &serde_json::json!({"q": 0}), CacheOptions::default(), move || async move {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!(0))
            })
            .await
            .unwrap();
        assert_eq!(recomputed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let args = serde_json::json!({"q": "durable"});

        {
            let cache = PersistentCache::open(test_config(dir.path())).await;
            cache
                .get_or_compute("search", &args, CacheOptions::default(), || async {
                    Ok(serde_json::json!({"n": 7}))
                })
                .await
                .unwrap();
            assert!(cache.persist_now().await >= 1);
        }

        let cache = PersistentCache::open(test_config(dir.path())).await;
        let value = cache
            .get_or_compute("search", &args, CacheOptions::default(), || async {
                panic!("must come from disk")
            })
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!({"n": 7}));
    }

    #[tokio::test]
    async fn test_swr_serves_stale_and_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(test_config(dir.path())).await;
        let args = serde_json::json!({"q": "swr"});

        let opts = CacheOptions {
            ttl: Some(Duration::from_millis(10)),
            stale_while_revalidate: true,
            stale_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        cache
            .get_or_compute("search", &args, opts.clone(), || async {
                Ok(serde_json::json!({"gen": 1}))
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Stale hit returns the old value immediately.
        let stale = cache
            .get_or_compute("search", &args, opts.clone(), || async {
                Ok(serde_json::json!({"gen": 2}))
            })
            .await
            .unwrap();
        assert_eq!(stale, serde_json::json!({"gen": 1}));

        // Background refresh lands shortly after.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = cache
            .get_or_compute("search", &args, opts, || async {
                panic!("refresh already stored gen 2")
            })
            .await
            .unwrap();
        assert_eq!(fresh, serde_json::json!({"gen": 2}));
        assert!(cache.stats().await.stale_hits >= 1);
    }
}
