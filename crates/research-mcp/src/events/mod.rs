//! Append-only per-stream event log with resumable replay.
//!
//! Every outbound SSE frame is written through this store so a reconnecting
//! client can replay from its last seen event id. Event ids encode the
//! stream: `{streamId}_{unixMillis}_{random}` — stream ids never contain an
//! underscore, which session issuance enforces.

pub mod crypto;
pub mod sanitize;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crypto::EventCipher;

/// Decides whether a caller may replay a stream.
pub trait ReplayAuthorizer: Send + Sync {
    fn allow(&self, stream_id: &str, user_id: Option<&str>) -> bool;
}

/// Store construction parameters.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    pub storage_path: PathBuf,
    pub max_events_per_stream: usize,
    pub max_events_total: usize,
    pub ttl: Duration,
    /// Streams persisted synchronously on every store.
    pub critical_streams: HashSet<String>,
    /// Enables at-rest encryption of stored messages.
    pub cipher: Option<EventCipher>,
}

impl EventStoreConfig {
    /// Defaults rooted at the given directory.
    #[must_use]
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            max_events_per_stream: crate::config::limits::MAX_EVENTS_PER_STREAM,
            max_events_total: crate::config::limits::MAX_EVENTS_TOTAL,
            ttl: crate::config::limits::EVENT_TTL,
            critical_streams: HashSet::new(),
            cipher: None,
        }
    }
}

/// One stored event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredEvent {
    pub event_id: String,
    pub stream_id: String,
    pub message: serde_json::Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Store counters.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStoreStats {
    pub total_events: usize,
    pub stream_count: usize,
    pub stored: u64,
    pub store_failures: u64,
    pub replay_hits: u64,
    pub replay_misses: u64,
    pub bytes_persisted: u64,
    pub oldest_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
}

#[derive(Default)]
struct Inner {
    /// Insertion-ordered events per stream.
    streams: HashMap<String, Vec<StoredEvent>>,
    total: usize,
    /// Non-critical events queued for the background flusher.
    pending: Vec<StoredEvent>,
}

/// Extract the stream id from an event id.
#[must_use]
pub fn stream_id_of(event_id: &str) -> Option<&str> {
    let stream = event_id.split('_').next()?;
    if stream.is_empty() || stream.len() == event_id.len() {
        return None;
    }
    Some(stream)
}

/// Persistent per-stream event log.
pub struct EventStore {
    inner: Mutex<Inner>,
    config: EventStoreConfig,
    authorizer: Mutex<Option<Arc<dyn ReplayAuthorizer>>>,
    stored: AtomicU64,
    store_failures: AtomicU64,
    replay_hits: AtomicU64,
    replay_misses: AtomicU64,
    bytes_persisted: AtomicU64,
}

impl EventStore {
    /// Open the store and load any persisted, unexpired events.
    pub async fn open(config: EventStoreConfig) -> Arc<Self> {
        let store = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            config,
            authorizer: Mutex::new(None),
            stored: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            replay_hits: AtomicU64::new(0),
            replay_misses: AtomicU64::new(0),
            bytes_persisted: AtomicU64::new(0),
        });

        let cutoff = store.ttl_cutoff();
        let loaded = store.load_all_streams(cutoff).await;
        if !loaded.is_empty() {
            let mut inner = store.inner.lock().await;
            for (stream_id, events) in loaded {
                inner.total += events.len();
                inner.streams.insert(stream_id, events);
            }
            tracing::info!(events = inner.total, "Loaded persisted events");
        }

        store
    }

    /// Install an access-control hook for replay.
    pub async fn set_authorizer(&self, authorizer: Arc<dyn ReplayAuthorizer>) {
        *self.authorizer.lock().await = Some(authorizer);
    }

    /// Append a message to a stream. Never fails the caller: storage errors
    /// are logged and counted, and the empty string is returned.
    pub async fn store_event(
        &self,
        stream_id: &str,
        message: &serde_json::Value,
        user_id: Option<&str>,
    ) -> String {
        if stream_id.is_empty() || stream_id.contains('_') {
            tracing::error!(stream_id, "Rejecting event for invalid stream id");
            self.store_failures.fetch_add(1, Ordering::Relaxed);
            return String::new();
        }

        let clean = sanitize::sanitize(message);
        let stored_message = match &self.config.cipher {
            Some(cipher) => match cipher.encrypt(&clean) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::error!(stream_id, error = %e, "Event encryption failed; dropping event");
                    self.store_failures.fetch_add(1, Ordering::Relaxed);
                    return String::new();
                }
            },
            None => clean,
        };

        let timestamp = now_ms();
        let event_id = format!("{stream_id}_{timestamp}_{:08x}", rand::thread_rng().r#gen::<u32>());
        let event = StoredEvent {
            event_id: event_id.clone(),
            stream_id: stream_id.to_owned(),
            message: stored_message,
            timestamp,
            user_id: user_id.map(str::to_owned),
        };

        let critical = self.config.critical_streams.contains(stream_id);
        let evicted = {
            let mut inner = self.inner.lock().await;
            inner.streams.entry(stream_id.to_owned()).or_default().push(event.clone());
            inner.total += 1;
            if !critical {
                inner.pending.push(event.clone());
            }
            self.enforce_caps(&mut inner)
        };

        for old in &evicted {
            self.remove_file(old).await;
        }

        if critical {
            if let Err(e) = self.write_event(&event).await {
                tracing::error!(stream_id, error = %e, "Synchronous event persist failed");
                self.store_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.stored.fetch_add(1, Ordering::Relaxed);
        event_id
    }

    /// Replay every event in the same stream strictly after `last_event_id`,
    /// in insertion order. Returns the stream id, or the empty string when
    /// the id cannot be located or access is denied.
    pub async fn replay_events_after<F, Fut>(
        &self,
        last_event_id: &str,
        mut send: F,
        user_id: Option<&str>,
    ) -> String
    where
        F: FnMut(String, serde_json::Value) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let Some(stream_id) = stream_id_of(last_event_id) else {
            self.replay_misses.fetch_add(1, Ordering::Relaxed);
            return String::new();
        };
        let stream_id = stream_id.to_owned();

        if let Some(authorizer) = self.authorizer.lock().await.clone() {
            if !authorizer.allow(&stream_id, user_id) {
                tracing::warn!(stream_id, user_id, "Replay denied by authorizer");
                self.replay_misses.fetch_add(1, Ordering::Relaxed);
                return String::new();
            }
        }

        let events: Vec<StoredEvent> = {
            let inner = self.inner.lock().await;
            match inner.streams.get(&stream_id) {
                Some(events) if events.iter().any(|e| e.event_id == last_event_id) => {
                    events.clone()
                }
                _ => {
                    drop(inner);
                    self.load_stream(&stream_id).await
                }
            }
        };

        let Some(position) = events.iter().position(|e| e.event_id == last_event_id) else {
            self.replay_misses.fetch_add(1, Ordering::Relaxed);
            return String::new();
        };

        for event in &events[position + 1..] {
            let message = if crypto::is_encrypted(&event.message) {
                match self.config.cipher.as_ref().map(|c| c.decrypt(&event.message)) {
                    Some(Ok(clear)) => clear,
                    _ => {
                        // Authenticated decryption failed: surface a synthetic
                        // error for this event, never plaintext.
                        tracing::error!(event_id = %event.event_id, "Event decryption failed during replay");
                        serde_json::json!({
                            "jsonrpc": "2.0",
                            "error": {"code": -32603, "message": "Failed to decrypt stored event"},
                            "id": null
                        })
                    }
                }
            } else {
                event.message.clone()
            };
            send(event.event_id.clone(), message).await;
        }

        self.replay_hits.fetch_add(1, Ordering::Relaxed);
        stream_id
    }

    /// Remove every event stored for a user. Returns the count removed.
    pub async fn delete_user_events(&self, user_id: &str) -> usize {
        let removed: Vec<StoredEvent> = {
            let mut inner = self.inner.lock().await;
            let mut removed = Vec::new();
            for events in inner.streams.values_mut() {
                let mut kept = Vec::with_capacity(events.len());
                for event in events.drain(..) {
                    if event.user_id.as_deref() == Some(user_id) {
                        removed.push(event);
                    } else {
                        kept.push(event);
                    }
                }
                *events = kept;
            }
            inner.streams.retain(|_, v| !v.is_empty());
            inner.total = inner.total.saturating_sub(removed.len());
            inner.pending.retain(|e| e.user_id.as_deref() != Some(user_id));
            removed
        };

        for event in &removed {
            self.remove_file(event).await;
        }

        tracing::info!(user_id, count = removed.len(), "Deleted user events");
        removed.len()
    }

    /// Drain queued events to disk. Returns how many were written.
    pub async fn flush(&self) -> usize {
        let pending: Vec<StoredEvent> = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.pending)
        };

        let mut written = 0;
        for event in &pending {
            match self.write_event(event).await {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(event_id = %event.event_id, error = %e, "Event persist failed; requeueing");
                    self.store_failures.fetch_add(1, Ordering::Relaxed);
                    self.inner.lock().await.pending.push(event.clone());
                }
            }
        }
        written
    }

    /// Drop events older than the TTL from memory and disk.
    pub async fn cleanup_expired(&self) -> usize {
        let cutoff = self.ttl_cutoff();
        let removed: Vec<StoredEvent> = {
            let mut inner = self.inner.lock().await;
            let mut removed = Vec::new();
            for events in inner.streams.values_mut() {
                while events.first().is_some_and(|e| e.timestamp < cutoff) {
                    removed.push(events.remove(0));
                }
            }
            inner.streams.retain(|_, v| !v.is_empty());
            inner.total = inner.total.saturating_sub(removed.len());
            removed
        };

        for event in &removed {
            self.remove_file(event).await;
        }

        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "Expired events reaped");
        }
        removed.len()
    }

    /// Current counters.
    pub async fn stats(&self) -> EventStoreStats {
        let inner = self.inner.lock().await;
        let timestamps = inner.streams.values().flatten().map(|e| e.timestamp);

        EventStoreStats {
            total_events: inner.total,
            stream_count: inner.streams.len(),
            stored: self.stored.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            replay_hits: self.replay_hits.load(Ordering::Relaxed),
            replay_misses: self.replay_misses.load(Ordering::Relaxed),
            bytes_persisted: self.bytes_persisted.load(Ordering::Relaxed),
            oldest_timestamp: timestamps.clone().min(),
            newest_timestamp: timestamps.max(),
        }
    }

    /// Start the periodic flusher and TTL sweeper.
    pub fn start_maintenance_tasks(self: &Arc<Self>) {
        let flusher = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                flusher.flush().await;
            }
        });

        let sweeper = Arc::clone(self);
        let sweep_every = self.config.ttl.checked_div(4).unwrap_or(Duration::ZERO);
        let sweep_every = sweep_every.clamp(Duration::from_secs(1), Duration::from_secs(3600));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sweeper.cleanup_expired().await;
            }
        });
    }

    /// Oldest-first eviction under the per-stream and global caps.
    fn enforce_caps(&self, inner: &mut Inner) -> Vec<StoredEvent> {
        let mut evicted = Vec::new();

        for events in inner.streams.values_mut() {
            while events.len() > self.config.max_events_per_stream {
                evicted.push(events.remove(0));
            }
        }
        inner.total = inner.total.saturating_sub(evicted.len());

        while inner.total > self.config.max_events_total {
            let victim_stream = inner
                .streams
                .iter()
                .filter_map(|(id, events)| events.first().map(|e| (id.clone(), e.timestamp)))
                .min_by_key(|(_, ts)| *ts)
                .map(|(id, _)| id);
            let Some(stream_id) = victim_stream else { break };
            if let Some(events) = inner.streams.get_mut(&stream_id) {
                if !events.is_empty() {
                    evicted.push(events.remove(0));
                    inner.total -= 1;
                }
                if events.is_empty() {
                    inner.streams.remove(&stream_id);
                }
            }
        }

        evicted
    }

    fn ttl_cutoff(&self) -> i64 {
        now_ms() - i64::try_from(self.config.ttl.as_millis()).unwrap_or(i64::MAX)
    }

    fn stream_dir(&self, stream_id: &str) -> PathBuf {
        self.config.storage_path.join(stream_id)
    }

    async fn write_event(&self, event: &StoredEvent) -> std::io::Result<()> {
        let dir = self.stream_dir(&event.stream_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}.json", event.event_id));
        let tmp = path.with_extension("tmp");

        let encoded = serde_json::to_vec(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        self.bytes_persisted.fetch_add(encoded.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_file(&self, event: &StoredEvent) {
        let path = self.stream_dir(&event.stream_id).join(format!("{}.json", event.event_id));
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove event file");
            }
        }
    }

    /// Load one stream's events from disk, sorted by timestamp then id.
    async fn load_stream(&self, stream_id: &str) -> Vec<StoredEvent> {
        let dir = self.stream_dir(stream_id);
        let mut events = Vec::new();

        let Ok(mut files) = tokio::fs::read_dir(&dir).await else {
            return events;
        };
        while let Ok(Some(file)) = files.next_entry().await {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<StoredEvent>(&bytes) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt event file");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable event file");
                }
            }
        }

        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.event_id.cmp(&b.event_id)));
        events
    }

    async fn load_all_streams(&self, cutoff: i64) -> Vec<(String, Vec<StoredEvent>)> {
        let mut out = Vec::new();
        let Ok(mut dirs) = tokio::fs::read_dir(&self.config.storage_path).await else {
            return out;
        };
        while let Ok(Some(dir)) = dirs.next_entry().await {
            let Some(stream_id) = dir.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let mut events = self.load_stream(&stream_id).await;
            events.retain(|e| e.timestamp >= cutoff);
            if !events.is_empty() {
                out.push((stream_id, events));
            }
        }
        out
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> EventStoreConfig {
        EventStoreConfig::new(dir.to_path_buf())
    }

    async fn collect_replay(store: &EventStore, last: &str) -> (String, Vec<(String, serde_json::Value)>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let stream = store
            .replay_events_after(
                last,
                move |id, msg| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().await.push((id, msg));
                    }
                },
                None,
            )
            .await;
        let events = seen.lock().await.clone();
        (stream, events)
    }

    #[tokio::test]
    async fn test_store_and_replay_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(test_config(dir.path())).await;

        let e1 = store.store_event("s1", &serde_json::json!({"n": 1}), None).await;
        let _e2 = store.store_event("s1", &serde_json::json!({"n": 2}), None).await;
        let _e3 = store.store_event("s1", &serde_json::json!({"n": 3}), None).await;

        let (stream, events) = collect_replay(&store, &e1).await;
        assert_eq!(stream, "s1");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1["n"], 2);
        assert_eq!(events[1].1["n"], 3);
    }

    #[tokio::test]
    async fn test_event_id_encodes_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(test_config(dir.path())).await;

        let id = store.store_event("stream-a", &serde_json::json!({}), None).await;
        assert_eq!(stream_id_of(&id), Some("stream-a"));
    }

    #[tokio::test]
    async fn test_unknown_event_id_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(test_config(dir.path())).await;

        let (stream, events) = collect_replay(&store, "nosuch_123_abc").await;
        assert_eq!(stream, "");
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_underscore_stream_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(test_config(dir.path())).await;

        let id = store.store_event("bad_stream", &serde_json::json!({}), None).await;
        assert!(id.is_empty());
        assert_eq!(store.stats().await.store_failures, 1);
    }

    #[tokio::test]
    async fn test_per_stream_cap_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_events_per_stream = 3;
        let store = EventStore::open(config).await;

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.store_event("s1", &serde_json::json!({"n": i}), None).await);
        }

        // Oldest two evicted; replay after the third yields the last two.
        let (_, events) = collect_replay(&store, &ids[2]).await;
        assert_eq!(events.len(), 2);

        // Evicted ids no longer resolve.
        let (stream, _) = collect_replay(&store, &ids[0]).await;
        assert_eq!(stream, "");
    }

    #[tokio::test]
    async fn test_sanitization_applied() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(test_config(dir.path())).await;

        let e1 = store.store_event("s1", &serde_json::json!({"marker": 1}), None).await;
        store
            .store_event("s1", &serde_json::json!({"params": {"apiKey": "sk-secret"}}), None)
            .await;

        let (_, events) = collect_replay(&store, &e1).await;
        assert_eq!(events[0].1["params"]["apiKey"], "[REDACTED]");
    }

    #[tokio::test]
    async fn test_encryption_roundtrip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.cipher = Some(
            EventCipher::from_hex(
                "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff",
            )
            .unwrap(),
        );
        let store = EventStore::open(config).await;

        let e1 = store.store_event("s1", &serde_json::json!({"n": 1}), None).await;
        store.store_event("s1", &serde_json::json!({"n": 2}), None).await;

        let (_, events) = collect_replay(&store, &e1).await;
        assert_eq!(events[0].1["n"], 2);
    }

    #[tokio::test]
    async fn test_delete_user_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(test_config(dir.path())).await;

        store.store_event("s1", &serde_json::json!({"n": 1}), Some("alice")).await;
        store.store_event("s1", &serde_json::json!({"n": 2}), Some("bob")).await;
        store.store_event("s2", &serde_json::json!({"n": 3}), Some("alice")).await;

        assert_eq!(store.delete_user_events("alice").await, 2);
        assert_eq!(store.stats().await.total_events, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_reaps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.ttl = Duration::ZERO;
        let store = EventStore::open(config).await;

        store.store_event("s1", &serde_json::json!({"n": 1}), None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_expired().await, 1);
        assert_eq!(store.stats().await.total_events, 0);
    }

    #[tokio::test]
    async fn test_flush_persists_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let e1 = {
            let store = EventStore::open(test_config(dir.path())).await;
            let e1 = store.store_event("s1", &serde_json::json!({"n": 1}), None).await;
            store.store_event("s1", &serde_json::json!({"n": 2}), None).await;
            assert_eq!(store.flush().await, 2);
            e1
        };

        let store = EventStore::open(test_config(dir.path())).await;
        let (stream, events) = collect_replay(&store, &e1).await;
        assert_eq!(stream, "s1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["n"], 2);
    }
}
