//! Response cache and in-flight deduplication.
//!
//! Requests hash to a `DedupKey` over `{type, prompt, context}`. A fresh
//! cached response is served directly; otherwise callers with the same key
//! share one in-flight entry and are all answered by its single provider call.
//! Failures are never cached.
//!
//! Lock order: the cache lock is taken before the queue lock. Closures passed
//! to `admit` and `remove_waiter` run while the cache lock is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::ai_queue::clock::Clock;
use crate::ai_queue::error::AiError;
use crate::ai_queue::types::{AiRequest, AiRequestType, AiResponse, Priority};

pub type Outcome = Result<AiResponse, AiError>;

/// Deterministic identity of "the same work".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    pub fn for_request(request: &AiRequest) -> Self {
        Self::compute(request.request_type, &request.prompt, &request.context)
    }

    pub fn compute(request_type: AiRequestType, prompt: &str, context: &Value) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(request_type.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&(prompt.len() as u64).to_le_bytes());
        hasher.update(prompt.as_bytes());

        let mut canonical = String::new();
        write_canonical(context, &mut canonical);
        hasher.update(canonical.as_bytes());

        Self(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

impl fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DedupKey({self})")
    }
}

/// JSON with object keys sorted, so key order never changes the hash.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A caller waiting on an in-flight entry.
#[derive(Debug)]
pub struct Waiter {
    pub request_id: Uuid,
    pub tx: oneshot::Sender<Outcome>,
}

#[derive(Debug)]
struct InFlightEntry {
    leader: Uuid,
    priority: Priority,
    waiters: Vec<Waiter>,
}

#[derive(Debug, Clone)]
struct CachedResponse {
    response: AiResponse,
    stored_at: DateTime<Utc>,
}

/// Result of registering a caller for a key.
#[derive(Debug)]
pub enum Admission {
    /// Served from cache; the caller's waiter was not registered.
    Cached(AiResponse),
    /// Attached to an existing in-flight entry. `raised_to` is set when the
    /// joiner's priority is above the entry's previous priority.
    Joined {
        leader: Uuid,
        raised_to: Option<Priority>,
    },
    /// A new in-flight entry was created with this caller as leader.
    Created,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 1000,
        }
    }
}

#[derive(Default)]
struct CacheState {
    cached: HashMap<DedupKey, CachedResponse>,
    in_flight: HashMap<DedupKey, InFlightEntry>,
}

impl CacheState {
    fn fresh(&mut self, key: &DedupKey, now: DateTime<Utc>, ttl: chrono::Duration) -> Option<AiResponse> {
        match self.cached.get(key) {
            Some(entry) if now < entry.stored_at + ttl => Some(entry.response.clone()),
            Some(_) => {
                self.cached.remove(key);
                None
            }
            None => None,
        }
    }
}

pub struct ResponseCache {
    config: CacheConfig,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let ttl = chrono::Duration::from_std(config.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        Self {
            config,
            ttl,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Fresh cached response for `key`, if any. Submissions go through
    /// `admit`, which does this lookup under the same lock as the join.
    #[cfg(test)]
    pub fn get(&self, key: &DedupKey) -> Option<AiResponse> {
        let now = self.clock.now();
        self.state.lock().fresh(key, now, self.ttl)
    }

    /// Serve from cache, join the in-flight entry, or create one, as a
    /// single atomic step. `create` runs only in the last case; if it fails
    /// no entry is created and the error is returned.
    pub fn admit<F>(
        &self,
        key: DedupKey,
        waiter: Waiter,
        priority: Priority,
        create: F,
    ) -> Result<Admission, AiError>
    where
        F: FnOnce() -> Result<(), AiError>,
    {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(response) = state.fresh(&key, now, self.ttl) {
            return Ok(Admission::Cached(response));
        }

        if let Some(entry) = state.in_flight.get_mut(&key) {
            entry.waiters.push(waiter);
            let raised_to = (priority > entry.priority).then(|| {
                entry.priority = priority;
                priority
            });
            return Ok(Admission::Joined {
                leader: entry.leader,
                raised_to,
            });
        }

        create()?;
        state.in_flight.insert(
            key,
            InFlightEntry {
                leader: waiter.request_id,
                priority,
                waiters: vec![waiter],
            },
        );
        Ok(Admission::Created)
    }

    /// Detach a caller from its in-flight entry. When it was the last waiter,
    /// `unqueue` is asked to pull the entry out of the queue; if that
    /// succeeds the entry is discarded and `true` is returned. An entry that
    /// is already dispatched stays so its result still lands in the cache.
    pub fn remove_waiter<F>(&self, key: &DedupKey, request_id: Uuid, unqueue: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let mut state = self.state.lock();
        let Some(entry) = state.in_flight.get_mut(key) else {
            return false;
        };
        entry.waiters.retain(|w| w.request_id != request_id);
        if !entry.waiters.is_empty() || !unqueue() {
            return false;
        }
        state.in_flight.remove(key);
        debug!(dedup_key = %key, "Discarded in-flight entry with no remaining waiters");
        true
    }

    /// Finish an in-flight entry: cache a success and hand back every waiter.
    pub fn complete(&self, key: &DedupKey, outcome: &Outcome) -> Vec<Waiter> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let waiters = state
            .in_flight
            .remove(key)
            .map(|entry| entry.waiters)
            .unwrap_or_default();

        if let Ok(response) = outcome {
            state.cached.insert(
                *key,
                CachedResponse {
                    response: response.clone(),
                    stored_at: now,
                },
            );
            if state.cached.len() > self.config.max_entries {
                let oldest = state
                    .cached
                    .iter()
                    .min_by_key(|(_, entry)| entry.stored_at)
                    .map(|(k, _)| *k);
                if let Some(oldest) = oldest {
                    state.cached.remove(&oldest);
                }
            }
        }
        waiters
    }

    /// Remove an in-flight entry without caching anything.
    pub fn abandon(&self, key: &DedupKey) -> Vec<Waiter> {
        self.state
            .lock()
            .in_flight
            .remove(key)
            .map(|entry| entry.waiters)
            .unwrap_or_default()
    }

    /// Drop stale responses. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl;
        let mut state = self.state.lock();
        let before = state.cached.len();
        state.cached.retain(|_, entry| now < entry.stored_at + ttl);
        before - state.cached.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().cached.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
