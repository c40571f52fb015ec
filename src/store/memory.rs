//! In-process quota store.
//!
//! Runs the fixed-window step of the quota script under a single mutex
//! against the store's own monotonic clock, and keeps a script registry
//! so that `NOSCRIPT` and flushes behave like a real server.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::ratelimit::{
    AsyncQuotaStore, LimitSpec, QuotaRecord, QuotaReply, QuotaStore, ScriptHandle, StoreError,
    QUOTA_SCRIPT,
};

/// Expired buckets are swept once the table grows past this size.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Default)]
struct MemoryState {
    scripts: HashSet<ScriptHandle>,
    buckets: HashMap<String, QuotaRecord>,
}

/// A quota store living inside the current process.
///
/// Useful for tests and single-process deployments. It implements both the
/// blocking and the non-blocking store traits over the same state.
pub struct MemoryStore {
    origin: Instant,
    state: Mutex<MemoryState>,
    available: AtomicBool,
    script_loads: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            script_loads: AtomicU64::new(0),
        }
    }

    /// Forget every registered script, as `SCRIPT FLUSH` does.
    pub fn flush_scripts(&self) {
        self.state.lock().scripts.clear();
    }

    /// Forget scripts and buckets, as `FLUSHALL` does.
    pub fn flush_all(&self) {
        let mut state = self.state.lock();
        state.scripts.clear();
        state.buckets.clear();
    }

    /// Make every subsequent call fail as if the store were unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of script registrations received so far.
    pub fn script_loads(&self) -> u64 {
        self.script_loads.load(Ordering::SeqCst)
    }

    /// Whether a script handle is currently registered.
    pub fn script_exists(&self, handle: &ScriptHandle) -> bool {
        self.state.lock().scripts.contains(handle)
    }

    /// Admitted calls in the open window of `key`, if it has one.
    pub fn count(&self, key: &str) -> Option<u64> {
        let now = self.now();
        let state = self.state.lock();
        state
            .buckets
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.count)
    }

    /// Remaining lifetime of the window of `key`, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.now();
        let state = self.state.lock();
        state
            .buckets
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.expires_at - now)
    }

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is marked unavailable".to_string()))
        }
    }

    fn register(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        self.check_available()?;
        self.script_loads.fetch_add(1, Ordering::SeqCst);

        if source != QUOTA_SCRIPT {
            return Err(StoreError::Rejected(
                "memory store can only run the quota script".to_string(),
            ));
        }

        let handle = ScriptHandle::for_source(source);
        self.state.lock().scripts.insert(handle.clone());
        Ok(handle)
    }

    fn execute(
        &self,
        handle: &ScriptHandle,
        key: &str,
        limit: &LimitSpec,
    ) -> Result<QuotaReply, StoreError> {
        self.check_available()?;

        let mut state = self.state.lock();
        if !state.scripts.contains(handle) {
            return Err(StoreError::NoScript(handle.clone()));
        }

        let now = self.now();
        if state.buckets.len() > SWEEP_THRESHOLD {
            state.buckets.retain(|_, record| !record.is_expired(now));
        }

        let previous = state.buckets.get(key).copied();
        let (record, reply) = QuotaRecord::apply(previous, now, limit.requests(), limit.window());
        state.buckets.insert(key.to_string(), record);

        trace!(
            key = %key,
            count = record.count,
            allowed = reply.allowed,
            "Evaluated quota in memory store"
        );
        Ok(reply)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaStore for MemoryStore {
    fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        self.register(source)
    }

    fn eval_script(
        &self,
        handle: &ScriptHandle,
        key: &str,
        limit: &LimitSpec,
    ) -> Result<QuotaReply, StoreError> {
        self.execute(handle, key, limit)
    }
}

#[async_trait]
impl AsyncQuotaStore for MemoryStore {
    async fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        self.register(source)
    }

    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        key: &str,
        limit: &LimitSpec,
    ) -> Result<QuotaReply, StoreError> {
        self.execute(handle, key, limit)
    }
}
