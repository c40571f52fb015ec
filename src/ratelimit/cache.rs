//! Client-side cache of the registered quota script.

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use super::backend::{AsyncQuotaStore, QuotaStore, StoreError};
use super::script::{ScriptHandle, QUOTA_SCRIPT};
use crate::error::{RatelimitError, Result};

/// A handle together with the registration it came from.
///
/// The generation lets a caller that saw `NOSCRIPT` invalidate exactly the
/// registration it used, without clearing one a concurrent caller has
/// already renewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedScript {
    /// Store-side handle of the script
    pub handle: ScriptHandle,
    /// Registration counter at the time this handle was cached
    pub generation: u64,
}

#[derive(Debug)]
enum Slot {
    Cold,
    Loading,
    Ready(CachedScript),
}

#[derive(Debug)]
struct CacheState {
    slot: Slot,
    generation: u64,
}

/// Registers the quota script with a store at most once until invalidated.
///
/// Blocking and cooperative callers share one slot. The first caller to
/// find it cold registers the script; everyone else, from either side,
/// waits for that registration to settle (threads on a condition variable,
/// tasks on a [`Notify`]) instead of issuing their own `SCRIPT LOAD`.
///
/// A blocking caller running on an async worker thread can stall that
/// worker while a task registers, so blocking entry points belong on
/// ordinary threads.
pub struct ScriptCache {
    source: &'static str,
    state: Mutex<CacheState>,
    settled: Condvar,
    settled_async: Notify,
}

impl ScriptCache {
    /// A cold cache for the quota script.
    pub fn new() -> Self {
        Self::with_source(QUOTA_SCRIPT)
    }

    /// A cold cache for an arbitrary script source.
    pub fn with_source(source: &'static str) -> Self {
        Self {
            source,
            state: Mutex::new(CacheState {
                slot: Slot::Cold,
                generation: 0,
            }),
            settled: Condvar::new(),
            settled_async: Notify::new(),
        }
    }

    /// The currently cached registration, if any.
    pub fn cached(&self) -> Option<CachedScript> {
        match &self.state.lock().slot {
            Slot::Ready(cached) => Some(cached.clone()),
            _ => None,
        }
    }

    /// Return the cached handle, registering the script through a blocking store if needed.
    pub fn ensure_loaded<S: QuotaStore + ?Sized>(&self, store: &S) -> Result<CachedScript> {
        {
            let mut state = self.state.lock();
            loop {
                match &state.slot {
                    Slot::Ready(cached) => return Ok(cached.clone()),
                    Slot::Loading => self.settled.wait(&mut state),
                    Slot::Cold => break,
                }
            }
            state.slot = Slot::Loading;
        }

        let registration = Registration::new(self);
        registration.finish(store.load_script(self.source))
    }

    /// Return the cached handle, registering the script through a non-blocking store if needed.
    ///
    /// Dropping the future mid-registration hands the slot back, so a later
    /// caller registers instead.
    pub async fn ensure_loaded_async<S: AsyncQuotaStore + ?Sized>(
        &self,
        store: &S,
    ) -> Result<CachedScript> {
        loop {
            let notified = self.settled_async.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                match &state.slot {
                    Slot::Ready(cached) => return Ok(cached.clone()),
                    Slot::Cold => {
                        state.slot = Slot::Loading;
                        break;
                    }
                    Slot::Loading => {}
                }
            }

            notified.await;
        }

        let registration = Registration::new(self);
        registration.finish(store.load_script(self.source).await)
    }

    /// Drop the cached handle if it still belongs to `generation`.
    pub fn invalidate(&self, generation: u64) {
        let mut state = self.state.lock();
        if matches!(&state.slot, Slot::Ready(cached) if cached.generation == generation) {
            warn!(generation, "Store no longer knows the quota script, invalidating cached handle");
            state.slot = Slot::Cold;
        }
    }

    fn release(&self) {
        self.state.lock().slot = Slot::Cold;
        self.wake();
    }

    fn wake(&self) {
        self.settled.notify_all();
        self.settled_async.notify_waiters();
    }
}

impl Default for ScriptCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership of the `Loading` slot; releases it on drop if never finished.
struct Registration<'a> {
    cache: &'a ScriptCache,
    finished: bool,
}

impl<'a> Registration<'a> {
    fn new(cache: &'a ScriptCache) -> Self {
        Self {
            cache,
            finished: false,
        }
    }

    fn finish(mut self, loaded: std::result::Result<ScriptHandle, StoreError>) -> Result<CachedScript> {
        self.finished = true;
        match loaded {
            Ok(handle) => {
                let cached = {
                    let mut state = self.cache.state.lock();
                    state.generation += 1;
                    let cached = CachedScript {
                        handle,
                        generation: state.generation,
                    };
                    state.slot = Slot::Ready(cached.clone());
                    cached
                };
                self.cache.wake();
                debug!(handle = %cached.handle, generation = cached.generation, "Registered quota script");
                Ok(cached)
            }
            Err(err) => {
                self.cache.release();
                Err(load_error(err))
            }
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Quota script registration abandoned");
            self.cache.release();
        }
    }
}

fn load_error(err: StoreError) -> RatelimitError {
    error!(error = %err, "Failed to register quota script");
    match err {
        StoreError::Unavailable(reason) => RatelimitError::BackendUnavailable(reason),
        other => RatelimitError::ScriptLoad(other.to_string()),
    }
}
