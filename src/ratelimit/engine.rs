//! Admission engine shared by the blocking and cooperative facades.
//!
//! Everything that decides *whether* a call is admitted lives here: key and
//! limit resolution, the NOSCRIPT recovery rule, error mapping and the
//! allow / wait / reject policy. The facades only differ in how they call
//! the store and how they sleep.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::backend::StoreError;
use super::cache::ScriptCache;
use super::key::{CallContext, Key, Mode};
use super::limit::LimitSpec;
use super::script::QuotaReply;
use crate::config::LimiterConfig;
use crate::error::{RatelimitError, Result};

/// Shortest pause between a denial and the next evaluation.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Everything a caller can say about one admission check.
#[derive(Debug, Clone, Default)]
pub struct CheckRequest {
    key: Option<String>,
    unique_key: Option<String>,
    limit: Option<LimitSpec>,
    mode: Option<Mode>,
    context: CallContext,
    cancel: Option<CancellationToken>,
}

impl CheckRequest {
    /// A request relying entirely on engine defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Key supplied explicitly for this call.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Key declared by the call site (e.g. the wrapped function).
    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Limit for this call, overriding the engine default.
    pub fn limit(mut self, limit: LimitSpec) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Mode for this call, overriding the engine default.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Identifiers inferred from the call.
    pub fn context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }

    /// Token used to abandon a blocking-mode wait.
    ///
    /// It is checked before every evaluation of the quota; cooperative
    /// waits also end as soon as it fires.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn with_optional(key: Option<&str>, limit: Option<LimitSpec>) -> Self {
        Self {
            key: key.map(str::to_string),
            limit,
            ..Self::default()
        }
    }
}

/// A granted admission.
///
/// The quota unit it consumed is not refunded if the caller discards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// The store key that was charged
    pub key: String,
    /// The limit that was enforced
    pub limit: LimitSpec,
    /// The mode the call ran under
    pub mode: Mode,
    /// Number of quota evaluations, including the admitting one
    pub attempts: u32,
    /// Time spent between the first evaluation and admission
    pub waited: Duration,
}

/// What to do with a quota reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The call is admitted.
    Admit,
    /// Sleep this long, then evaluate again.
    Wait(Duration),
    /// Fail the call; the window closes after this long.
    Reject(Duration),
}

impl Step {
    /// Apply the mode's policy to a reply.
    pub fn decide(mode: Mode, reply: QuotaReply) -> Self {
        if reply.allowed {
            return Step::Admit;
        }
        match mode {
            Mode::Incoming => Step::Reject(reply.retry_after),
            Mode::Outgoing => Step::Wait(reply.retry_after.max(MIN_RETRY_DELAY)),
        }
    }
}

/// One call in flight: resolved key, limit and mode plus wait bookkeeping.
///
/// `key` is the readable tagged key reported to callers; `store_key` is its
/// digest, the name the bucket actually has in the store.
#[derive(Debug)]
pub(crate) struct PendingCheck {
    key: String,
    store_key: String,
    limit: LimitSpec,
    mode: Mode,
    cancel: Option<CancellationToken>,
    attempts: u32,
    started: Instant,
}

impl PendingCheck {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn store_key(&self) -> &str {
        &self.store_key
    }

    pub(crate) fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub(crate) fn limit(&self) -> &LimitSpec {
        &self.limit
    }

    /// Fail if the caller cancelled; called before every evaluation.
    pub(crate) fn ensure_active(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => {
                debug!(key = %self.key, attempts = self.attempts, "Wait cancelled by caller");
                Err(RatelimitError::Cancelled {
                    key: self.key.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Record a reply. `Ok(None)` means admitted, `Ok(Some(delay))` means wait.
    pub(crate) fn record(&mut self, reply: QuotaReply) -> Result<Option<Duration>> {
        self.attempts += 1;

        trace!(
            key = %self.key,
            limit = %self.limit,
            mode = %self.mode,
            allowed = reply.allowed,
            attempt = self.attempts,
            "Evaluated quota"
        );

        match Step::decide(self.mode, reply) {
            Step::Admit => Ok(None),
            Step::Wait(delay) => {
                debug!(
                    key = %self.key,
                    retry_after_ms = delay.as_millis() as u64,
                    "Quota exhausted, waiting for the window to roll over"
                );
                Ok(Some(delay))
            }
            Step::Reject(retry_after) => {
                debug!(
                    key = %self.key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Err(RatelimitError::RateLimitExceeded {
                    key: self.key.clone(),
                    limit: self.limit,
                    retry_after,
                })
            }
        }
    }

    pub(crate) fn into_admission(self) -> Admission {
        Admission {
            key: self.key,
            limit: self.limit,
            mode: self.mode,
            attempts: self.attempts,
            waited: self.started.elapsed(),
        }
    }
}

/// Shared admission engine.
///
/// Holds the store handle, the immutable defaults and the script cache.
/// It keeps no per-call state, so one instance (typically behind an `Arc`)
/// serves every caller. Blocking operations are available when `S` is a
/// [`QuotaStore`](super::QuotaStore), cooperative ones (`*_async`) when it
/// is an [`AsyncQuotaStore`](super::AsyncQuotaStore).
pub struct AdmissionEngine<S> {
    pub(crate) store: S,
    pub(crate) scripts: ScriptCache,
    config: LimiterConfig,
}

impl<S> AdmissionEngine<S> {
    /// Create an engine over `store` with the given defaults.
    pub fn new(store: S, config: LimiterConfig) -> Self {
        Self {
            store,
            scripts: ScriptCache::new(),
            config,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The engine defaults.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// The script cache.
    pub fn scripts(&self) -> &ScriptCache {
        &self.scripts
    }

    /// Resolve key, mode and limit for a call without touching the store.
    pub(crate) fn prepare(&self, request: &CheckRequest) -> Result<PendingCheck> {
        let mode = request.mode.unwrap_or(self.config.mode);
        let resolved = Key::resolve(
            request.key.as_deref(),
            request.unique_key.as_deref(),
            self.config.default_key.as_deref(),
            &request.context,
        );
        let key = resolved.tagged(mode);

        let limit = request
            .limit
            .or(self.config.default_limit)
            .ok_or_else(|| RatelimitError::MissingLimit { key: key.clone() })?;

        Ok(PendingCheck {
            store_key: Key::digest(&key),
            key,
            limit,
            mode,
            cancel: request.cancel.clone(),
            attempts: 0,
            started: Instant::now(),
        })
    }
}

/// Map a failed script execution onto the public error taxonomy.
pub(crate) fn eval_error(err: StoreError) -> RatelimitError {
    match err {
        StoreError::Unavailable(reason) => RatelimitError::BackendUnavailable(reason),
        StoreError::NoScript(handle) => RatelimitError::ScriptLoad(format!(
            "store lost script {handle} immediately after registration"
        )),
        StoreError::Rejected(reason) => RatelimitError::ScriptLoad(reason),
    }
}
