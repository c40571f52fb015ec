//! Blocking execution strategy: store calls and waits occupy the calling thread.

use tracing::warn;

use super::backend::{QuotaStore, StoreError};
use super::engine::{eval_error, Admission, AdmissionEngine, CheckRequest};
use super::key::Mode;
use super::limit::LimitSpec;
use super::script::QuotaReply;
use crate::error::Result;

impl<S: QuotaStore> AdmissionEngine<S> {
    /// Admit one call under the engine's default mode.
    ///
    /// In incoming mode a denial fails with `RateLimitExceeded`; in outgoing
    /// mode the thread sleeps until the quota allows the call.
    pub fn check(&self, key: Option<&str>, limit: Option<LimitSpec>) -> Result<Admission> {
        self.check_request(&CheckRequest::with_optional(key, limit))
    }

    /// Admit one call, always waiting out denials.
    pub fn wait(&self, key: Option<&str>, limit: Option<LimitSpec>) -> Result<Admission> {
        self.check_request(&CheckRequest::with_optional(key, limit).mode(Mode::Outgoing))
    }

    /// Admit one call described by `request`.
    pub fn check_request(&self, request: &CheckRequest) -> Result<Admission> {
        let mut pending = self.prepare(request)?;
        loop {
            pending.ensure_active()?;
            let reply = self.evaluate(pending.store_key(), pending.limit())?;
            match pending.record(reply)? {
                None => return Ok(pending.into_admission()),
                Some(delay) => std::thread::sleep(delay),
            }
        }
    }

    /// Evaluate the quota once and report whether the call was admitted.
    ///
    /// No waiting and no error on denial. The key is tagged with the
    /// engine's default mode.
    pub fn try_acquire(&self, key: Option<&str>, limit: Option<LimitSpec>) -> Result<bool> {
        let pending = self.prepare(&CheckRequest::with_optional(key, limit))?;
        let reply = self.evaluate(pending.store_key(), pending.limit())?;
        Ok(reply.allowed)
    }

    /// Run the quota script once, re-registering it if the store forgot it.
    fn evaluate(&self, key: &str, limit: &LimitSpec) -> Result<QuotaReply> {
        let script = self.scripts.ensure_loaded(&self.store)?;
        match self.store.eval_script(&script.handle, key, limit) {
            Err(StoreError::NoScript(_)) => {
                warn!(key = %key, "Quota script missing from store, re-registering");
                self.scripts.invalidate(script.generation);
                let script = self.scripts.ensure_loaded(&self.store)?;
                self.store
                    .eval_script(&script.handle, key, limit)
                    .map_err(eval_error)
            }
            other => other.map_err(eval_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::LimiterConfig;
    use crate::error::RatelimitError;
    use crate::ratelimit::{CallContext, CancellationToken, Key};
    use crate::store::MemoryStore;

    fn fail_fast() -> AdmissionEngine<Arc<MemoryStore>> {
        AdmissionEngine::new(Arc::new(MemoryStore::new()), LimiterConfig::new().with_mode(Mode::Incoming))
    }

    fn blocking() -> AdmissionEngine<Arc<MemoryStore>> {
        AdmissionEngine::new(Arc::new(MemoryStore::new()), LimiterConfig::new())
    }

    #[test]
    fn test_burst_of_limit_then_denied() {
        for requests in [1u64, 3, 5] {
            let engine = fail_fast();
            let limit = LimitSpec::new(requests, Duration::from_secs(10)).unwrap();

            for _ in 0..requests {
                engine.check(Some("burst"), Some(limit)).unwrap();
            }

            let err = engine.check(Some("burst"), Some(limit)).unwrap_err();
            match err {
                RatelimitError::RateLimitExceeded {
                    key,
                    limit: denied_limit,
                    retry_after,
                } => {
                    assert_eq!(key, "incoming:ratelimit-io:burst");
                    assert_eq!(denied_limit, limit);
                    assert!(retry_after > Duration::ZERO);
                    assert!(retry_after <= Duration::from_secs(10));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_window_rollover_admits_again() {
        let engine = fail_fast();
        let limit = LimitSpec::new(2, Duration::from_millis(50)).unwrap();

        engine.check(Some("roll"), Some(limit)).unwrap();
        engine.check(Some("roll"), Some(limit)).unwrap();
        assert!(engine.check(Some("roll"), Some(limit)).is_err());

        std::thread::sleep(Duration::from_millis(70));

        engine.check(Some("roll"), Some(limit)).unwrap();
        engine.check(Some("roll"), Some(limit)).unwrap();
        assert_eq!(engine.store().count(&Key::digest("incoming:ratelimit-io:roll")), Some(2));
    }

    #[test]
    fn test_denials_do_not_consume_quota() {
        let engine = fail_fast();
        let limit = LimitSpec::new(3, Duration::from_secs(10)).unwrap();

        for _ in 0..3 {
            engine.check(Some("poll"), Some(limit)).unwrap();
        }
        for _ in 0..20 {
            assert!(engine.check(Some("poll"), Some(limit)).is_err());
        }

        assert_eq!(engine.store().count(&Key::digest("incoming:ratelimit-io:poll")), Some(3));
    }

    #[test]
    fn test_concurrent_callers_never_exceed_limit() {
        let engine = Arc::new(fail_fast());
        let limit = LimitSpec::new(10, Duration::from_secs(10)).unwrap();
        let allowed = AtomicUsize::new(0);
        let denied = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..25 {
                scope.spawn(|| match engine.check(Some("shared"), Some(limit)) {
                    Ok(_) => {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => {
                        assert!(err.is_rate_limited());
                        denied.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(allowed.load(Ordering::SeqCst), 10);
        assert_eq!(denied.load(Ordering::SeqCst), 15);
        assert_eq!(engine.store().script_loads(), 1);
    }

    #[test]
    fn test_blocking_mode_waits_for_next_window() {
        let engine = blocking();
        let limit = LimitSpec::new(1, Duration::from_secs(1)).unwrap();

        engine.check(Some("slow"), Some(limit)).unwrap();

        let start = Instant::now();
        let admission = engine.check(Some("slow"), Some(limit)).unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(900), "waited only {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2500), "waited {elapsed:?}");
        assert!(admission.attempts >= 2);
        assert!(admission.waited >= Duration::from_millis(900));
        assert!(admission.waited <= elapsed);
    }

    #[test]
    fn test_wait_ignores_fail_fast_default() {
        let engine = fail_fast();
        let limit = LimitSpec::new(1, Duration::from_millis(100)).unwrap();

        engine.wait(Some("w"), Some(limit)).unwrap();
        let admission = engine.wait(Some("w"), Some(limit)).unwrap();

        assert_eq!(admission.key, "outgoing:ratelimit-io:w");
        assert_eq!(admission.mode, Mode::Outgoing);
        assert!(admission.attempts >= 2);
    }

    #[test]
    fn test_modes_use_separate_buckets() {
        let engine = blocking();
        let limit = LimitSpec::new(1, Duration::from_secs(10)).unwrap();

        engine.check(Some("api"), Some(limit)).unwrap();
        let incoming = CheckRequest::new().key("api").limit(limit).mode(Mode::Incoming);
        engine.check_request(&incoming).unwrap();

        assert!(engine.check_request(&incoming).is_err());
        assert_eq!(engine.store().count(&Key::digest("outgoing:ratelimit-io:api")), Some(1));
        assert_eq!(engine.store().count(&Key::digest("incoming:ratelimit-io:api")), Some(1));
    }

    #[test]
    fn test_context_key_is_used() {
        let engine = fail_fast();
        let limit = LimitSpec::new(1, Duration::from_secs(10)).unwrap();
        let request = CheckRequest::new()
            .limit(limit)
            .context(CallContext::new().with_caller_addr("10.0.0.7"));

        let admission = engine.check_request(&request).unwrap();
        assert_eq!(admission.key, "incoming:ratelimit-io:10.0.0.7");
    }

    #[test]
    fn test_buckets_are_stored_under_digest() {
        let engine = fail_fast();
        let limit = LimitSpec::new(2, Duration::from_secs(10)).unwrap();
        let raw = "https://api.example.com/v1/items?page=1";

        let admission = engine.check(Some(raw), Some(limit)).unwrap();
        assert_eq!(admission.key, format!("incoming:ratelimit-io:{raw}"));

        let stored = Key::digest(&admission.key);
        assert_eq!(stored.len(), 64);
        assert_eq!(engine.store().count(&stored), Some(1));
        assert_eq!(engine.store().count(&admission.key), None);

        engine.check(Some(raw), Some(limit)).unwrap();
        match engine.check(Some(raw), Some(limit)).unwrap_err() {
            RatelimitError::RateLimitExceeded { key, .. } => assert_eq!(key, admission.key),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_longest_window_is_accepted_by_store() {
        let engine = fail_fast();
        let limit = LimitSpec::new(1, crate::ratelimit::MAX_WINDOW).unwrap();

        engine.check(Some("forever"), Some(limit)).unwrap();
        let err = engine.check(Some("forever"), Some(limit)).unwrap_err();
        assert!(err.retry_after().unwrap() > Duration::from_secs(u32::MAX as u64 - 60));
    }

    #[test]
    fn test_survives_script_flush() {
        let engine = fail_fast();
        let limit = LimitSpec::new(5, Duration::from_secs(10)).unwrap();

        engine.check(Some("flush"), Some(limit)).unwrap();
        engine.store().flush_scripts();

        let admission = engine.check(Some("flush"), Some(limit)).unwrap();
        assert_eq!(admission.attempts, 1);
        assert_eq!(engine.store().script_loads(), 2);
        assert_eq!(engine.store().count(&Key::digest("incoming:ratelimit-io:flush")), Some(2));
    }

    #[test]
    fn test_try_acquire() {
        let engine = blocking();
        let limit = LimitSpec::new(1, Duration::from_secs(10)).unwrap();

        assert!(engine.try_acquire(Some("once"), Some(limit)).unwrap());
        assert!(!engine.try_acquire(Some("once"), Some(limit)).unwrap());
    }

    #[test]
    fn test_backend_failure_propagates() {
        let engine = fail_fast();
        let limit = LimitSpec::new(1, Duration::from_secs(10)).unwrap();

        engine.check(Some("down"), Some(limit)).unwrap();
        engine.store().set_available(false);

        let err = engine.check(Some("down"), Some(limit)).unwrap_err();
        assert!(matches!(err, RatelimitError::BackendUnavailable(_)));
    }

    #[test]
    fn test_missing_limit_fails_before_store() {
        let engine = blocking();
        let err = engine.check(Some("nolimit"), None).unwrap_err();

        assert!(matches!(err, RatelimitError::MissingLimit { .. }));
        assert_eq!(engine.store().script_loads(), 0);
    }

    #[test]
    fn test_cancel_stops_waiting() {
        let engine = blocking();
        let limit = LimitSpec::new(1, Duration::from_millis(200)).unwrap();
        let token = CancellationToken::new();

        engine.check(Some("cancel"), Some(limit)).unwrap();

        let request = CheckRequest::new()
            .key("cancel")
            .limit(limit)
            .cancel_token(token.clone());
        let err = std::thread::scope(|scope| {
            let waiter = scope.spawn(|| engine.check_request(&request));
            std::thread::sleep(Duration::from_millis(50));
            token.cancel();
            waiter.join().unwrap()
        })
        .unwrap_err();

        assert!(matches!(err, RatelimitError::Cancelled { .. }));
    }
}
