//! The atomic quota script and its in-process twin.
//!
//! The Lua source is what runs inside Redis. [`QuotaRecord::apply`] is the
//! same fixed-window step written in Rust, used by stores that execute the
//! script themselves instead of shipping it to a server.

use std::fmt;
use std::time::Duration;

/// Lua source of the quota script.
pub const QUOTA_SCRIPT: &str = include_str!("quota.lua");

/// Store-side identifier of a registered script (its SHA1 hex digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    /// Wrap a digest returned by the store.
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// The handle a store derives for the given source.
    pub fn for_source(source: &str) -> Self {
        Self(redis::Script::new(source).get_hash().to_string())
    }

    /// The digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decision returned by one execution of the quota script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaReply {
    /// Whether this call was admitted (and counted).
    pub allowed: bool,
    /// Time until the window closes; zero when admitted.
    pub retry_after: Duration,
}

impl QuotaReply {
    /// An admitted call.
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    /// A denied call.
    pub fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }

    /// Decode the `{allowed, retry_after_ms}` pair the Lua script returns.
    pub fn from_wire(allowed: i64, retry_after_ms: i64) -> Self {
        if allowed == 1 {
            Self::allowed()
        } else {
            Self::denied(Duration::from_millis(retry_after_ms.max(0) as u64))
        }
    }
}

/// One bucket as held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRecord {
    /// Calls admitted in the current window
    pub count: u64,
    /// End of the current window, on the store clock
    pub expires_at: Duration,
}

impl QuotaRecord {
    /// Run one fixed-window step for a bucket.
    ///
    /// `now` is read from the store's clock. Returns the record to persist
    /// and the decision. A denial returns the record unchanged.
    pub fn apply(
        record: Option<QuotaRecord>,
        now: Duration,
        requests: u64,
        window: Duration,
    ) -> (QuotaRecord, QuotaReply) {
        let current = match record {
            Some(record) if record.expires_at > now => record,
            _ => QuotaRecord {
                count: 0,
                expires_at: now.saturating_add(window),
            },
        };

        if current.count < requests {
            let admitted = QuotaRecord {
                count: current.count + 1,
                ..current
            };
            (admitted, QuotaReply::allowed())
        } else {
            let retry_after = current.expires_at.saturating_sub(now);
            (current, QuotaReply::denied(retry_after))
        }
    }

    /// Whether the window has closed at `now`.
    pub fn is_expired(&self, now: Duration) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[test]
    fn test_first_call_opens_window() {
        let now = Duration::from_secs(100);
        let (record, reply) = QuotaRecord::apply(None, now, 3, WINDOW);

        assert!(reply.allowed);
        assert_eq!(record.count, 1);
        assert_eq!(record.expires_at, Duration::from_secs(110));
    }

    #[test]
    fn test_boundary_is_inclusive_of_limit() {
        let now = Duration::from_secs(0);
        let mut record = None;
        for _ in 0..3 {
            let (next, reply) = QuotaRecord::apply(record, now, 3, WINDOW);
            assert!(reply.allowed);
            record = Some(next);
        }

        let (after, reply) = QuotaRecord::apply(record, Duration::from_secs(4), 3, WINDOW);
        assert!(!reply.allowed);
        assert_eq!(reply.retry_after, Duration::from_secs(6));
        assert_eq!(after.count, 3);
    }

    #[test]
    fn test_denial_does_not_consume_quota() {
        let full = QuotaRecord {
            count: 2,
            expires_at: Duration::from_secs(10),
        };
        for second in 1..5 {
            let (record, reply) = QuotaRecord::apply(Some(full), Duration::from_secs(second), 2, WINDOW);
            assert!(!reply.allowed);
            assert_eq!(record, full);
        }
    }

    #[test]
    fn test_expired_window_resets() {
        let full = QuotaRecord {
            count: 2,
            expires_at: Duration::from_secs(10),
        };
        assert!(full.is_expired(Duration::from_secs(10)));

        let (record, reply) = QuotaRecord::apply(Some(full), Duration::from_secs(12), 2, WINDOW);
        assert!(reply.allowed);
        assert_eq!(record.count, 1);
        assert_eq!(record.expires_at, Duration::from_secs(22));
    }

    #[test]
    fn test_huge_window_does_not_overflow_clock() {
        let now = Duration::from_secs(100);
        let (record, reply) = QuotaRecord::apply(None, now, 1, Duration::MAX);

        assert!(reply.allowed);
        assert_eq!(record.expires_at, Duration::MAX);

        let (_, reply) = QuotaRecord::apply(Some(record), now, 1, Duration::MAX);
        assert!(!reply.allowed);
        assert_eq!(reply.retry_after, Duration::MAX - now);
    }

    #[test]
    fn test_wire_decoding() {
        assert_eq!(QuotaReply::from_wire(1, 0), QuotaReply::allowed());
        assert_eq!(
            QuotaReply::from_wire(0, 1500),
            QuotaReply::denied(Duration::from_millis(1500))
        );
        assert_eq!(QuotaReply::from_wire(0, -3), QuotaReply::denied(Duration::ZERO));
    }

    #[test]
    fn test_handle_matches_redis_digest() {
        let handle = ScriptHandle::for_source(QUOTA_SCRIPT);
        assert_eq!(handle.as_str().len(), 40);
        assert_eq!(handle, ScriptHandle::for_source(QUOTA_SCRIPT));
    }
}
