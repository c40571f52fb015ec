//! Quota definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RatelimitError, Result};

/// Longest accepted window (about 136 years).
///
/// Keeps `now + window` representable on the store clock, in Redis
/// `PEXPIRE` as well as in the in-process store.
pub const MAX_WINDOW: Duration = Duration::from_secs(u32::MAX as u64);

/// A requests-per-window quota.
///
/// Both fields are validated on construction, so a `LimitSpec` in hand is
/// always usable. The window is carried to the store in whole milliseconds,
/// which makes one millisecond the shortest accepted window; the longest is
/// [`MAX_WINDOW`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "LimitSpecConfig", into = "LimitSpecConfig")]
pub struct LimitSpec {
    requests: u64,
    window: Duration,
}

impl LimitSpec {
    /// Create a quota of `requests` calls per `window`.
    pub fn new(requests: u64, window: Duration) -> Result<Self> {
        if requests == 0 || window < Duration::from_millis(1) || window > MAX_WINDOW {
            return Err(RatelimitError::InvalidLimit { requests, window });
        }
        Ok(Self { requests, window })
    }

    /// Create a quota whose window is the sum of the given parts.
    ///
    /// At least one part must be non-zero.
    pub fn from_parts(requests: u64, seconds: u64, minutes: u64, hours: u64) -> Result<Self> {
        let total = seconds
            .saturating_add(minutes.saturating_mul(60))
            .saturating_add(hours.saturating_mul(3600));
        Self::new(requests, Duration::from_secs(total))
    }

    /// Create a quota over a fractional number of seconds.
    pub fn from_secs_f64(requests: u64, seconds: f64) -> Result<Self> {
        let window = Duration::try_from_secs_f64(seconds).map_err(|_| {
            RatelimitError::InvalidLimit {
                requests,
                window: Duration::ZERO,
            }
        })?;
        Self::new(requests, window)
    }

    /// Maximum number of admitted calls per window.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Length of the window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in whole milliseconds, as sent to the store.
    pub fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// Window length in seconds.
    pub fn total_seconds(&self) -> f64 {
        self.window.as_secs_f64()
    }
}

impl fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.window.subsec_nanos() == 0 {
            write!(f, "{}/{}s", self.requests, self.window.as_secs())
        } else {
            write!(f, "{}/{}ms", self.requests, self.window.as_millis())
        }
    }
}

/// Serialized form of a [`LimitSpec`]; the window parts add up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSpecConfig {
    /// Maximum requests allowed in the window
    pub requests: u64,
    /// Seconds part of the window (may be fractional)
    #[serde(default)]
    pub seconds: f64,
    /// Minutes part of the window
    #[serde(default)]
    pub minutes: u64,
    /// Hours part of the window
    #[serde(default)]
    pub hours: u64,
}

impl TryFrom<LimitSpecConfig> for LimitSpec {
    type Error = RatelimitError;

    fn try_from(raw: LimitSpecConfig) -> Result<Self> {
        let whole = raw
            .minutes
            .saturating_mul(60)
            .saturating_add(raw.hours.saturating_mul(3600));
        LimitSpec::from_secs_f64(raw.requests, raw.seconds + whole as f64)
    }
}

impl From<LimitSpec> for LimitSpecConfig {
    fn from(limit: LimitSpec) -> Self {
        Self {
            requests: limit.requests,
            seconds: limit.window.as_secs_f64(),
            minutes: 0,
            hours: 0,
        }
    }
}
