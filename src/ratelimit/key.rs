//! Bucket key resolution and mode tagging.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key used when no identifier can be resolved for a call.
pub const FALLBACK_KEY: &str = "unknown_key";

/// Namespace segment shared by every key this crate writes to the store.
pub const KEY_NAMESPACE: &str = "ratelimit-io";

/// How a denial is handled.
///
/// The mode is also part of the store key, so the same logical key is
/// counted separately for incoming and outgoing traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Fail fast: a denial is returned to the caller as an error.
    Incoming,
    /// Block: a denial is waited out and the check is re-issued.
    #[default]
    Outgoing,
}

impl Mode {
    /// The tag used in store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Incoming => "incoming",
            Mode::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "incoming" | "fail-fast" => Ok(Mode::Incoming),
            "outgoing" | "blocking" => Ok(Mode::Outgoing),
            other => Err(format!("unknown mode '{other}', expected 'incoming' or 'outgoing'")),
        }
    }
}

/// Identifiers inferred from the call itself rather than declared by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    caller_addr: Option<String>,
}

impl CallContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the address of the remote caller.
    pub fn with_caller_addr(mut self, addr: impl Into<String>) -> Self {
        self.caller_addr = Some(addr.into());
        self
    }

    /// The remote caller address, if known.
    pub fn caller_addr(&self) -> Option<&str> {
        self.caller_addr.as_deref()
    }

    fn inferred_key(&self) -> Option<&str> {
        self.caller_addr()
    }
}

/// A resolved, not yet mode-tagged, bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(String);

impl Key {
    /// Resolve the bucket key for a call.
    ///
    /// Sources are tried in order: the key provided for this call, the
    /// call site's unique key, the engine default, then the call context.
    /// Empty strings count as absent. If nothing resolves, [`FALLBACK_KEY`]
    /// is used, so resolution never fails.
    pub fn resolve(
        provided_key: Option<&str>,
        unique_key: Option<&str>,
        default_key: Option<&str>,
        context: &CallContext,
    ) -> Self {
        let resolved = [provided_key, unique_key, default_key, context.inferred_key()]
            .into_iter()
            .flatten()
            .find(|candidate| !candidate.is_empty())
            .unwrap_or(FALLBACK_KEY);

        Key(resolved.to_string())
    }

    /// The resolved key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The readable key for this bucket under the given mode.
    pub fn tagged(&self, mode: Mode) -> String {
        format!("{}:{}:{}", mode.as_str(), KEY_NAMESPACE, self.0)
    }

    /// The name of this bucket in the store under the given mode.
    pub fn store_key(&self, mode: Mode) -> String {
        Self::digest(&self.tagged(mode))
    }

    /// SHA-256 hex digest of a tagged key.
    ///
    /// Store keys are always 64 characters, whatever the caller put in the key.
    pub fn digest(tagged: &str) -> String {
        hex::encode(Sha256::digest(tagged.as_bytes()))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
