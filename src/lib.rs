//! Ratelimit-IO - Distributed Admission Control
//!
//! This crate lets many independent processes share one requests-per-window
//! quota per key through a Redis-compatible store. The check-and-increment
//! runs as a single Lua script inside the store, so callers never need to
//! coordinate with each other. Calls are either rejected immediately
//! (incoming mode) or held until the quota allows them (outgoing mode),
//! from blocking threads or async tasks alike.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::{LimiterConfig, RatelimitIoConfig, StoreConfig};
pub use error::{RatelimitError, Result};
pub use ratelimit::{Admission, AdmissionEngine, CheckRequest, LimitSpec, Mode};
