//! Admission control: quota definitions, key resolution, the quota script and the engine.

mod backend;
mod blocking;
mod cache;
mod cooperative;
mod engine;
mod key;
mod limit;
mod script;

pub use backend::{AsyncQuotaStore, QuotaStore, StoreError};
pub use cache::{CachedScript, ScriptCache};
pub use engine::{Admission, AdmissionEngine, CheckRequest, Step};
pub use key::{CallContext, Key, Mode, FALLBACK_KEY, KEY_NAMESPACE};
pub use limit::{LimitSpec, LimitSpecConfig, MAX_WINDOW};
pub use script::{QuotaRecord, QuotaReply, ScriptHandle, QUOTA_SCRIPT};
pub use tokio_util::sync::CancellationToken;
