//! Store traits for abstracting the shared counter store.

use async_trait::async_trait;
use thiserror::Error;

use super::limit::LimitSpec;
use super::script::{QuotaReply, ScriptHandle};

/// Failure reported by a store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store does not know the script handle (e.g. after a restart or flush).
    #[error("script {0} is not loaded")]
    NoScript(ScriptHandle),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store was reached but refused the command.
    #[error("store rejected command: {0}")]
    Rejected(String),
}

/// A store reachable through blocking round trips.
pub trait QuotaStore: Send + Sync {
    /// Register a script and return its content-derived handle.
    fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError>;

    /// Run a registered quota script against one bucket.
    fn eval_script(
        &self,
        handle: &ScriptHandle,
        key: &str,
        limit: &LimitSpec,
    ) -> Result<QuotaReply, StoreError>;
}

/// A store reachable through non-blocking round trips.
///
/// Same contract as [`QuotaStore`].
#[async_trait]
pub trait AsyncQuotaStore: Send + Sync {
    /// Register a script and return its content-derived handle.
    async fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError>;

    /// Run a registered quota script against one bucket.
    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        key: &str,
        limit: &LimitSpec,
    ) -> Result<QuotaReply, StoreError>;
}

impl<S: QuotaStore + ?Sized> QuotaStore for std::sync::Arc<S> {
    fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        (**self).load_script(source)
    }

    fn eval_script(
        &self,
        handle: &ScriptHandle,
        key: &str,
        limit: &LimitSpec,
    ) -> Result<QuotaReply, StoreError> {
        (**self).eval_script(handle, key, limit)
    }
}

#[async_trait]
impl<S: AsyncQuotaStore + ?Sized> AsyncQuotaStore for std::sync::Arc<S> {
    async fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        (**self).load_script(source).await
    }

    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        key: &str,
        limit: &LimitSpec,
    ) -> Result<QuotaReply, StoreError> {
        (**self).eval_script(handle, key, limit).await
    }
}
