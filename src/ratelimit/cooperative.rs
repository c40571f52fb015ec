//! Cooperative execution strategy: store calls are awaited and waits yield to the scheduler.
//!
//! Dropping one of these futures (e.g. via `tokio::time::timeout`) abandons
//! the wait as well. A [`CancellationToken`](super::CancellationToken) passed
//! with the request ends a wait the moment it fires.

use tracing::warn;

use super::backend::{AsyncQuotaStore, StoreError};
use super::engine::{eval_error, Admission, AdmissionEngine, CheckRequest};
use super::key::Mode;
use super::limit::LimitSpec;
use super::script::QuotaReply;
use crate::error::Result;

impl<S: AsyncQuotaStore> AdmissionEngine<S> {
    /// Admit one call under the engine's default mode.
    pub async fn check_async(&self, key: Option<&str>, limit: Option<LimitSpec>) -> Result<Admission> {
        self.check_request_async(&CheckRequest::with_optional(key, limit))
            .await
    }

    /// Admit one call, always waiting out denials.
    pub async fn wait_async(&self, key: Option<&str>, limit: Option<LimitSpec>) -> Result<Admission> {
        self.check_request_async(&CheckRequest::with_optional(key, limit).mode(Mode::Outgoing))
            .await
    }

    /// Admit one call described by `request`.
    pub async fn check_request_async(&self, request: &CheckRequest) -> Result<Admission> {
        let mut pending = self.prepare(request)?;
        loop {
            pending.ensure_active()?;
            let reply = self.evaluate_async(pending.store_key(), pending.limit()).await?;
            let Some(delay) = pending.record(reply)? else {
                return Ok(pending.into_admission());
            };
            match pending.cancellation() {
                Some(token) => tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {}
                },
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Evaluate the quota once and report whether the call was admitted.
    pub async fn try_acquire_async(&self, key: Option<&str>, limit: Option<LimitSpec>) -> Result<bool> {
        let pending = self.prepare(&CheckRequest::with_optional(key, limit))?;
        let reply = self.evaluate_async(pending.store_key(), pending.limit()).await?;
        Ok(reply.allowed)
    }

    async fn evaluate_async(&self, key: &str, limit: &LimitSpec) -> Result<QuotaReply> {
        let script = self.scripts.ensure_loaded_async(&self.store).await?;
        match self.store.eval_script(&script.handle, key, limit).await {
            Err(StoreError::NoScript(_)) => {
                warn!(key = %key, "Quota script missing from store, re-registering");
                self.scripts.invalidate(script.generation);
                let script = self.scripts.ensure_loaded_async(&self.store).await?;
                self.store
                    .eval_script(&script.handle, key, limit)
                    .await
                    .map_err(eval_error)
            }
            other => other.map_err(eval_error),
        }
    }
}
