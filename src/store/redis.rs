//! Redis-backed quota stores.
//!
//! The quota script is registered with `SCRIPT LOAD` and executed with
//! `EVALSHA`, so each admission check is a single atomic round trip.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Cmd, Connection, ErrorKind, RedisError};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{RatelimitError, Result};
use crate::ratelimit::{AsyncQuotaStore, LimitSpec, QuotaReply, QuotaStore, ScriptHandle, StoreError};

fn open_client(url: &str) -> Result<Client> {
    Client::open(url).map_err(|e| RatelimitError::Config(format!("invalid store url {url}: {e}")))
}

fn script_load(source: &str) -> Cmd {
    let mut cmd = ::redis::cmd("SCRIPT");
    cmd.arg("LOAD").arg(source);
    cmd
}

fn evalsha(handle: &ScriptHandle, key: &str, limit: &LimitSpec) -> Cmd {
    let mut cmd = ::redis::cmd("EVALSHA");
    cmd.arg(handle.as_str())
        .arg(1)
        .arg(key)
        .arg(limit.requests())
        .arg(limit.window_millis());
    cmd
}

fn store_error(err: RedisError, handle: Option<&ScriptHandle>) -> StoreError {
    match handle {
        Some(handle) if err.kind() == ErrorKind::NoScriptError => StoreError::NoScript(handle.clone()),
        _ if is_transport_error(&err) => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Rejected(err.to_string()),
    }
}

fn is_transport_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout()
}

/// Applies the response timeout to every pooled connection handed out.
#[derive(Debug)]
struct ResponseTimeout(Duration);

impl r2d2::CustomizeConnection<Connection, RedisError> for ResponseTimeout {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), RedisError> {
        conn.set_read_timeout(Some(self.0))?;
        conn.set_write_timeout(Some(self.0))
    }
}

/// A Redis store used through blocking round trips.
///
/// Each call checks a connection out of a pool, so callers on different
/// threads talk to the store in parallel; the script itself is the only
/// point where they are serialized. Connections are opened lazily and a
/// connection that saw a transport error is discarded by the pool.
pub struct RedisStore {
    pool: r2d2::Pool<Client>,
}

impl RedisStore {
    /// Create a store for `url` with default pool size and timeouts.
    pub fn open(url: &str) -> Result<Self> {
        Self::from_config(&StoreConfig {
            url: url.to_string(),
            ..StoreConfig::default()
        })
    }

    /// Create a store from configuration. No connection is made until the first call.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let client = open_client(&config.url)?;
        let pool = r2d2::Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(0))
            .test_on_check_out(false)
            .connection_timeout(config.connect_timeout())
            .connection_customizer(Box::new(ResponseTimeout(config.response_timeout())))
            .build_unchecked(client);
        debug!(
            pool_size = config.pool_size,
            connect_timeout_ms = config.connect_timeout_ms,
            response_timeout_ms = config.response_timeout_ms,
            "Created blocking store pool"
        );
        Ok(Self { pool })
    }

    fn with_connection<T>(
        &self,
        handle: Option<&ScriptHandle>,
        run: impl FnOnce(&mut Connection) -> std::result::Result<T, RedisError>,
    ) -> std::result::Result<T, StoreError> {
        let mut connection = self
            .pool
            .get()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        run(&mut connection).map_err(|err| store_error(err, handle))
    }
}

impl QuotaStore for RedisStore {
    fn load_script(&self, source: &str) -> std::result::Result<ScriptHandle, StoreError> {
        let digest: String = self.with_connection(None, |conn| script_load(source).query(conn))?;
        Ok(ScriptHandle::new(digest))
    }

    fn eval_script(
        &self,
        handle: &ScriptHandle,
        key: &str,
        limit: &LimitSpec,
    ) -> std::result::Result<QuotaReply, StoreError> {
        let (allowed, retry_after_ms): (i64, i64) =
            self.with_connection(Some(handle), |conn| evalsha(handle, key, limit).query(conn))?;
        Ok(QuotaReply::from_wire(allowed, retry_after_ms))
    }
}

/// A Redis store used through non-blocking round trips.
///
/// Wraps a multiplexed connection, which is cheap to clone and safe to use
/// from many tasks at once.
#[derive(Clone)]
pub struct AsyncRedisStore {
    connection: MultiplexedConnection,
}

impl AsyncRedisStore {
    /// Connect to the store at `url` with default timeouts.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(&StoreConfig {
            url: url.to_string(),
            ..StoreConfig::default()
        })
        .await
    }

    /// Connect using the given configuration.
    ///
    /// Requests that get no response within the response timeout fail as
    /// unavailable instead of hanging.
    pub async fn connect_with(config: &StoreConfig) -> Result<Self> {
        let client = open_client(&config.url)?;
        let connection = client
            .get_multiplexed_async_connection_with_timeouts(
                config.response_timeout(),
                config.connect_timeout(),
            )
            .await
            .map_err(|e| RatelimitError::BackendUnavailable(e.to_string()))?;
        info!(url = %config.url, "Connected to quota store");
        Ok(Self { connection })
    }

    /// Wrap an existing multiplexed connection.
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl AsyncQuotaStore for AsyncRedisStore {
    async fn load_script(&self, source: &str) -> std::result::Result<ScriptHandle, StoreError> {
        let mut conn = self.connection.clone();
        let digest: String = script_load(source)
            .query_async(&mut conn)
            .await
            .map_err(|err| store_error(err, None))?;
        Ok(ScriptHandle::new(digest))
    }

    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        key: &str,
        limit: &LimitSpec,
    ) -> std::result::Result<QuotaReply, StoreError> {
        let mut conn = self.connection.clone();
        let (allowed, retry_after_ms): (i64, i64) = evalsha(handle, key, limit)
            .query_async(&mut conn)
            .await
            .map_err(|err| store_error(err, Some(handle)))?;
        Ok(QuotaReply::from_wire(allowed, retry_after_ms))
    }
}
