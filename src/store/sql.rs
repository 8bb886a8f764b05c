//! PostgreSQL driver.
//!
//! Each key is one row `(key, value)` where `value` is the time base as a
//! decimal count of microseconds since the Unix epoch. A reservation runs in
//! a single transaction:
//!
//! 1. lock the key's row (`FOR UPDATE`) and read `clock_timestamp()` in the
//!    same statement;
//! 2. insert the row at the reset value if it does not exist yet, otherwise
//!    clamp the stored value to the reset floor;
//! 3. write `time_to_act` back only if the request is admitted, then commit.
//!
//! Two first-time reservations for the same key can both miss the lock and
//! race on the insert. The loser gets a unique violation, rolls back and
//! retries once, at which point the row exists and the lock serializes it.
//!
//! Only PostgreSQL is supported.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    ensure_not_cancelled, into_reservation, run_cancellable, ClockSource, Decision, Driver,
    ReserveRequest, Reservation, ScheduleParams,
};

/// Table used when none is configured.
pub const DEFAULT_TABLE: &str = "kvs";

/// Retries allowed after losing the first-insert race.
const DUPLICATE_KEY_RETRIES: usize = 1;

/// Callback run inside the transaction right after the locked read. The
/// argument says whether the key's row already existed.
pub type AfterRead = Arc<dyn Fn(bool) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A driver that keeps time bases in a PostgreSQL table.
#[derive(Clone)]
pub struct SqlDriver {
    pool: PgPool,
    table: String,
    clock: ClockSource,
    after_read: Option<AfterRead>,
    lock_query: String,
    insert_query: String,
    update_query: String,
}

impl SqlDriver {
    /// Create a driver over the default table. The table must already exist;
    /// see [`SqlDriver::ensure_schema`].
    pub fn new(pool: PgPool) -> Self {
        Self::build(pool, DEFAULT_TABLE.to_string(), ClockSource::Authoritative)
    }

    /// Use `table` instead of the default. The name must be a plain SQL
    /// identifier (letters, digits and underscores, not starting with a digit).
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_identifier(&table) {
            return Err(TollgateError::Config(format!(
                "invalid table name {table:?}"
            )));
        }
        Ok(Self::build(pool, table, ClockSource::Authoritative))
    }

    /// Replace the clock source.
    pub fn with_clock(self, clock: ClockSource) -> Self {
        Self { clock, ..self }
    }

    /// Run `hook` after every locked read, while the transaction is open.
    ///
    /// Used to line up concurrent transactions deterministically, e.g. to
    /// hold two first-time reservations between the read and the insert.
    pub fn with_after_read(self, hook: AfterRead) -> Self {
        Self {
            after_read: Some(hook),
            ..self
        }
    }

    fn build(pool: PgPool, table: String, clock: ClockSource) -> Self {
        // The CTE takes the row lock; the LEFT JOIN against a one-row dummy
        // keeps the statement returning exactly one row (carrying the store
        // clock) even when the key does not exist yet.
        let lock_query = format!(
            "WITH kv_select AS (SELECT key, value FROM {table} WHERE key = $1 FOR UPDATE) \
             SELECT kv.value, clock_timestamp() AS now \
             FROM (SELECT 1) AS dummy LEFT JOIN kv_select AS kv ON kv.key = $1"
        );
        let insert_query = format!("INSERT INTO {table} (key, value) VALUES ($1, $2)");
        let update_query = format!("UPDATE {table} SET value = $2 WHERE key = $1");

        Self {
            pool,
            table,
            clock,
            after_read: None,
            lock_query,
            insert_query,
            update_query,
        }
    }

    /// The table this driver reads and writes.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)",
            self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| TollgateError::sql("create table", &self.table, e))?;
        debug!(table = %self.table, "Rate limit table ready");
        Ok(())
    }

    /// One transactional attempt.
    async fn attempt(&self, key: &str, explicit_now: Option<i64>, params: &ScheduleParams) -> Result<Decision> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TollgateError::sql("begin transaction", key, e))?;

        let (value, store_now): (Option<String>, DateTime<Utc>) = sqlx::query_as(&self.lock_query)
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| TollgateError::sql("lock row", key, e))?;

        trace!(value = ?value, store_now = %store_now, "Locked time base row");

        if let Some(hook) = &self.after_read {
            hook(value.is_some()).await;
        }

        let now = explicit_now.unwrap_or_else(|| store_now.timestamp_micros());

        let decision = match value {
            None => {
                let decision = params.evaluate(now, None)?;
                self.insert(&mut tx, key, params.reset_value(now)?).await?;
                decision
            }
            Some(value) => {
                let base = value.trim().parse::<i64>().map_err(|_| {
                    TollgateError::CorruptTimeBase {
                        key: key.to_string(),
                        value: value.clone(),
                    }
                })?;
                params.evaluate(now, Some(base))?
            }
        };

        if decision.ok {
            sqlx::query(&self.update_query)
                .bind(key)
                .bind(decision.time_to_act.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| TollgateError::sql("save time to act", key, e))?;
        }

        // a rejection still commits, to release the row lock promptly
        tx.commit()
            .await
            .map_err(|e| TollgateError::sql("commit", key, e))?;

        Ok(decision)
    }

    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, key: &str, time_base: i64) -> Result<()> {
        sqlx::query(&self.insert_query)
            .bind(key)
            .bind(time_base.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| TollgateError::sql("create row", key, e))?;
        Ok(())
    }
}

#[async_trait]
impl Driver for SqlDriver {
    #[instrument(skip(self, cancel, request), fields(key = %request.key(), tokens = request.tokens()))]
    async fn reserve(
        &self,
        cancel: &CancellationToken,
        request: ReserveRequest,
    ) -> Result<Reservation> {
        let params = request.schedule_params()?;
        ensure_not_cancelled(cancel, request.key())?;

        let key = request.key();
        let explicit_now = self.clock.resolve(&request);

        let mut retries = 0;
        let decision = loop {
            match run_cancellable(cancel, key, self.attempt(key, explicit_now, &params)).await {
                Err(e) if e.is_unique_violation() && retries < DUPLICATE_KEY_RETRIES => {
                    retries += 1;
                    debug!("Lost first-insert race, retrying");
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Reservation failed");
                    }
                    return Err(e);
                }
                Ok(decision) => break decision,
            }
        };

        debug!(
            ok = decision.ok,
            time_to_act = decision.time_to_act,
            now = decision.now,
            "Reservation decided"
        );

        into_reservation(request, &params, decision)
    }
}

impl std::fmt::Debug for SqlDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlDriver")
            .field("pool", &self.pool)
            .field("table", &self.table)
            .field("clock", &self.clock)
            .field("after_read", &self.after_read.is_some())
            .finish()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
