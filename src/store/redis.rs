//! Redis driver.
//!
//! The whole decision runs as one Lua script, so Redis executes it without
//! interleaving any other command: no client-side locking, and no race on a
//! key's first use because `SET` creates the key implicitly.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    ensure_not_cancelled, into_reservation, run_cancellable, ClockSource, Decision, Driver,
    ReserveRequest, Reservation, MAX_MICROS,
};

/// Passed as `now` to ask the script to read the Redis clock.
const USE_STORE_CLOCK: i64 = 0;

const STATUS_OK: i64 = 0;
const STATUS_REJECTED: i64 = -1;
const STATUS_INVALID_PARAMETERS: i64 = -2;

/// KEYS[1] = key
/// ARGV = duration per token, burst, tokens, now (0 = use TIME), max future
/// reserve, largest admissible instant
/// All times are microseconds. Returns {status, time_to_act, now}.
const RESERVE_SCRIPT: &str = r#"
local key = KEYS[1]
local duration_per_token = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local tokens = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local max_future_reserve = tonumber(ARGV[5])
local max_instant = tonumber(ARGV[6])

if not duration_per_token or not burst or not tokens or not now or not max_future_reserve
	or not max_instant
	or duration_per_token <= 0 or burst <= 0 or tokens <= 0 or tokens > burst
	or now < 0 or max_future_reserve < 0 then
	return {-2, 0, 0}
end

if now == 0 then
	local t = redis.call('TIME')
	now = tonumber(t[1]) * 1000000 + tonumber(t[2])
end

if now + max_future_reserve > max_instant then
	return {-2, 0, 0}
end

local reset_value = now - burst * duration_per_token
local time_base = tonumber(redis.call('GET', key))
if not time_base or time_base < reset_value then
	time_base = reset_value
end

local time_to_act = time_base + tokens * duration_per_token
if time_to_act > now + max_future_reserve then
	return {-1, time_to_act, now}
end

redis.call('SET', key, string.format('%d', time_to_act))
return {0, time_to_act, now}
"#;

/// A driver that keeps time bases in Redis.
#[derive(Clone)]
pub struct RedisDriver {
    conn: ConnectionManager,
    script: Script,
    clock: ClockSource,
}

impl RedisDriver {
    /// Create a driver over an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(RESERVE_SCRIPT),
            clock: ClockSource::Authoritative,
        }
    }

    /// Connect to `url` and create a driver.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| TollgateError::connect("Redis", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TollgateError::connect("Redis", e))?;
        Ok(Self::new(conn))
    }

    /// Replace the clock source.
    pub fn with_clock(self, clock: ClockSource) -> Self {
        Self { clock, ..self }
    }

    /// Load the script into the server cache ahead of the first reservation.
    ///
    /// Optional: invocation falls back to loading it on `NOSCRIPT`.
    pub async fn load_script(&self) -> Result<String> {
        let mut conn = self.conn.clone();
        let sha = self
            .script
            .prepare_invoke()
            .load_async(&mut conn)
            .await
            .map_err(|e| TollgateError::redis("load script", self.script.get_hash(), e))?;
        debug!(sha = %sha, "Rate limit script loaded");
        Ok(sha)
    }

    async fn invoke(&self, key: &str, args: [i64; 6]) -> Result<Vec<i64>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(key);
        for arg in args {
            invocation.arg(arg);
        }
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TollgateError::redis("run script", key, e))
    }
}

impl std::fmt::Debug for RedisDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDriver")
            .field("script", &self.script.get_hash())
            .field("clock", &self.clock)
            .finish()
    }
}

#[async_trait]
impl Driver for RedisDriver {
    #[instrument(skip(self, cancel, request), fields(key = %request.key(), tokens = request.tokens()))]
    async fn reserve(
        &self,
        cancel: &CancellationToken,
        request: ReserveRequest,
    ) -> Result<Reservation> {
        let params = request.schedule_params()?;
        ensure_not_cancelled(cancel, request.key())?;

        let key = request.key();
        let now = match self.clock.resolve(&request) {
            Some(now) => {
                params.horizon(now)?;
                now
            }
            None => USE_STORE_CLOCK,
        };
        let args = [
            params.duration_per_token,
            params.burst,
            params.tokens,
            now,
            params.max_future_reserve,
            MAX_MICROS,
        ];

        let result = run_cancellable(cancel, key, self.invoke(key, args))
            .await
            .inspect_err(|e| {
                if !e.is_cancelled() {
                    warn!(error = %e, "Reservation failed");
                }
            })?;
        let decision = parse_result(key, &result)?;

        debug!(
            ok = decision.ok,
            time_to_act = decision.time_to_act,
            now = decision.now,
            "Reservation decided"
        );

        into_reservation(request, &params, decision)
    }
}

/// Translate the script's `{status, time_to_act, now}` reply.
fn parse_result(key: &str, result: &[i64]) -> Result<Decision> {
    let unexpected = |reason: String| TollgateError::UnexpectedScriptResult {
        key: key.to_string(),
        reason,
    };

    let [status, time_to_act, now] = result else {
        return Err(unexpected(format!("expected 3 elements, got {}", result.len())));
    };

    match *status {
        STATUS_OK | STATUS_REJECTED => Ok(Decision {
            ok: *status == STATUS_OK,
            time_to_act: *time_to_act,
            now: *now,
        }),
        STATUS_INVALID_PARAMETERS => Err(TollgateError::InvalidParameters(format!(
            "rejected by rate limit script for key {key:?}"
        ))),
        other => Err(unexpected(format!("unknown status {other}"))),
    }
}
