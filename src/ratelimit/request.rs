//! Reservation requests and outcomes.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::schedule::{Decision, ScheduleParams};
use crate::error::{Result, TollgateError};

/// A request to reserve `tokens` from the bucket identified by `key`.
///
/// Requests are immutable once built; the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    key: String,
    duration_per_token: Duration,
    burst: u64,
    tokens: u64,
    max_future_reserve: Duration,
    now: Option<DateTime<Utc>>,
}

impl ReserveRequest {
    /// Create a request with no future reservation horizon and no explicit `now`.
    pub fn new(
        key: impl Into<String>,
        duration_per_token: Duration,
        burst: u64,
        tokens: u64,
    ) -> Self {
        Self {
            key: key.into(),
            duration_per_token,
            burst,
            tokens,
            max_future_reserve: Duration::ZERO,
            now: None,
        }
    }

    /// Accept a reservation that only becomes valid up to `max_future_reserve` from now.
    pub fn with_max_future_reserve(mut self, max_future_reserve: Duration) -> Self {
        self.max_future_reserve = max_future_reserve;
        self
    }

    /// Evaluate at `now` instead of the driver's clock.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn duration_per_token(&self) -> Duration {
        self.duration_per_token
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn max_future_reserve(&self) -> Duration {
        self.max_future_reserve
    }

    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.now
    }

    /// Validate the request and convert it to microsecond schedule parameters.
    ///
    /// Every driver calls this before touching storage.
    pub(crate) fn schedule_params(&self) -> Result<ScheduleParams> {
        if self.key.is_empty() {
            return Err(TollgateError::InvalidParameters("key must not be empty".into()));
        }
        if let Some(now) = self.now {
            if now.timestamp_micros() <= 0 {
                return Err(TollgateError::InvalidParameters(format!(
                    "now must be after the Unix epoch, got {now}"
                )));
            }
        }

        ScheduleParams::new(
            micros("duration per token", self.duration_per_token)?,
            count("burst", self.burst)?,
            count("tokens", self.tokens)?,
            micros("max future reserve", self.max_future_reserve)?,
        )
    }

    /// The explicit `now`, truncated to microseconds.
    pub(crate) fn now_micros(&self) -> Option<i64> {
        self.now.map(|now| now.timestamp_micros())
    }
}

fn micros(what: &str, d: Duration) -> Result<i64> {
    i64::try_from(d.as_micros())
        .map_err(|_| TollgateError::InvalidParameters(format!("{what} {d:?} is too large")))
}

fn count(what: &str, n: u64) -> Result<i64> {
    i64::try_from(n).map_err(|_| TollgateError::InvalidParameters(format!("{what} {n} is too large")))
}

/// Convert microseconds since the Unix epoch to an instant.
pub(crate) fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

/// A request that must succeed without waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowRequest {
    key: String,
    duration_per_token: Duration,
    burst: u64,
    tokens: u64,
    now: Option<DateTime<Utc>>,
}

impl AllowRequest {
    pub fn new(
        key: impl Into<String>,
        duration_per_token: Duration,
        burst: u64,
        tokens: u64,
    ) -> Self {
        Self {
            key: key.into(),
            duration_per_token,
            burst,
            tokens,
            now: None,
        }
    }

    /// Evaluate at `now` instead of the driver's clock.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl From<AllowRequest> for ReserveRequest {
    fn from(req: AllowRequest) -> Self {
        ReserveRequest {
            key: req.key,
            duration_per_token: req.duration_per_token,
            burst: req.burst,
            tokens: req.tokens,
            max_future_reserve: Duration::ZERO,
            now: req.now,
        }
    }
}

/// The outcome of one admission decision.
///
/// A rejected reservation is a valid answer, not an error. Use
/// [`delay_from`](Self::delay_from) when it is OK and
/// [`retry_after_from`](Self::retry_after_from) when it is not; calling the
/// other one is a bug and panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    request: ReserveRequest,
    ok: bool,
    time_to_act: DateTime<Utc>,
    now: DateTime<Utc>,
    max_future_reserve: TimeDelta,
}

impl Reservation {
    /// Build a reservation from a model decision. Returns `None` if either
    /// instant falls outside the representable range.
    pub(crate) fn from_decision(
        request: ReserveRequest,
        params: &ScheduleParams,
        decision: Decision,
    ) -> Option<Self> {
        Some(Self {
            request,
            ok: decision.ok,
            time_to_act: from_micros(decision.time_to_act)?,
            now: from_micros(decision.now)?,
            max_future_reserve: TimeDelta::microseconds(params.max_future_reserve),
        })
    }

    /// The request this reservation answers.
    pub fn request(&self) -> &ReserveRequest {
        &self.request
    }

    /// Whether the request was admitted.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// When the reserved tokens may be used (admitted) or the instant the
    /// schedule would have reached (rejected).
    pub fn time_to_act(&self) -> DateTime<Utc> {
        self.time_to_act
    }

    /// The authoritative `now` the decision was made at.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// How long to wait after `t` before acting on an admitted reservation.
    ///
    /// # Panics
    ///
    /// If the reservation was rejected.
    pub fn delay_from(&self, t: DateTime<Utc>) -> Duration {
        if !self.ok {
            panic!("tollgate: cannot get delay from a rejected reservation");
        }
        (self.time_to_act - t).to_std().unwrap_or(Duration::ZERO)
    }

    /// [`delay_from`](Self::delay_from) the local clock.
    pub fn delay(&self) -> Duration {
        self.delay_from(Utc::now())
    }

    /// How long after `t` the same request would be admitted.
    ///
    /// # Panics
    ///
    /// If the reservation was admitted.
    pub fn retry_after_from(&self, t: DateTime<Utc>) -> Duration {
        if self.ok {
            panic!("tollgate: cannot get retry-after from an admitted reservation");
        }
        (self.time_to_act - t - self.max_future_reserve)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// [`retry_after_from`](Self::retry_after_from) the local clock.
    pub fn retry_after(&self) -> Duration {
        self.retry_after_from(Utc::now())
    }
}
