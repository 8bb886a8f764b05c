//! Virtual schedule model (GCRA).
//!
//! A key's only state is its time base: the virtual instant at which the
//! bucket would be empty. Admitting `tokens` moves that instant forward by
//! `tokens * duration_per_token`; idle time is credited by clamping the time
//! base to `now - burst * duration_per_token`, so no background refill is
//! needed. All values are microseconds since the Unix epoch.

use crate::error::{Result, TollgateError};

/// Upper bound for the burst span, the reservation horizon and any instant
/// the model admits, in microseconds (2^53, about 285 years past the epoch).
/// Lua numbers are doubles, so staying below this keeps every driver exact
/// and every admitted instant representable as a `DateTime<Utc>`.
pub const MAX_MICROS: i64 = 1 << 53;

/// Validated parameters for one admission decision, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleParams {
    pub duration_per_token: i64,
    pub burst: i64,
    pub tokens: i64,
    pub max_future_reserve: i64,
    /// `burst * duration_per_token`, checked once at validation.
    pub(crate) burst_span: i64,
}

/// Outcome of applying the model at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted. The stored time base must be set to
    /// `time_to_act` if and only if this is true.
    pub ok: bool,
    pub time_to_act: i64,
    pub now: i64,
}

impl ScheduleParams {
    /// Build parameters, rejecting anything the model cannot evaluate.
    pub fn new(
        duration_per_token: i64,
        burst: i64,
        tokens: i64,
        max_future_reserve: i64,
    ) -> Result<Self> {
        if duration_per_token <= 0 {
            return Err(TollgateError::InvalidParameters(format!(
                "duration per token must be at least 1µs, got {duration_per_token}µs"
            )));
        }
        if burst <= 0 {
            return Err(TollgateError::InvalidParameters(format!(
                "burst must be positive, got {burst}"
            )));
        }
        if tokens <= 0 || tokens > burst {
            return Err(TollgateError::InvalidParameters(format!(
                "tokens must be in 1..={burst}, got {tokens}"
            )));
        }
        if max_future_reserve < 0 {
            return Err(TollgateError::InvalidParameters(format!(
                "max future reserve must not be negative, got {max_future_reserve}µs"
            )));
        }
        let burst_span = burst.checked_mul(duration_per_token).ok_or_else(|| {
            TollgateError::InvalidParameters(format!(
                "burst {burst} x {duration_per_token}µs overflows"
            ))
        })?;
        if burst_span > MAX_MICROS {
            return Err(TollgateError::InvalidParameters(format!(
                "burst {burst} x {duration_per_token}µs exceeds {MAX_MICROS}µs"
            )));
        }
        if max_future_reserve > MAX_MICROS {
            return Err(TollgateError::InvalidParameters(format!(
                "max future reserve {max_future_reserve}µs exceeds {MAX_MICROS}µs"
            )));
        }

        Ok(Self {
            duration_per_token,
            burst,
            tokens,
            max_future_reserve,
            burst_span,
        })
    }

    /// The floor below which a stale time base counts as fully replenished.
    pub fn reset_value(&self, now: i64) -> Result<i64> {
        now.checked_sub(self.burst_span)
            .ok_or_else(|| overflow("reset value", now))
    }

    /// The latest instant an admitted request may act at.
    ///
    /// Fails when it lies past [`MAX_MICROS`], so a decision that could not
    /// be reported is refused before anything is written.
    pub fn horizon(&self, now: i64) -> Result<i64> {
        match now.checked_add(self.max_future_reserve) {
            Some(horizon) if horizon <= MAX_MICROS => Ok(horizon),
            _ => Err(overflow("reserve horizon", now)),
        }
    }

    /// Apply the model to the stored time base (`None` for a key never seen).
    pub fn evaluate(&self, now: i64, base: Option<i64>) -> Result<Decision> {
        let horizon = self.horizon(now)?;
        let reset_value = self.reset_value(now)?;
        let time_base = match base {
            Some(base) => base.max(reset_value),
            None => reset_value,
        };

        // tokens <= burst, so this product cannot overflow once burst_span did not
        let tokens_span = self.tokens * self.duration_per_token;
        let time_to_act = time_base
            .checked_add(tokens_span)
            .ok_or_else(|| overflow("time to act", now))?;

        Ok(Decision {
            ok: time_to_act <= horizon,
            time_to_act,
            now,
        })
    }
}

fn overflow(what: &str, now: i64) -> TollgateError {
    TollgateError::InvalidParameters(format!("{what} out of range at now={now}µs"))
}
