//! Where a driver takes `now` from.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::request::ReserveRequest;

type NowFn = dyn Fn() -> DateTime<Utc> + Send + Sync;

/// Clock source configured on a driver.
///
/// In production leave this as [`ClockSource::Authoritative`] so every
/// process reads the backing store's clock. [`ClockSource::Injected`] is for
/// deterministic tests only.
#[derive(Clone, Default)]
pub enum ClockSource {
    /// Use the backing store's own clock.
    #[default]
    Authoritative,
    /// Use the supplied function instead of the store clock.
    Injected(Arc<NowFn>),
}

impl ClockSource {
    /// Inject a clock function.
    pub fn injected<F>(now: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        ClockSource::Injected(Arc::new(now))
    }

    /// Inject a clock frozen at `now`.
    pub fn fixed(now: DateTime<Utc>) -> Self {
        Self::injected(move || now)
    }

    /// The `now` to decide at, in microseconds, or `None` to use store time.
    ///
    /// An explicit request `now` wins over an injected clock.
    pub(crate) fn resolve(&self, request: &ReserveRequest) -> Option<i64> {
        request.now_micros().or_else(|| match self {
            ClockSource::Authoritative => None,
            ClockSource::Injected(now) => Some(now().timestamp_micros()),
        })
    }
}

impl fmt::Debug for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockSource::Authoritative => f.write_str("Authoritative"),
            ClockSource::Injected(_) => f.write_str("Injected(..)"),
        }
    }
}
