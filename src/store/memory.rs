//! In-process driver.
//!
//! Keeps time bases in a sharded map and applies the schedule model under the
//! key's shard lock. Decisions are linearizable within one process only; use
//! the SQL or Redis driver when several processes share a key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::ratelimit::{
    ensure_not_cancelled, from_micros, into_reservation, ClockSource, Decision, Driver,
    ReserveRequest, Reservation,
};

/// A driver that stores time bases in memory.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    time_bases: DashMap<String, i64>,
    clock: ClockSource,
}

impl MemoryDriver {
    /// Create an empty driver using the local system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty driver with an explicit clock source.
    pub fn with_clock(clock: ClockSource) -> Self {
        Self {
            time_bases: DashMap::new(),
            clock,
        }
    }

    /// The stored time base for `key`, if the key has been used.
    pub fn time_base(&self, key: &str) -> Option<DateTime<Utc>> {
        self.time_bases.get(key).and_then(|base| from_micros(*base))
    }

    /// Number of keys with a stored time base.
    pub fn key_count(&self) -> usize {
        self.time_bases.len()
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.time_bases.clear();
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    #[instrument(skip(self, cancel, request), fields(key = %request.key(), tokens = request.tokens()))]
    async fn reserve(
        &self,
        cancel: &CancellationToken,
        request: ReserveRequest,
    ) -> Result<Reservation> {
        let params = request.schedule_params()?;
        ensure_not_cancelled(cancel, request.key())?;

        // the local clock stands in for store time here
        let now = self
            .clock
            .resolve(&request)
            .unwrap_or_else(|| Utc::now().timestamp_micros());

        let decision: Decision = match self.time_bases.entry(request.key().to_string()) {
            Entry::Occupied(mut entry) => {
                let decision = params.evaluate(now, Some(*entry.get()))?;
                if decision.ok {
                    entry.insert(decision.time_to_act);
                }
                decision
            }
            Entry::Vacant(entry) => {
                let decision = params.evaluate(now, None)?;
                if decision.ok {
                    entry.insert(decision.time_to_act);
                }
                decision
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_rejection_does_not_write() {
        let driver = MemoryDriver::new();
        let cancel = CancellationToken::new();
        let now = at(1_000_000);

        let req = ReserveRequest::new("k", Duration::from_secs(1), 3, 3).with_now(now);
        assert!(driver.reserve(&cancel, req).await.unwrap().is_ok());
        assert_eq!(driver.time_base("k"), Some(now));

        let req = ReserveRequest::new("k", Duration::from_secs(1), 3, 1).with_now(now);
        let r = driver.reserve(&cancel, req).await.unwrap();
        assert!(!r.is_ok());
        assert_eq!(r.time_to_act(), at(1_000_001));
        assert_eq!(driver.time_base("k"), Some(now));
    }

    #[tokio::test]
    async fn test_cancelled_before_storage() {
        let driver = MemoryDriver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let req = ReserveRequest::new("k", Duration::from_secs(1), 3, 1).with_now(at(100));
        let err = driver.reserve(&cancel, req).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(driver.key_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_parameters_win_over_cancellation() {
        let driver = MemoryDriver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let req = ReserveRequest::new("k", Duration::from_secs(1), 3, 4);
        let err = driver.reserve(&cancel, req).await.unwrap_err();
        assert!(err.is_invalid_parameters());
    }

    #[tokio::test]
    async fn test_injected_clock() {
        let driver = MemoryDriver::with_clock(ClockSource::fixed(at(500)));
        let cancel = CancellationToken::new();

        let req = ReserveRequest::new("k", Duration::from_secs(1), 2, 1);
        let r = driver.reserve(&cancel, req).await.unwrap();
        assert_eq!(r.now(), at(500));
        assert_eq!(r.time_to_act(), at(499));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_exceed_burst() {
        let driver = Arc::new(MemoryDriver::new());
        let now = at(1_000_000);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let driver = driver.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let req = ReserveRequest::new("shared", Duration::from_secs(1), 10, 1).with_now(now);
                driver.reserve(&cancel, req).await.unwrap().is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(driver.time_base("shared"), Some(now));
    }

    #[tokio::test]
    async fn test_clear() {
        let driver = MemoryDriver::new();
        let cancel = CancellationToken::new();

        for key in ["a", "b"] {
            let req = ReserveRequest::new(key, Duration::from_secs(1), 1, 1).with_now(at(10));
            driver.reserve(&cancel, req).await.unwrap();
        }
        assert_eq!(driver.key_count(), 2);

        driver.clear();
        assert_eq!(driver.key_count(), 0);
    }
}
