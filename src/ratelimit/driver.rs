//! Storage driver trait shared by every backend.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::request::{ReserveRequest, Reservation};
use super::schedule::{Decision, ScheduleParams};
use crate::error::{Result, TollgateError};

/// A storage backend that can atomically reserve tokens for a key.
///
/// Implementations must validate the request before any I/O, check
/// `cancel` before the storage round trip, apply the schedule model, persist
/// the new time base only when the request is admitted, and report the
/// `now` they actually decided at.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Attempt a reservation.
    async fn reserve(
        &self,
        cancel: &CancellationToken,
        request: ReserveRequest,
    ) -> Result<Reservation>;
}

#[async_trait]
impl<D: Driver + ?Sized> Driver for Box<D> {
    async fn reserve(
        &self,
        cancel: &CancellationToken,
        request: ReserveRequest,
    ) -> Result<Reservation> {
        (**self).reserve(cancel, request).await
    }
}

#[async_trait]
impl<D: Driver + ?Sized> Driver for Arc<D> {
    async fn reserve(
        &self,
        cancel: &CancellationToken,
        request: ReserveRequest,
    ) -> Result<Reservation> {
        (**self).reserve(cancel, request).await
    }
}

/// Fail fast if the caller already cancelled.
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken, key: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(TollgateError::Cancelled {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Run a storage round trip, abandoning it if the caller cancels first.
///
/// Dropping the in-flight future is best effort: the store may or may not
/// have applied the write.
pub(crate) async fn run_cancellable<T, F>(cancel: &CancellationToken, key: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TollgateError::Cancelled {
            key: key.to_string(),
        }),
        res = fut => res,
    }
}

/// Turn a model decision into a reservation, treating an unrepresentable
/// instant as invalid input.
pub(crate) fn into_reservation(
    request: ReserveRequest,
    params: &ScheduleParams,
    decision: Decision,
) -> Result<Reservation> {
    let key = request.key().to_string();
    Reservation::from_decision(request, params, decision).ok_or_else(|| {
        TollgateError::InvalidParameters(format!(
            "time to act {}µs for key {key:?} is out of range",
            decision.time_to_act
        ))
    })
}
