//! Rate limiter facade over a storage driver.

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::driver::Driver;
use super::request::{AllowRequest, ReserveRequest, Reservation};
use crate::error::Result;

/// The rate limiter handed to request-handling code.
///
/// It wraps exactly one [`Driver`] and holds no per-key state of its own, so
/// it is cheap to share across tasks.
pub struct RateLimiter<D: Driver = Box<dyn Driver>> {
    driver: D,
}

impl<D: Driver> RateLimiter<D> {
    /// Create a rate limiter backed by `driver`.
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    /// The driver behind this limiter.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Reserve tokens, possibly for a point in the future.
    pub async fn reserve(
        &self,
        cancel: &CancellationToken,
        request: ReserveRequest,
    ) -> Result<Reservation> {
        self.driver.reserve(cancel, request).await
    }

    /// Whether `tokens` can be taken right now without waiting.
    #[instrument(skip(self, cancel, request), fields(key = %request.key()))]
    pub async fn allow(&self, cancel: &CancellationToken, request: AllowRequest) -> Result<bool> {
        let reservation = self.reserve(cancel, request.into()).await?;
        debug!(ok = reservation.is_ok(), "Allow decision made");
        Ok(reservation.is_ok())
    }
}
