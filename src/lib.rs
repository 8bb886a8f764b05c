//! Tollgate - Distributed GCRA Rate Limiting
//!
//! This crate decides whether a request for a key may proceed now, or exactly
//! when it may, by keeping a single virtual-schedule instant per key in a
//! shared store. PostgreSQL (row locks) and Redis (an atomic Lua script)
//! backends give every process the same decision for the same key.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use tollgate::ratelimit::{RateLimiter, ReserveRequest};
//! use tollgate::store::RedisDriver;
//!
//! # async fn run() -> tollgate::error::Result<()> {
//! let limiter = RateLimiter::new(RedisDriver::connect("redis://127.0.0.1/").await?);
//! let cancel = CancellationToken::new();
//!
//! let request = ReserveRequest::new("user:42", Duration::from_secs(1), 10, 1);
//! let reservation = limiter.reserve(&cancel, request).await?;
//! if reservation.is_ok() {
//!     tokio::time::sleep(reservation.delay_from(reservation.now())).await;
//! } else {
//!     println!("retry in {:?}", reservation.retry_after_from(reservation.now()));
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
