//! Admission algorithm and the driver abstraction.

mod clock;
mod driver;
mod limiter;
mod request;
mod schedule;

pub use clock::ClockSource;
pub use driver::Driver;
pub use limiter::RateLimiter;
pub use request::{AllowRequest, ReserveRequest, Reservation};
pub use schedule::{Decision, ScheduleParams, MAX_MICROS};

pub(crate) use driver::{ensure_not_cancelled, into_reservation, run_cancellable};
pub(crate) use request::from_micros;
