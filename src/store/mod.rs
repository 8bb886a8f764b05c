//! Storage drivers.
//!
//! [`SqlDriver`] and [`RedisDriver`] keep the per-key time base in a shared
//! store so independent processes agree on every decision.
//! [`MemoryDriver`] is for tests and single-process use.

mod memory;
mod redis;
mod sql;

pub use self::memory::MemoryDriver;
pub use self::redis::RedisDriver;
pub use self::sql::{AfterRead, SqlDriver, DEFAULT_TABLE};
