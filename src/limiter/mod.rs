//! Rate and connection limiting
//!
//! - `TokenBucket`: per-session byte budget, owned by the session and
//!   mutated under the session lock
//! - `ConnectionLimiter`: per-user cap on concurrent sessions

mod connection;
mod rate;

pub use connection::{ConnectionLimiter, DEFAULT_MAX_CONNECTIONS_PER_USER};
pub use rate::{RateStatus, TokenBucket, DEFAULT_BURST_BYTES, DEFAULT_RATE_BYTES_PER_SEC};
