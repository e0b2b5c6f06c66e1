//! Token bucket
//!
//! Tokens are bytes. Refill is lazy: each call adds `elapsed * rate`, capped
//! at the burst capacity, before looking at the request.

use std::time::Instant;

/// 10 MiB/s
pub const DEFAULT_RATE_BYTES_PER_SEC: u64 = 10 * 1024 * 1024;

/// 50 MiB
pub const DEFAULT_BURST_BYTES: u64 = 50 * 1024 * 1024;

/// Read-only view of a bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateStatus {
    /// Whether at least one byte could be sent right now
    pub allowed: bool,
    pub available_bytes: u64,
    pub limit: u64,
    pub burst_capacity: u64,
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: u64,
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_BYTES_PER_SEC, DEFAULT_BURST_BYTES)
    }
}

impl TokenBucket {
    /// Starts full
    pub fn new(rate: u64, capacity: u64) -> Self {
        Self::new_at(rate, capacity, Instant::now())
    }

    pub fn new_at(rate: u64, capacity: u64, now: Instant) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity as f64);
        self.last_refill = now;
    }

    pub fn try_consume(&mut self, bytes: usize) -> bool {
        self.try_consume_at(bytes, Instant::now())
    }

    /// Deducts only when the whole request fits
    pub fn try_consume_at(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        let bytes = bytes as f64;
        if bytes <= self.tokens {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    pub fn set_limit(&mut self, bytes_per_sec: u64) {
        self.set_limit_at(bytes_per_sec, Instant::now())
    }

    /// Time already elapsed is credited at the old rate
    pub fn set_limit_at(&mut self, bytes_per_sec: u64, now: Instant) {
        self.refill(now);
        self.rate = bytes_per_sec;
    }

    pub fn status(&self) -> RateStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> RateStatus {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity as f64);
        RateStatus {
            allowed: tokens >= 1.0,
            available_bytes: tokens as u64,
            limit: self.rate,
            burst_capacity: self.capacity,
        }
    }

    pub fn limit(&self) -> u64 {
        self.rate
    }
}
