//! Send jitter and cover-traffic scheduling
//!
//! Nothing here sleeps. The session pipeline asks for a delay and the I/O
//! loop that owns the socket waits it out before sending.

use rand::Rng;
use std::time::Duration;

/// Jitter range and dummy-traffic interval for one session
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub enabled: bool,
    pub min_jitter_ms: u64,
    pub max_jitter_ms: u64,
    /// Mean gap between dummy packets in milliseconds; 0 disables them
    pub dummy_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::jitter(1, 20)
    }
}

impl TimingConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            min_jitter_ms: 0,
            max_jitter_ms: 0,
            dummy_interval_ms: 0,
        }
    }

    /// Jitter between `min_ms` and `max_ms` with no dummy traffic
    pub fn jitter(min_ms: u64, max_ms: u64) -> Self {
        Self {
            enabled: true,
            min_jitter_ms: min_ms,
            max_jitter_ms: max_ms.max(min_ms),
            dummy_interval_ms: 0,
        }
    }

    pub fn with_dummy_interval(mut self, interval: Duration) -> Self {
        self.dummy_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Draws per-packet delays from a [`TimingConfig`]
#[derive(Debug, Clone)]
pub struct TimingObfuscator {
    config: TimingConfig,
}

impl TimingObfuscator {
    pub fn new(config: TimingConfig) -> Self {
        Self { config }
    }

    /// Uniform delay to hold a data packet back; zero when jitter is off
    pub fn random_jitter(&self) -> Duration {
        let TimingConfig {
            enabled,
            min_jitter_ms,
            max_jitter_ms,
            ..
        } = self.config;
        if !enabled || max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min_jitter_ms..=max_jitter_ms))
    }

    pub fn dummy_enabled(&self) -> bool {
        self.config.enabled && self.config.dummy_interval_ms > 0
    }

    /// Wait before the next dummy packet: 50% to 150% of the mean interval
    pub fn next_dummy_delay(&self) -> Option<Duration> {
        if !self.dummy_enabled() {
            return None;
        }
        let mean = self.config.dummy_interval_ms;
        let ms = rand::thread_rng().gen_range(mean / 2..=mean + mean / 2);
        Some(Duration::from_millis(ms.max(1)))
    }
}
