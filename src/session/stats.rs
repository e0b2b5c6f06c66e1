//! Aggregate connection statistics and health
//!
//! Counters are server-wide only. Nothing here is keyed by user or peer.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connection errors above this mark the server degraded
pub const ERROR_THRESHOLD: u64 = 100;

#[derive(Debug)]
pub struct ConnectionStats {
    started: Instant,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    connection_errors: AtomicU64,
    replays_blocked: AtomicU64,
    rate_limit_hits: AtomicU64,
    handshakes_dropped: AtomicU64,
    rekeys: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub uptime_human: String,
    pub total_connections: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub connection_errors: u64,
    pub replays_blocked: u64,
    pub rate_limit_hits: u64,
    pub handshakes_dropped: u64,
    pub rekeys: u64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            replays_blocked: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            handshakes_dropped: AtomicU64::new(0),
            rekeys: AtomicU64::new(0),
        }
    }

    pub fn record_connection(&self) {
        bump(&self.total_connections);
        bump(&self.active_connections);
    }

    pub fn record_disconnection(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        bump(&self.packets_sent);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        bump(&self.packets_received);
    }

    pub fn record_error(&self) {
        bump(&self.connection_errors);
    }

    pub fn record_replay_blocked(&self) {
        bump(&self.replays_blocked);
    }

    pub fn record_rate_limit_hit(&self) {
        bump(&self.rate_limit_hits);
    }

    pub fn record_handshake_dropped(&self) {
        bump(&self.handshakes_dropped);
    }

    pub fn record_rekey(&self) {
        bump(&self.rekeys);
    }

    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime = self.uptime();
        StatsSnapshot {
            uptime_secs: uptime.as_secs(),
            uptime_human: format_uptime(uptime),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            connection_errors: self.connection_errors(),
            replays_blocked: self.replays_blocked.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            handshakes_dropped: self.handshakes_dropped.load(Ordering::Relaxed),
            rekeys: self.rekeys.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter except active connections
    pub fn reset(&self) {
        for counter in [
            &self.total_connections,
            &self.bytes_sent,
            &self.bytes_received,
            &self.packets_sent,
            &self.packets_received,
            &self.connection_errors,
            &self.replays_blocked,
            &self.rate_limit_hits,
            &self.handshakes_dropped,
            &self.rekeys,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// `3d 4h 5m`, `4h 5m 6s`, `5m 6s` or `6s`
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (days, hours, minutes, seconds) = (secs / 86400, secs % 86400 / 3600, secs % 3600 / 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Degraded => f.write_str("degraded"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub warnings: Vec<String>,
    pub metrics: StatsSnapshot,
}

/// Derives a health verdict from the counters and table occupancy
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    error_threshold: u64,
    max_clients: usize,
}

impl HealthMonitor {
    pub fn new(max_clients: usize) -> Self {
        Self {
            error_threshold: ERROR_THRESHOLD,
            max_clients,
        }
    }

    pub fn check(&self, stats: &ConnectionStats, sessions: usize) -> HealthReport {
        let mut warnings = Vec::new();

        let errors = stats.connection_errors();
        if errors > self.error_threshold {
            warnings.push(format!("High error rate: {errors} errors"));
        }
        if sessions >= self.max_clients {
            warnings.push(format!("Session table full: {sessions}/{}", self.max_clients));
        }

        HealthReport {
            status: if warnings.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            warnings,
            metrics: stats.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ConnectionStats::new();
        stats.record_connection();
        stats.record_connection();
        stats.record_disconnection();
        stats.record_sent(100);
        stats.record_received(40);
        stats.record_replay_blocked();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.replays_blocked, 1);
    }

    #[test]
    fn test_active_never_underflows() {
        let stats = ConnectionStats::new();
        stats.record_disconnection();
        assert_eq!(stats.snapshot().active_connections, 0);
    }

    #[test]
    fn test_reset_keeps_active() {
        let stats = ConnectionStats::new();
        stats.record_connection();
        stats.record_error();
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 0);
        assert_eq!(snap.connection_errors, 0);
        assert_eq!(snap.active_connections, 1);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(5)), "5s");
        assert_eq!(format_uptime(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "1h 2m 5s");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 1h 1m");
    }

    #[test]
    fn test_health() {
        let stats = ConnectionStats::new();
        let monitor = HealthMonitor::new(10);
        assert_eq!(monitor.check(&stats, 3).status, HealthStatus::Healthy);

        let full = monitor.check(&stats, 10);
        assert_eq!(full.status, HealthStatus::Degraded);
        assert_eq!(full.warnings.len(), 1);

        for _ in 0..=ERROR_THRESHOLD {
            stats.record_error();
        }
        assert_eq!(monitor.check(&stats, 0).status, HealthStatus::Degraded);
    }
}
