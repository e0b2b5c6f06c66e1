//! Server-side per-client session

use super::{Pipeline, SecureChannel, SessionError};
use crate::crypto::KeyPair;
use crate::limiter::TokenBucket;
use crate::mode::VpnMode;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Id allocated, no key yet
    AwaitingHandshake,
    /// Key derived, waiting for the client's confirmation
    KeyDerived,
    Active,
    /// Rekey in flight; data is dropped until it completes
    Rekeying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingHandshake => "awaiting_handshake",
            SessionState::KeyDerived => "key_derived",
            SessionState::Active => "active",
            SessionState::Rekeying => "rekeying",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Server half of an in-flight rekey
#[derive(Debug)]
pub struct PendingRekey {
    pub keypair: KeyPair,
    pub salt: [u8; 32],
    pub started: Instant,
    pub attempts: u32,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Disconnect,
    Timeout,
    DecryptFailures,
    AuthFailed,
    Shutdown,
}

/// Per-client cryptographic and accounting state
#[derive(Debug)]
pub struct Session {
    pub id: u32,
    pub peer: SocketAddr,
    pub state: SessionState,
    pub mode: VpnMode,
    pub username: Option<String>,
    pub vpn_address: Option<Ipv4Addr>,
    pub pipeline: Pipeline,
    pub(crate) channel: Option<SecureChannel>,
    pub(crate) pending_rekey: Option<PendingRekey>,
    pub bucket: TokenBucket,
    pub bytes_since_rekey: u64,
    pub packets_since_rekey: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rekey_count: u32,
    pub decrypt_failures: u32,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub last_rekey: Instant,
}

impl Session {
    pub fn new_at(
        id: u32,
        peer: SocketAddr,
        mode: VpnMode,
        pipeline: Pipeline,
        bucket: TokenBucket,
        now: Instant,
    ) -> Self {
        Self {
            id,
            peer,
            state: SessionState::AwaitingHandshake,
            mode,
            username: None,
            vpn_address: None,
            pipeline,
            channel: None,
            pending_rekey: None,
            bucket,
            bytes_since_rekey: 0,
            packets_since_rekey: 0,
            bytes_sent: 0,
            bytes_received: 0,
            rekey_count: 0,
            decrypt_failures: 0,
            created_at: now,
            last_activity: now,
            last_rekey: now,
        }
    }

    /// Install the first key: AwaitingHandshake -> KeyDerived
    pub fn derive_key(&mut self, channel: SecureChannel, now: Instant) -> Result<(), SessionError> {
        self.expect_state(SessionState::AwaitingHandshake)?;
        self.channel = Some(channel);
        self.last_rekey = now;
        self.state = SessionState::KeyDerived;
        Ok(())
    }

    /// Client confirmed the key: KeyDerived -> Active
    pub fn activate(&mut self, now: Instant) -> Result<(), SessionError> {
        self.expect_state(SessionState::KeyDerived)?;
        self.state = SessionState::Active;
        self.last_activity = now;
        Ok(())
    }

    /// Active -> Rekeying
    pub fn begin_rekey(&mut self, pending: PendingRekey) -> Result<(), SessionError> {
        self.expect_state(SessionState::Active)?;
        self.pending_rekey = Some(pending);
        self.state = SessionState::Rekeying;
        Ok(())
    }

    /// Swap in the new channel and reset per-key counters: Rekeying -> Active
    pub fn complete_rekey(&mut self, channel: SecureChannel, now: Instant) -> Result<(), SessionError> {
        self.expect_state(SessionState::Rekeying)?;
        self.channel = Some(channel);
        self.pending_rekey = None;
        self.bytes_since_rekey = 0;
        self.packets_since_rekey = 0;
        self.decrypt_failures = 0;
        self.rekey_count += 1;
        self.last_rekey = now;
        self.state = SessionState::Active;
        Ok(())
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.channel = None;
        self.pending_rekey = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    pub fn channel_mut(&mut self) -> Result<&mut SecureChannel, SessionError> {
        self.channel.as_mut().ok_or(SessionError::NoKey)
    }

    pub fn channel(&self) -> Option<&SecureChannel> {
        self.channel.as_ref()
    }

    pub fn pending_rekey(&self) -> Option<&PendingRekey> {
        self.pending_rekey.as_ref()
    }

    /// Count plaintext bytes in either direction toward the rekey threshold
    pub fn record_traffic(&mut self, bytes: usize, outbound: bool, now: Instant) {
        self.bytes_since_rekey += bytes as u64;
        self.packets_since_rekey += 1;
        if outbound {
            self.bytes_sent += bytes as u64;
        } else {
            self.bytes_received += bytes as u64;
            self.last_activity = now;
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Returns the consecutive failure count
    pub fn record_decrypt_failure(&mut self) -> u32 {
        self.decrypt_failures += 1;
        self.decrypt_failures
    }

    pub fn clear_decrypt_failures(&mut self) {
        self.decrypt_failures = 0;
    }

    /// Byte threshold or key age reached
    pub fn needs_rekey_at(&self, now: Instant) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        let features = self.pipeline.features();
        self.bytes_since_rekey >= features.rekey_interval_bytes
            || now.saturating_duration_since(self.last_rekey) >= features.rekey_interval
    }

    pub fn is_expired_at(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compressor;
    use crate::crypto::{CipherSuite, SessionCipher};
    use std::sync::Arc;

    fn session(mode: VpnMode, now: Instant) -> Session {
        let pipeline = Pipeline::new(*mode.config(), 1500, Arc::new(Compressor::default()));
        Session::new_at(
            42,
            "127.0.0.1:9000".parse().unwrap(),
            mode,
            pipeline,
            TokenBucket::default(),
            now,
        )
    }

    fn channel() -> SecureChannel {
        SecureChannel::new(42, SessionCipher::new(CipherSuite::default(), &[1u8; 32]).unwrap())
    }

    fn pending(now: Instant) -> PendingRekey {
        PendingRekey {
            keypair: KeyPair::generate(),
            salt: [0u8; 32],
            started: now,
            attempts: 1,
        }
    }

    #[test]
    fn test_lifecycle() {
        let now = Instant::now();
        let mut s = session(VpnMode::Normal, now);
        assert_eq!(s.state, SessionState::AwaitingHandshake);

        // Cannot activate before a key exists
        assert!(s.activate(now).is_err());

        s.derive_key(channel(), now).unwrap();
        assert_eq!(s.state, SessionState::KeyDerived);
        s.activate(now).unwrap();
        assert_eq!(s.state, SessionState::Active);

        s.begin_rekey(pending(now)).unwrap();
        assert_eq!(s.state, SessionState::Rekeying);
        assert!(s.begin_rekey(pending(now)).is_err());

        s.complete_rekey(channel(), now).unwrap();
        assert_eq!(s.state, SessionState::Active);
        assert_eq!(s.rekey_count, 1);

        s.close();
        assert!(s.is_closed());
        assert!(s.channel().is_none());
    }

    #[test]
    fn test_rekey_thresholds() {
        let now = Instant::now();
        let mut s = session(VpnMode::FullGhost, now);
        s.derive_key(channel(), now).unwrap();
        s.activate(now).unwrap();

        let threshold = VpnMode::FullGhost.config().rekey_interval_bytes;
        s.record_traffic((threshold - 1) as usize, false, now);
        assert!(!s.needs_rekey_at(now));
        s.record_traffic(1, true, now);
        assert!(s.needs_rekey_at(now));

        let mut t = session(VpnMode::FullGhost, now);
        t.derive_key(channel(), now).unwrap();
        t.activate(now).unwrap();
        assert!(!t.needs_rekey_at(now + Duration::from_secs(899)));
        assert!(t.needs_rekey_at(now + Duration::from_secs(900)));
    }

    #[test]
    fn test_rekey_resets_counters() {
        let now = Instant::now();
        let mut s = session(VpnMode::SemiGhost, now);
        s.derive_key(channel(), now).unwrap();
        s.activate(now).unwrap();
        s.record_traffic(500, false, now);
        s.record_decrypt_failure();

        s.begin_rekey(pending(now)).unwrap();
        let later = now + Duration::from_secs(5);
        s.complete_rekey(channel(), later).unwrap();

        assert_eq!(s.bytes_since_rekey, 0);
        assert_eq!(s.decrypt_failures, 0);
        assert_eq!(s.bytes_received, 500);
        assert_eq!(s.last_rekey, later);
    }

    #[test]
    fn test_expiry() {
        let now = Instant::now();
        let mut s = session(VpnMode::Normal, now);
        let timeout = Duration::from_secs(120);
        assert!(!s.is_expired_at(now + Duration::from_secs(119), timeout));
        assert!(s.is_expired_at(now + Duration::from_secs(120), timeout));

        s.touch(now + Duration::from_secs(100));
        assert!(!s.is_expired_at(now + Duration::from_secs(200), timeout));
    }
}
