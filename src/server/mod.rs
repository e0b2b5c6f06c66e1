//! Server core
//!
//! A sans-IO packet processor. Every entry point takes bytes plus a clock
//! reading and returns the [`Action`]s the caller has to carry out, so the
//! whole protocol can be driven without sockets. [`Server`] wraps it in a
//! tokio UDP loop.
//!
//! Malformed, unauthenticated or unexpected packets are dropped without a
//! reply. Drops are only visible in the aggregate statistics and at
//! `trace` level.

mod runner;

pub use runner::Server;

use crate::compression::{CompressionStats, Compressor};
use crate::crypto::{
    derive_session_key, derive_shared_secret, generate_salt, CipherSuite, CryptoError, KeyPair, PublicKey,
    SessionCipher, SESSION_INFO,
};
use crate::limiter::{
    ConnectionLimiter, RateStatus, TokenBucket, DEFAULT_BURST_BYTES, DEFAULT_MAX_CONNECTIONS_PER_USER,
    DEFAULT_RATE_BYTES_PER_SEC,
};
use crate::mode::{FeaturePolicy, ModeManager, VpnMode};
use crate::obfuscation::DEFAULT_PADDING_TARGET;
use crate::protocol::{
    HandshakeComplete, HandshakeMessage, HandshakeResponse, Packet, PacketType, ProtocolError, RekeyMessage,
    NO_SESSION,
};
use crate::session::{
    parse_datagram, AddressPool, CloseReason, ConnectionStats, HealthMonitor, HealthReport, Ipv4Net,
    PendingRekey, Pipeline, SecureChannel, Session, SessionError, SessionHandle, SessionState, SessionTable,
    StatsSnapshot, MAX_PLAINTEXT,
};
use crate::users::ClientManager;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Runtime settings of the server core
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub max_clients: usize,
    /// Idle time after which a session is closed
    pub session_timeout: Duration,
    /// Time a session may spend before activation
    pub handshake_timeout: Duration,
    /// Time before an unanswered rekey is sent again
    pub rekey_retry: Duration,
    pub max_rekey_attempts: u32,
    pub max_decrypt_failures: u32,
    pub cipher: CipherSuite,
    pub require_auth: bool,
    pub policy: FeaturePolicy,
    pub padding_target: usize,
    pub allow_unknown_mode: bool,
    pub rate_limiting: bool,
    pub rate_limit: u64,
    pub burst_size: u64,
    pub max_connections_per_user: usize,
    /// Client address pool; `None` disables address assignment
    pub vpn_network: Option<Ipv4Net>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_clients: 1000,
            session_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(10),
            rekey_retry: Duration::from_secs(10),
            max_rekey_attempts: 3,
            max_decrypt_failures: 3,
            cipher: CipherSuite::default(),
            require_auth: false,
            policy: FeaturePolicy::default(),
            padding_target: DEFAULT_PADDING_TARGET,
            allow_unknown_mode: true,
            rate_limiting: true,
            rate_limit: DEFAULT_RATE_BYTES_PER_SEC,
            burst_size: DEFAULT_BURST_BYTES,
            max_connections_per_user: DEFAULT_MAX_CONNECTIONS_PER_USER,
            vpn_network: None,
        }
    }
}

/// Work the caller must perform after feeding the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a datagram, optionally after a timing-obfuscation delay
    Send {
        peer: SocketAddr,
        datagram: Vec<u8>,
        jitter: Duration,
    },
    /// Decrypted tunnel packet for the local tunnel device
    Deliver { session_id: u32, packet: Vec<u8> },
    /// A session finished its handshake
    Activated { session_id: u32, mode: VpnMode },
    /// A session ended
    Closed { session_id: u32, reason: CloseReason },
}

/// IPv4 destination of a raw tunnel packet
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

fn require_state(session: &Session, expected: SessionState) -> Result<(), SessionError> {
    if session.state == expected {
        Ok(())
    } else {
        Err(SessionError::InvalidState {
            expected,
            actual: session.state,
        })
    }
}

#[derive(Debug)]
pub struct ServerCore {
    settings: ServerSettings,
    modes: ModeManager,
    sessions: SessionTable,
    connections: ConnectionLimiter,
    pool: Option<AddressPool>,
    users: Option<Arc<ClientManager>>,
    compressor: Arc<Compressor>,
    stats: ConnectionStats,
    health: HealthMonitor,
}

impl ServerCore {
    pub fn new(settings: ServerSettings, users: Option<Arc<ClientManager>>) -> Self {
        Self {
            modes: ModeManager::new(settings.allow_unknown_mode),
            sessions: SessionTable::new(),
            connections: ConnectionLimiter::new(settings.max_connections_per_user),
            pool: settings.vpn_network.map(AddressPool::new),
            users,
            compressor: Arc::new(Compressor::default()),
            stats: ConnectionStats::new(),
            health: HealthMonitor::new(settings.max_clients),
            settings,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Server's own tunnel address, if a pool is configured
    pub fn server_address(&self) -> Option<Ipv4Addr> {
        self.pool.as_ref().and_then(|pool| pool.server_address())
    }

    pub fn session(&self, session_id: u32) -> Option<SessionHandle> {
        self.sessions.get(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn compression_stats(&self) -> CompressionStats {
        self.compressor.stats()
    }

    pub fn health(&self) -> HealthReport {
        self.health.check(&self.stats, self.sessions.len())
    }

    fn lookup(&self, session_id: u32) -> Result<SessionHandle, SessionError> {
        self.sessions
            .get(session_id)
            .ok_or(SessionError::UnknownSession(session_id))
    }

    pub fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) -> Vec<Action> {
        self.handle_datagram_at(datagram, peer, Instant::now())
    }

    /// Whether handling `datagram` may hash a password. The runner moves
    /// such datagrams off the async workers.
    pub fn verifies_credentials(&self, datagram: &[u8]) -> bool {
        self.users.is_some()
            && matches!(
                parse_datagram(datagram),
                Ok(packet) if packet.packet_type == PacketType::HandshakeComplete
            )
    }

    /// Process one received datagram
    pub fn handle_datagram_at(&self, datagram: &[u8], peer: SocketAddr, now: Instant) -> Vec<Action> {
        let packet = match parse_datagram(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("Dropping malformed datagram: {}", e);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        let result = match (packet.packet_type, packet.session_id) {
            (PacketType::HandshakeInit, NO_SESSION) => self.handle_init(&packet, peer, now, &mut out),
            (PacketType::HandshakeComplete, _) => self.handle_complete(&packet, now, &mut out),
            (PacketType::HandshakeResponse, _) => self.handle_rekey_response(&packet, now),
            (PacketType::Data, _) => self.handle_data(&packet, peer, now, &mut out),
            (PacketType::Keepalive, _) | (PacketType::Disconnect, _) => {
                self.handle_control(&packet, peer, now, &mut out)
            }
            (other, _) => Err(ProtocolError::InvalidPacketType(other as u8).into()),
        };

        if let Err(e) = result {
            self.record_drop(packet.packet_type, &e);
        }
        out
    }

    fn record_drop(&self, packet_type: PacketType, error: &SessionError) {
        match (packet_type, error) {
            (_, SessionError::Replay(_)) => self.stats.record_replay_blocked(),
            (PacketType::HandshakeInit, _) | (PacketType::HandshakeComplete, _) => {
                self.stats.record_handshake_dropped()
            }
            (_, SessionError::Crypto(_)) | (_, SessionError::Compression(_)) => self.stats.record_error(),
            _ => {}
        }
        trace!("Dropping {:?} packet: {}", packet_type, error);
    }

    fn handle_init(
        &self,
        packet: &Packet,
        peer: SocketAddr,
        now: Instant,
        out: &mut Vec<Action>,
    ) -> Result<(), SessionError> {
        let hello = HandshakeMessage::decode(&packet.payload)?;
        let requested = self.modes.select(&hello.mode).ok_or(SessionError::ModeRejected)?;
        if self.settings.require_auth && hello.username.is_none() {
            return Err(SessionError::AuthFailed);
        }
        // An account's assigned mode wins over the request
        let mode = hello
            .username
            .as_deref()
            .and_then(|user| self.users.as_ref().and_then(|db| db.user_mode(user)))
            .unwrap_or(requested);

        let keypair = KeyPair::generate();
        let shared = derive_shared_secret(&keypair.private, &PublicKey(hello.public_key))?;
        let (key, salt) = derive_session_key(&shared, None, SESSION_INFO)?;
        let cipher = SessionCipher::new(self.settings.cipher, &key)?;

        let features = mode.config().restricted_by(&self.settings.policy);
        let pipeline = Pipeline::new(features, self.settings.padding_target, self.compressor.clone());
        let bucket = TokenBucket::new_at(self.settings.rate_limit, self.settings.burst_size, now);
        let (id, handle) = self.sessions.insert_with(self.settings.max_clients, |id| {
            Session::new_at(id, peer, mode, pipeline, bucket, now)
        })?;

        let mut session = handle.lock();
        match self.admit(&mut session, hello.username, cipher, keypair.public, salt, now) {
            Ok(action) => {
                debug!("Session {:08x} key derived, mode {}", id, mode);
                out.push(action);
                Ok(())
            }
            Err(e) => {
                self.teardown(&mut session);
                Err(e)
            }
        }
    }

    /// Address assignment and key installation for a new session
    fn admit(
        &self,
        session: &mut Session,
        username: Option<String>,
        cipher: SessionCipher,
        public: PublicKey,
        salt: [u8; 32],
        now: Instant,
    ) -> Result<Action, SessionError> {
        let id = session.id;
        session.username = username;

        if let Some(pool) = &self.pool {
            let addr = pool.allocate()?;
            session.vpn_address = Some(addr);
            self.sessions.add_route(addr, id);
        }

        let suite = cipher.suite();
        session.derive_key(SecureChannel::new(id, cipher), now)?;

        let response = HandshakeResponse {
            public_key: public.0,
            salt,
            cipher_id: suite.id(),
            mode: session.mode.name().to_string(),
            vpn_address: session.vpn_address,
        };
        let packet = Packet::new(PacketType::HandshakeResponse, id, 0, response.encode()?)?;
        Ok(Action::Send {
            peer: session.peer,
            datagram: session.pipeline.outbound(&packet)?,
            jitter: Duration::ZERO,
        })
    }

    fn handle_complete(&self, packet: &Packet, now: Instant, out: &mut Vec<Action>) -> Result<(), SessionError> {
        let handle = self.lookup(packet.session_id)?;
        let mut session = handle.lock();
        require_state(&session, SessionState::KeyDerived)?;

        match self.confirm(&mut session, packet, now) {
            Ok(ack) => {
                self.stats.record_connection();
                debug!("Session {:08x} active", session.id);
                out.push(Action::Activated {
                    session_id: session.id,
                    mode: session.mode,
                });
                out.push(ack);
                Ok(())
            }
            Err(e) => {
                self.teardown(&mut session);
                Err(e)
            }
        }
    }

    /// Check key confirmation and credentials, then activate. Returns the
    /// acknowledgement for the client.
    fn confirm(&self, session: &mut Session, packet: &Packet, now: Instant) -> Result<Action, SessionError> {
        let complete = HandshakeComplete::decode(&packet.payload)?;
        let cipher = session.channel().ok_or(SessionError::NoKey)?.cipher();
        if !cipher.verify(&HandshakeComplete::confirm_input(session.id), &complete.confirm) {
            return Err(CryptoError::DecryptionFailed.into());
        }

        let needs_auth = self.settings.require_auth || (session.username.is_some() && self.users.is_some());
        if needs_auth {
            let username = session.username.as_deref().ok_or(SessionError::AuthFailed)?;
            let users = self.users.as_ref().ok_or(SessionError::AuthFailed)?;
            let password = cipher
                .decrypt(&complete.credential)
                .map_err(|_| SessionError::AuthFailed)?;
            let password = std::str::from_utf8(&password).map_err(|_| SessionError::AuthFailed)?;
            if !users.verify_user(username, password) {
                return Err(SessionError::AuthFailed);
            }
        }

        // A per-user slot is only taken once the handshake has proven itself
        if let Some(user) = session.username.as_deref() {
            if !self
                .connections
                .try_connect_with(user, session.id, |sid| self.sessions.contains(sid))
            {
                return Err(SessionError::ConnectionLimit);
            }
            if needs_auth {
                if let Some(users) = &self.users {
                    if let Err(e) = users.record_connection(user) {
                        warn!("Failed to update user database: {}", e);
                    }
                }
            }
        }

        session.activate(now)?;
        let ack = session.channel_mut()?.seal(PacketType::Keepalive, &[])?;
        Ok(Action::Send {
            peer: session.peer,
            datagram: session.pipeline.outbound(&ack)?,
            jitter: Duration::ZERO,
        })
    }

    fn handle_data(
        &self,
        packet: &Packet,
        peer: SocketAddr,
        now: Instant,
        out: &mut Vec<Action>,
    ) -> Result<(), SessionError> {
        let handle = self.lookup(packet.session_id)?;
        let mut session = handle.lock();
        // Nothing is decrypted while a key rotation is in flight
        require_state(&session, SessionState::Active)?;

        let staged = self.open(&mut session, packet, out)?;
        session.peer = peer;
        let plaintext = session.pipeline.decompress(&staged)?;
        session.record_traffic(plaintext.len(), false, now);
        self.stats.record_received(plaintext.len());

        if !plaintext.is_empty() {
            out.push(Action::Deliver {
                session_id: session.id,
                packet: plaintext,
            });
        }
        if session.needs_rekey_at(now) {
            match self.begin_rekey(&mut session, now) {
                Ok(action) => out.push(action),
                Err(e) => debug!("Session {:08x} could not start rekey: {}", session.id, e),
            }
        }
        Ok(())
    }

    fn handle_control(
        &self,
        packet: &Packet,
        peer: SocketAddr,
        now: Instant,
        out: &mut Vec<Action>,
    ) -> Result<(), SessionError> {
        let handle = self.lookup(packet.session_id)?;
        let mut session = handle.lock();
        require_state(&session, SessionState::Active)?;

        self.open(&mut session, packet, out)?;
        session.peer = peer;
        session.touch(now);
        if packet.packet_type == PacketType::Disconnect {
            out.push(self.close(&mut session, CloseReason::Disconnect));
        }
        Ok(())
    }

    /// Decrypt through the session channel, closing the session once too
    /// many consecutive packets fail authentication
    fn open(&self, session: &mut Session, packet: &Packet, out: &mut Vec<Action>) -> Result<Vec<u8>, SessionError> {
        match session.channel_mut()?.open(packet) {
            Ok(staged) => {
                session.clear_decrypt_failures();
                Ok(staged)
            }
            Err(e @ SessionError::Crypto(_)) => {
                if session.record_decrypt_failure() >= self.settings.max_decrypt_failures {
                    out.push(self.close(session, CloseReason::DecryptFailures));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Start a server-initiated key rotation: Active -> Rekeying
    fn begin_rekey(&self, session: &mut Session, now: Instant) -> Result<Action, SessionError> {
        let pending = PendingRekey {
            keypair: KeyPair::generate(),
            salt: generate_salt(),
            started: now,
            attempts: 1,
        };
        let datagram = self.rekey_datagram(session, &pending)?;
        session.begin_rekey(pending)?;
        debug!("Session {:08x} rekeying", session.id);
        Ok(Action::Send {
            peer: session.peer,
            datagram,
            jitter: Duration::ZERO,
        })
    }

    fn rekey_datagram(&self, session: &Session, pending: &PendingRekey) -> Result<Vec<u8>, SessionError> {
        let channel = session.channel().ok_or(SessionError::NoKey)?;
        let public_key = pending.keypair.public.0;
        let mac = channel
            .cipher()
            .sign(&RekeyMessage::signed_input(&public_key, &pending.salt, session.id));
        let message = RekeyMessage {
            public_key,
            salt: pending.salt.to_vec(),
            mac,
        };
        let packet = Packet::new(PacketType::HandshakeInit, session.id, 0, message.encode()?)?;
        session.pipeline.outbound(&packet)
    }

    fn handle_rekey_response(&self, packet: &Packet, now: Instant) -> Result<(), SessionError> {
        let handle = self.lookup(packet.session_id)?;
        let mut session = handle.lock();
        require_state(&session, SessionState::Rekeying)?;

        let reply = RekeyMessage::decode(&packet.payload)?;
        let id = session.id;
        let current = session.channel().ok_or(SessionError::NoKey)?.cipher();
        if !current.verify(&RekeyMessage::signed_input(&reply.public_key, &reply.salt, id), &reply.mac) {
            return Err(CryptoError::DecryptionFailed.into());
        }
        let suite = current.suite();

        let pending = session.pending_rekey().ok_or(SessionError::NoKey)?;
        let shared = derive_shared_secret(&pending.keypair.private, &PublicKey(reply.public_key))?;
        let (key, _) = derive_session_key(&shared, Some(&pending.salt), SESSION_INFO)?;
        let cipher = SessionCipher::new(suite, &key)?;

        session.complete_rekey(SecureChannel::new(id, cipher), now)?;
        self.stats.record_rekey();
        debug!("Session {:08x} rekey complete", id);
        Ok(())
    }

    pub fn send_data(&self, session_id: u32, plaintext: &[u8]) -> Result<Vec<Action>, SessionError> {
        self.send_data_at(session_id, plaintext, Instant::now())
    }

    /// Encrypt a tunnel packet for a session, charging its token bucket
    pub fn send_data_at(&self, session_id: u32, plaintext: &[u8], now: Instant) -> Result<Vec<Action>, SessionError> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(SessionError::PayloadTooLarge(plaintext.len()));
        }
        let handle = self.lookup(session_id)?;
        let mut session = handle.lock();
        require_state(&session, SessionState::Active)?;

        if self.settings.rate_limiting && !session.bucket.try_consume_at(plaintext.len(), now) {
            self.stats.record_rate_limit_hit();
            return Err(SessionError::RateLimited);
        }

        let staged = session.pipeline.compress(plaintext)?;
        let packet = session.channel_mut()?.seal(PacketType::Data, &staged)?;
        let datagram = session.pipeline.outbound(&packet)?;
        session.record_traffic(plaintext.len(), true, now);
        self.stats.record_sent(plaintext.len());

        let mut out = vec![Action::Send {
            peer: session.peer,
            datagram,
            jitter: session.pipeline.jitter(),
        }];
        if session.needs_rekey_at(now) {
            match self.begin_rekey(&mut session, now) {
                Ok(action) => out.push(action),
                Err(e) => debug!("Session {:08x} could not start rekey: {}", session_id, e),
            }
        }
        Ok(out)
    }

    pub fn handle_tunnel_packet(&self, packet: &[u8]) -> Vec<Action> {
        self.handle_tunnel_packet_at(packet, Instant::now())
    }

    /// Route a packet read from the tunnel device to the session owning
    /// its destination address
    pub fn handle_tunnel_packet_at(&self, packet: &[u8], now: Instant) -> Vec<Action> {
        let Some(dest) = ipv4_destination(packet) else {
            trace!("Ignoring non-IPv4 tunnel packet");
            return Vec::new();
        };
        let Some(session_id) = self.sessions.route(dest) else {
            trace!("No session for {}", dest);
            return Vec::new();
        };
        self.send_data_at(session_id, packet, now).unwrap_or_else(|e| {
            trace!("Tunnel packet for {:08x} dropped: {}", session_id, e);
            Vec::new()
        })
    }

    pub fn try_consume(&self, session_id: u32, bytes: usize) -> bool {
        self.sessions
            .get(session_id)
            .map(|handle| handle.lock().bucket.try_consume(bytes))
            .unwrap_or(false)
    }

    /// Override the refill rate of one session
    pub fn set_limit(&self, session_id: u32, bytes_per_sec: u64) -> Result<(), SessionError> {
        self.lookup(session_id)?.lock().bucket.set_limit(bytes_per_sec);
        Ok(())
    }

    pub fn rate_status(&self, session_id: u32) -> Option<RateStatus> {
        self.sessions
            .get(session_id)
            .map(|handle| handle.lock().bucket.status())
    }

    /// Next cover-traffic delay for a session, `None` when it sends none
    pub fn dummy_delay(&self, session_id: u32) -> Option<Duration> {
        let handle = self.sessions.get(session_id)?;
        let session = handle.lock();
        if session.is_closed() {
            return None;
        }
        session.pipeline.timing().next_dummy_delay()
    }

    /// Cover-traffic datagram for an established session
    pub fn dummy_packet(&self, session_id: u32) -> Option<Action> {
        let handle = self.sessions.get(session_id)?;
        let session = handle.lock();
        if !matches!(session.state, SessionState::Active | SessionState::Rekeying)
            || !session.pipeline.timing().dummy_enabled()
        {
            return None;
        }
        match session.pipeline.dummy() {
            Ok(datagram) => Some(Action::Send {
                peer: session.peer,
                datagram,
                jitter: Duration::ZERO,
            }),
            Err(e) => {
                trace!("Dummy packet failed: {}", e);
                None
            }
        }
    }

    pub fn sweep(&self) -> Vec<Action> {
        self.sweep_at(Instant::now())
    }

    /// Expire idle and stalled sessions, start time-based rekeys and
    /// resend unanswered ones
    pub fn sweep_at(&self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        for id in self.sessions.ids() {
            let Some(handle) = self.sessions.get(id) else {
                continue;
            };
            let mut session = handle.lock();
            let state = session.state;

            match state {
                SessionState::Closed => continue,
                SessionState::AwaitingHandshake | SessionState::KeyDerived
                    if session.age_at(now) >= self.settings.handshake_timeout =>
                {
                    self.teardown(&mut session);
                    continue;
                }
                _ => {}
            }
            if session.is_expired_at(now, self.settings.session_timeout) {
                out.push(self.close(&mut session, CloseReason::Timeout));
                continue;
            }

            match state {
                SessionState::Active if session.needs_rekey_at(now) => match self.begin_rekey(&mut session, now) {
                    Ok(action) => out.push(action),
                    Err(e) => debug!("Session {:08x} could not start rekey: {}", id, e),
                },
                SessionState::Rekeying => {
                    if let Some(action) = self.retry_rekey(&mut session, now) {
                        out.push(action);
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn retry_rekey(&self, session: &mut Session, now: Instant) -> Option<Action> {
        let mut pending = session.pending_rekey.take()?;
        if now.saturating_duration_since(pending.started) < self.settings.rekey_retry {
            session.pending_rekey = Some(pending);
            return None;
        }
        if pending.attempts >= self.settings.max_rekey_attempts {
            return Some(self.close(session, CloseReason::Timeout));
        }

        let datagram = self.rekey_datagram(session, &pending);
        pending.attempts += 1;
        pending.started = now;
        session.pending_rekey = Some(pending);
        match datagram {
            Ok(datagram) => Some(Action::Send {
                peer: session.peer,
                datagram,
                jitter: Duration::ZERO,
            }),
            Err(e) => {
                debug!("Session {:08x} rekey resend failed: {}", session.id, e);
                None
            }
        }
    }

    /// Close every session, telling established peers
    pub fn close_all(&self) -> Vec<Action> {
        let mut out = Vec::new();
        for id in self.sessions.ids() {
            let Some(handle) = self.sessions.get(id) else {
                continue;
            };
            let mut session = handle.lock();
            if matches!(session.state, SessionState::Active | SessionState::Rekeying) {
                let notice = session
                    .channel_mut()
                    .and_then(|channel| channel.seal(PacketType::Disconnect, &[]))
                    .and_then(|packet| session.pipeline.outbound(&packet));
                if let Ok(datagram) = notice {
                    out.push(Action::Send {
                        peer: session.peer,
                        datagram,
                        jitter: Duration::ZERO,
                    });
                }
            }
            out.push(self.close(&mut session, CloseReason::Shutdown));
        }
        out
    }

    fn close(&self, session: &mut Session, reason: CloseReason) -> Action {
        debug!("Session {:08x} closed: {:?}", session.id, reason);
        self.teardown(session);
        Action::Closed {
            session_id: session.id,
            reason,
        }
    }

    /// Remove a session and release everything it holds
    fn teardown(&self, session: &mut Session) {
        let established = matches!(session.state, SessionState::Active | SessionState::Rekeying);
        session.close();
        self.sessions.remove(session.id);

        if let Some(addr) = session.vpn_address.take() {
            self.sessions.remove_route(addr);
            if let Some(pool) = &self.pool {
                pool.release(addr);
            }
        }
        if let Some(user) = &session.username {
            self.connections.disconnect(user, session.id);
        }
        if established {
            self.stats.record_disconnection();
        }
    }
}
