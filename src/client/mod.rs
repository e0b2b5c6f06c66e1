//! Client endpoint
//!
//! `ClientSession` is the sans-IO client half of the protocol: it builds the
//! handshake, answers server-initiated rekeys and seals/opens tunnel data.
//! `connect` drives the handshake over a [`DatagramSocket`].

use crate::compression::Compressor;
use crate::crypto::{
    derive_session_key, derive_shared_secret, CipherSuite, CryptoError, KeyPair, PublicKey, SessionCipher,
    SESSION_INFO,
};
use crate::mode::VpnMode;
use crate::obfuscation::DEFAULT_PADDING_TARGET;
use crate::protocol::{
    HandshakeComplete, HandshakeMessage, HandshakeResponse, Packet, PacketType, ProtocolError, RekeyMessage,
    NO_SESSION,
};
use crate::session::{parse_datagram, Pipeline, SecureChannel, SessionError, MAX_PLAINTEXT};
use crate::transport::{DatagramSocket, RECV_BUFFER_SIZE};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

/// What the client asks for in its handshake
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Requested mode name, sent verbatim
    pub mode: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub padding_target: usize,
}

impl ClientOptions {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            username: None,
            password: None,
            padding_target: DEFAULT_PADDING_TARGET,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    /// INIT sent
    AwaitingResponse,
    /// COMPLETE sent, waiting for the first authenticated packet
    AwaitingAck,
    Connected,
    Closed,
}

/// Results of feeding a datagram to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Datagram to send to the server
    Send(Vec<u8>),
    Connected {
        session_id: u32,
        mode: VpnMode,
        vpn_address: Option<Ipv4Addr>,
    },
    Data(Vec<u8>),
    /// A new key was installed
    Rekeyed,
    Disconnected,
}

/// Last rekey answer, kept so a resent offer gets the same reply
#[derive(Debug)]
struct RekeyReply {
    server_key: [u8; 32],
    datagram: Vec<u8>,
}

#[derive(Debug)]
pub struct ClientSession {
    options: ClientOptions,
    state: ClientState,
    keypair: Option<KeyPair>,
    session_id: u32,
    mode: VpnMode,
    vpn_address: Option<Ipv4Addr>,
    channel: Option<SecureChannel>,
    pipeline: Pipeline,
    compressor: Arc<Compressor>,
    last_rekey: Option<RekeyReply>,
    rekeys: u32,
}

impl ClientSession {
    pub fn new(options: ClientOptions) -> Self {
        let mode = VpnMode::resolve(&options.mode);
        let compressor = Arc::new(Compressor::default());
        Self {
            pipeline: Pipeline::new(*mode.config(), options.padding_target, compressor.clone()),
            options,
            state: ClientState::Idle,
            keypair: None,
            session_id: NO_SESSION,
            mode,
            vpn_address: None,
            channel: None,
            compressor,
            last_rekey: None,
            rekeys: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Mode in effect; the server's choice once the handshake answered
    pub fn mode(&self) -> VpnMode {
        self.mode
    }

    pub fn vpn_address(&self) -> Option<Ipv4Addr> {
        self.vpn_address
    }

    pub fn rekeys(&self) -> u32 {
        self.rekeys
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.channel.as_ref().map(|channel| channel.cipher().suite())
    }

    /// Send delay for the next datagram
    pub fn jitter(&self) -> Duration {
        self.pipeline.jitter()
    }

    fn use_mode(&mut self, mode: VpnMode) {
        self.mode = mode;
        self.pipeline = Pipeline::new(*mode.config(), self.options.padding_target, self.compressor.clone());
    }

    /// Start (or restart) the handshake. Returns the INIT datagram.
    pub fn initiate(&mut self) -> Result<Vec<u8>, SessionError> {
        let keypair = KeyPair::generate();
        let mut hello = HandshakeMessage::new(keypair.public.0).with_mode(self.options.mode.clone());
        if let Some(user) = &self.options.username {
            hello = hello.with_username(user.clone());
        }

        let packet = Packet::new(PacketType::HandshakeInit, NO_SESSION, 0, hello.encode()?)?;
        let datagram = self.pipeline.outbound(&packet)?;

        self.keypair = Some(keypair);
        self.session_id = NO_SESSION;
        self.channel = None;
        self.last_rekey = None;
        self.vpn_address = None;
        self.state = ClientState::AwaitingResponse;
        Ok(datagram)
    }

    /// Process one datagram from the server
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> Result<Vec<ClientEvent>, SessionError> {
        let packet = parse_datagram(datagram)?;
        match (self.state, packet.packet_type) {
            (ClientState::AwaitingResponse, PacketType::HandshakeResponse) => self.handle_response(&packet),
            (ClientState::AwaitingAck, _) | (ClientState::Connected, _) => {
                if packet.session_id != self.session_id {
                    return Err(SessionError::UnknownSession(packet.session_id));
                }
                self.handle_established(&packet)
            }
            (state, packet_type) => {
                trace!("Ignoring {:?} in state {:?}", packet_type, state);
                Ok(Vec::new())
            }
        }
    }

    fn handle_response(&mut self, packet: &Packet) -> Result<Vec<ClientEvent>, SessionError> {
        let response = HandshakeResponse::decode(&packet.payload)?;
        let keypair = self.keypair.as_ref().ok_or(SessionError::NoKey)?;
        let suite = CipherSuite::from_id(response.cipher_id)?;

        let shared = derive_shared_secret(&keypair.private, &PublicKey(response.public_key))?;
        let (key, _) = derive_session_key(&shared, Some(&response.salt), SESSION_INFO)?;
        let cipher = SessionCipher::new(suite, &key)?;

        let session_id = packet.session_id;
        let confirm = cipher.sign(&HandshakeComplete::confirm_input(session_id));
        let credential = match &self.options.password {
            Some(password) => cipher.encrypt(password.as_bytes())?,
            None => Vec::new(),
        };
        let complete = HandshakeComplete { confirm, credential };

        self.use_mode(VpnMode::resolve(&response.mode));
        let packet = Packet::new(PacketType::HandshakeComplete, session_id, 0, complete.encode()?)?;
        let datagram = self.pipeline.outbound(&packet)?;

        self.keypair = None;
        self.session_id = session_id;
        self.vpn_address = response.vpn_address;
        self.channel = Some(SecureChannel::new(session_id, cipher));
        self.state = ClientState::AwaitingAck;
        debug!("Handshake answered, session {:08x}, mode {}", session_id, self.mode);
        Ok(vec![ClientEvent::Send(datagram)])
    }

    fn handle_established(&mut self, packet: &Packet) -> Result<Vec<ClientEvent>, SessionError> {
        if packet.packet_type == PacketType::HandshakeInit {
            return self.handle_rekey(packet);
        }

        let channel = self.channel.as_mut().ok_or(SessionError::NoKey)?;
        let opened = match packet.packet_type {
            PacketType::Data | PacketType::Keepalive | PacketType::Disconnect => channel.open(packet)?,
            other => return Err(ProtocolError::InvalidPacketType(other as u8).into()),
        };

        let mut events = Vec::new();
        if self.state == ClientState::AwaitingAck {
            self.state = ClientState::Connected;
            debug!("Session {:08x} established", self.session_id);
            events.push(ClientEvent::Connected {
                session_id: self.session_id,
                mode: self.mode,
                vpn_address: self.vpn_address,
            });
        }

        match packet.packet_type {
            PacketType::Data => {
                let plaintext = self.pipeline.decompress(&opened)?;
                if !plaintext.is_empty() {
                    events.push(ClientEvent::Data(plaintext));
                }
            }
            PacketType::Disconnect => {
                self.close();
                events.push(ClientEvent::Disconnected);
            }
            _ => {}
        }
        Ok(events)
    }

    /// Answer a server rekey offer and switch to the new key
    fn handle_rekey(&mut self, packet: &Packet) -> Result<Vec<ClientEvent>, SessionError> {
        let offer = RekeyMessage::decode(&packet.payload)?;
        if let Some(previous) = &self.last_rekey {
            if previous.server_key == offer.public_key {
                return Ok(vec![ClientEvent::Send(previous.datagram.clone())]);
            }
        }

        let session_id = self.session_id;
        let current = self.channel.as_ref().ok_or(SessionError::NoKey)?.cipher();
        if !current.verify(
            &RekeyMessage::signed_input(&offer.public_key, &offer.salt, session_id),
            &offer.mac,
        ) {
            return Err(CryptoError::DecryptionFailed.into());
        }
        let salt: [u8; 32] = offer
            .salt
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::TruncatedField("salt"))?;

        let keypair = KeyPair::generate();
        let shared = derive_shared_secret(&keypair.private, &PublicKey(offer.public_key))?;
        let (key, _) = derive_session_key(&shared, Some(&salt), SESSION_INFO)?;
        let cipher = SessionCipher::new(current.suite(), &key)?;

        let reply = RekeyMessage {
            public_key: keypair.public.0,
            salt: Vec::new(),
            mac: current.sign(&RekeyMessage::signed_input(&keypair.public.0, &[], session_id)),
        };
        let packet = Packet::new(PacketType::HandshakeResponse, session_id, 0, reply.encode()?)?;
        let datagram = self.pipeline.outbound(&packet)?;

        self.channel = Some(SecureChannel::new(session_id, cipher));
        self.last_rekey = Some(RekeyReply {
            server_key: offer.public_key,
            datagram: datagram.clone(),
        });
        self.rekeys += 1;
        debug!("Session {:08x} rekeyed", session_id);
        Ok(vec![ClientEvent::Send(datagram), ClientEvent::Rekeyed])
    }

    fn seal(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        if self.state != ClientState::Connected {
            return Err(SessionError::NoKey);
        }
        let channel = self.channel.as_mut().ok_or(SessionError::NoKey)?;
        let packet = channel.seal(packet_type, payload)?;
        self.pipeline.outbound(&packet)
    }

    /// Tunnel packet to DATA datagram
    pub fn seal_data(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(SessionError::PayloadTooLarge(plaintext.len()));
        }
        let staged = self.pipeline.compress(plaintext)?;
        self.seal(PacketType::Data, &staged)
    }

    pub fn keepalive(&mut self) -> Result<Vec<u8>, SessionError> {
        self.seal(PacketType::Keepalive, &[])
    }

    /// DISCONNECT datagram; the session is closed afterwards
    pub fn disconnect(&mut self) -> Result<Vec<u8>, SessionError> {
        let datagram = self.seal(PacketType::Disconnect, &[])?;
        self.close();
        Ok(datagram)
    }

    fn close(&mut self) {
        self.state = ClientState::Closed;
        self.channel = None;
        self.last_rekey = None;
    }
}

/// Run the handshake against `server`, retrying with a fresh INIT when no
/// answer arrives within `wait`.
pub async fn connect<S>(
    socket: &S,
    server: SocketAddr,
    session: &mut ClientSession,
    wait: Duration,
    attempts: u32,
) -> Result<ClientEvent, crate::Error>
where
    S: DatagramSocket + ?Sized,
{
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    for attempt in 1..=attempts.max(1) {
        debug!("Handshake attempt {}", attempt);
        let init = session.initiate()?;
        socket.send_to(&init, server).await?;

        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(received) = timeout(remaining, socket.recv_from(&mut buf)).await else {
                break;
            };
            let (len, from) = received?;
            if from != server {
                continue;
            }
            let events = match session.handle_datagram(&buf[..len]) {
                Ok(events) => events,
                Err(e) => {
                    trace!("Ignoring datagram during handshake: {}", e);
                    continue;
                }
            };
            for event in events {
                match event {
                    ClientEvent::Send(datagram) => {
                        socket.send_to(&datagram, server).await?;
                    }
                    connected @ ClientEvent::Connected { .. } => return Ok(connected),
                    _ => {}
                }
            }
        }
    }
    Err(crate::Error::Timeout)
}
