//! Public endpoint discovery over STUN (RFC 5389 Binding)

use crate::crypto::random_bytes;
use crate::transport::{DatagramSocket, TransportError};
use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum NatError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed STUN message")]
    Malformed,

    #[error("No mapped address in STUN response")]
    NoMappedAddress,

    #[error("Could not resolve STUN server {0}")]
    Resolve(String),

    #[error("No STUN server answered")]
    NoResponse,
}

/// 96-bit STUN transaction id
pub type TransactionId = [u8; 12];

/// Binding Request with a fresh transaction id
pub fn binding_request() -> (TransactionId, Vec<u8>) {
    let mut id = [0u8; 12];
    random_bytes(&mut id);

    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(0);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(&id);
    (id, buf.to_vec())
}

/// Extract the mapped address from a Binding Success Response.
/// XOR-MAPPED-ADDRESS is preferred over MAPPED-ADDRESS.
pub fn parse_binding_response(data: &[u8], expected: &TransactionId) -> Result<SocketAddr, NatError> {
    if data.len() < HEADER_LEN {
        return Err(NatError::Malformed);
    }
    let mut header = &data[..HEADER_LEN];
    let msg_type = header.get_u16();
    let msg_len = header.get_u16() as usize;
    let cookie = header.get_u32();
    if msg_type != BINDING_SUCCESS || cookie != MAGIC_COOKIE || &header[..12] != expected {
        return Err(NatError::Malformed);
    }

    let mut attrs = data.get(HEADER_LEN..HEADER_LEN + msg_len).ok_or(NatError::Malformed)?;
    let mut mapped = None;
    while attrs.remaining() >= 4 {
        let attr_type = attrs.get_u16();
        let attr_len = attrs.get_u16() as usize;
        if attrs.remaining() < attr_len {
            return Err(NatError::Malformed);
        }
        let value = &attrs[..attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_address(value, Some(expected)),
            ATTR_MAPPED_ADDRESS => mapped = Some(parse_address(value, None)?),
            _ => {}
        }
        // Attributes are padded to 4 bytes
        let padded = (attr_len + 3) & !3;
        attrs.advance(padded.min(attrs.remaining()));
    }
    mapped.ok_or(NatError::NoMappedAddress)
}

fn parse_address(mut value: &[u8], xor_with: Option<&TransactionId>) -> Result<SocketAddr, NatError> {
    if value.len() < 4 {
        return Err(NatError::Malformed);
    }
    value.advance(1);
    let family = value.get_u8();
    let mut port = value.get_u16();
    let cookie = MAGIC_COOKIE.to_be_bytes();
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match (family, value.len()) {
        (0x01, 4) => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(value);
            if xor_with.is_some() {
                for (byte, mask) in octets.iter_mut().zip(cookie) {
                    *byte ^= mask;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (0x02, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(value);
            if let Some(id) = xor_with {
                let mask = cookie.iter().chain(id.iter());
                for (byte, mask) in octets.iter_mut().zip(mask) {
                    *byte ^= mask;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(NatError::Malformed),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Queries STUN servers in turn until one answers
#[derive(Debug, Clone)]
pub struct StunClient {
    servers: Vec<String>,
    wait: Duration,
}

impl StunClient {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            wait: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Public address of `socket` as seen by the first responsive server.
    /// Must run before anything else reads from the socket.
    pub async fn discover<S>(&self, socket: &S) -> Result<SocketAddr, NatError>
    where
        S: DatagramSocket + ?Sized,
    {
        for server in &self.servers {
            match self.query(socket, server).await {
                Ok(addr) => {
                    debug!("STUN server {} reports {}", server, addr);
                    return Ok(addr);
                }
                Err(e) => debug!("STUN server {} failed: {}", server, e),
            }
        }
        Err(NatError::NoResponse)
    }

    async fn query<S>(&self, socket: &S, server: &str) -> Result<SocketAddr, NatError>
    where
        S: DatagramSocket + ?Sized,
    {
        let local_v4 = socket.local_addr()?.is_ipv4();
        let target = lookup_host(server)
            .await
            .map_err(|_| NatError::Resolve(server.to_string()))?
            .find(|addr| addr.is_ipv4() == local_v4)
            .ok_or_else(|| NatError::Resolve(server.to_string()))?;

        let (id, request) = binding_request();
        socket.send_to(&request, target).await?;

        let deadline = Instant::now() + self.wait;
        let mut buf = [0u8; 1024];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (len, from) = timeout(remaining, socket.recv_from(&mut buf))
                .await
                .map_err(|_| NatError::NoResponse)??;
            if from != target {
                continue;
            }
            match parse_binding_response(&buf[..len], &id) {
                Ok(addr) => return Ok(addr),
                Err(e) => trace!("Ignoring STUN datagram: {}", e),
            }
        }
    }
}
