//! I/O boundaries of the protocol core
//!
//! - `DatagramSocket`: where protocol datagrams come from and go to
//! - `TunnelDevice`: the local virtual interface carrying raw IP packets
//!
//! Creating an OS tunnel device is outside this crate; anything that can
//! read and write whole packets can stand in for one.

mod channel;
mod udp;

pub use channel::{ChannelTunnel, TunnelEnds};

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Receive buffer large enough for any datagram
pub const RECV_BUFFER_SIZE: usize = 65536;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Tunnel device closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Unconnected datagram socket
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send_to(&self, data: &[u8], peer: SocketAddr) -> Result<usize, TransportError>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError>;

    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// Packet-oriented virtual network interface
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Next packet the local stack wants to send through the tunnel
    async fn read_packet(&self) -> Result<Vec<u8>, TransportError>;

    /// Hand a packet that came out of the tunnel to the local stack
    async fn write_packet(&self, packet: &[u8]) -> Result<(), TransportError>;
}
