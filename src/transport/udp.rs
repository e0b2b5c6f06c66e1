//! tokio UDP socket as a `DatagramSocket`

use super::{DatagramSocket, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, data: &[u8], peer: SocketAddr) -> Result<usize, TransportError> {
        Ok(UdpSocket::send_to(self, data, peer).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(UdpSocket::local_addr(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = DatagramSocket::local_addr(&b).unwrap();

        let socket: &dyn DatagramSocket = &a;
        socket.send_to(b"ping", b_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = DatagramSocket::recv_from(&b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, DatagramSocket::local_addr(&a).unwrap());
    }
}
