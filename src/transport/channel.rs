//! In-memory tunnel device over tokio channels

use super::{TransportError, TunnelDevice};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Tunnel device backed by a pair of channels
#[derive(Debug)]
pub struct ChannelTunnel {
    outgoing: Mutex<mpsc::Receiver<Vec<u8>>>,
    delivered: mpsc::Sender<Vec<u8>>,
}

/// The far side of a `ChannelTunnel`
#[derive(Debug)]
pub struct TunnelEnds {
    /// Packets pushed here come out of `read_packet`
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Packets passed to `write_packet` arrive here
    pub delivered: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTunnel {
    pub fn new(capacity: usize) -> (Self, TunnelEnds) {
        let (inject, outgoing) = mpsc::channel(capacity);
        let (delivered_tx, delivered) = mpsc::channel(capacity);
        (
            Self {
                outgoing: Mutex::new(outgoing),
                delivered: delivered_tx,
            },
            TunnelEnds { inject, delivered },
        )
    }
}

#[async_trait]
impl TunnelDevice for ChannelTunnel {
    async fn read_packet(&self) -> Result<Vec<u8>, TransportError> {
        self.outgoing.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), TransportError> {
        self.delivered
            .send(packet.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }
}
