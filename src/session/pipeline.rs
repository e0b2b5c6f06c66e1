//! Payload and datagram transforms around the secure channel
//!
//! Outbound: compress -> seal -> encode -> wrap -> pad.
//! Inbound: unwrap (if wrapped) -> decode -> open -> decompress.

use super::SessionError;
use crate::compression::{self, Compressor, MARKER_RAW};
use crate::mode::ModeConfig;
use crate::obfuscation::{self, Obfuscator, TimingObfuscator};
use crate::crypto::random_bytes;
use crate::protocol::Packet;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Mode-dependent transforms for one session
#[derive(Debug, Clone)]
pub struct Pipeline {
    features: ModeConfig,
    obfuscator: Obfuscator,
    timing: TimingObfuscator,
    compressor: Arc<Compressor>,
}

impl Pipeline {
    pub fn new(features: ModeConfig, padding_target: usize, compressor: Arc<Compressor>) -> Self {
        let config = features.obfuscation(padding_target);
        Self {
            features,
            timing: TimingObfuscator::new(config.timing.clone()),
            obfuscator: Obfuscator::new(config),
            compressor,
        }
    }

    pub fn features(&self) -> &ModeConfig {
        &self.features
    }

    pub fn timing(&self) -> &TimingObfuscator {
        &self.timing
    }

    /// Plaintext to channel input. The marker byte is always present so
    /// the receiver never needs to know whether compression was on.
    pub fn compress(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if self.features.compression {
            Ok(self.compressor.compress(plaintext)?)
        } else {
            let mut out = Vec::with_capacity(plaintext.len() + 1);
            out.push(MARKER_RAW);
            out.extend_from_slice(plaintext);
            Ok(out)
        }
    }

    /// Channel output to plaintext
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, SessionError> {
        Ok(compression::decompress(data)?)
    }

    /// Encoded packet to datagram
    pub fn outbound(&self, packet: &Packet) -> Result<Vec<u8>, SessionError> {
        let encoded = packet.encode()?;
        Ok(self.obfuscator.outbound(&encoded)?)
    }

    /// Random send delay for this mode
    pub fn jitter(&self) -> Duration {
        self.timing.random_jitter()
    }

    /// Cover-traffic datagram. Random bytes shaped like a real outbound
    /// datagram; the peer fails to decode it and drops it.
    pub fn dummy(&self) -> Result<Vec<u8>, SessionError> {
        let len = rand::thread_rng().gen_range(64..=512);
        let mut noise = vec![0u8; len];
        random_bytes(&mut noise);
        Ok(self.obfuscator.outbound(&noise)?)
    }
}

/// Parse a received datagram regardless of the sender's obfuscation
pub fn parse_datagram(datagram: &[u8]) -> Result<Packet, SessionError> {
    let inner = obfuscation::inbound(datagram)?;
    Ok(Packet::decode(inner)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::VpnMode;
    use crate::protocol::PacketType;

    #[test]
    fn test_datagram_roundtrip_per_mode() {
        for mode in VpnMode::ALL {
            let pipeline = Pipeline::new(*mode.config(), 1500, Arc::new(Compressor::default()));
            let packet = Packet::new(PacketType::Data, 3, 9, &b"payload"[..]).unwrap();

            let datagram = pipeline.outbound(&packet).unwrap();
            if mode.config().padding {
                assert_eq!(datagram.len(), 1500);
            } else {
                assert_eq!(datagram.len(), packet.encoded_size());
            }
            assert_eq!(parse_datagram(&datagram).unwrap(), packet);
        }
    }

    #[test]
    fn test_compression_marker_always_present() {
        let text = b"abcabcabcabc".repeat(20);
        for mode in VpnMode::ALL {
            let pipeline = Pipeline::new(*mode.config(), 1500, Arc::new(Compressor::default()));
            let staged = pipeline.compress(&text).unwrap();
            assert_eq!(pipeline.decompress(&staged).unwrap(), text);
            if !mode.config().compression {
                assert_eq!(staged[0], MARKER_RAW);
            }
        }
    }

    #[test]
    fn test_dummy_is_dropped_by_parser() {
        let pipeline = Pipeline::new(*VpnMode::FullGhost.config(), 1500, Arc::new(Compressor::default()));
        for _ in 0..20 {
            let dummy = pipeline.dummy().unwrap();
            assert_eq!(dummy.len(), 1500);
            assert!(crate::obfuscation::is_wrapped(&dummy));
            assert!(parse_datagram(&dummy).is_err());
        }
    }

    #[test]
    fn test_malformed_datagram() {
        assert!(parse_datagram(&[0x16, 0x03, 0x03, 0xFF, 0xFF]).is_err());
        assert!(parse_datagram(b"garbage").is_err());
    }
}
