//! Traffic obfuscation layer
//!
//! Provides:
//! - Pseudo TLS record wrapping
//! - Traffic padding
//! - Timing randomization and dummy traffic scheduling
//!
//! The send path is `encode -> wrap -> pad`. On receive, a datagram that
//! starts with the record marker is unwrapped first; the wrapper (or the
//! packet header) length then bounds the real data so padding falls away.

mod padding;
mod timing;
mod wrapper;

pub use padding::{PaddingConfig, DEFAULT_PADDING_TARGET};
pub use timing::{TimingConfig, TimingObfuscator};
pub use wrapper::{is_wrapped, unwrap, wrap, RECORD_HEADER_LEN, RECORD_MARKER};

use thiserror::Error;

/// Obfuscation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObfuscationError {
    #[error("Malformed record wrapper")]
    MalformedWrapper,

    #[error("Packet too large to wrap: {0} bytes")]
    TooLarge(usize),
}

/// Escalating obfuscation intensity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreatLevel {
    /// Record wrap only
    #[default]
    Normal,
    /// Wrap and pad to the target size
    High,
    /// Wrap and pad; the caller also randomises send timing
    Critical,
}

/// Configuration for traffic obfuscation
#[derive(Debug, Clone)]
pub struct ObfuscationConfig {
    /// Wrap packets in a pseudo TLS record
    pub wrap: bool,
    /// Padding configuration
    pub padding: PaddingConfig,
    /// Timing configuration
    pub timing: TimingConfig,
}

impl ObfuscationConfig {
    /// Everything off
    pub fn disabled() -> Self {
        Self {
            wrap: false,
            padding: PaddingConfig::disabled(),
            timing: TimingConfig::disabled(),
        }
    }

    /// Set record wrapping
    pub fn with_wrap(mut self, wrap: bool) -> Self {
        self.wrap = wrap;
        self
    }

    /// Set padding config
    pub fn with_padding(mut self, padding: PaddingConfig) -> Self {
        self.padding = padding;
        self
    }

    /// Set timing config
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            wrap: true,
            padding: PaddingConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

/// Applies the configured wrap and padding to outgoing datagrams
#[derive(Debug, Clone)]
pub struct Obfuscator {
    config: ObfuscationConfig,
}

impl Obfuscator {
    pub fn new(config: ObfuscationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ObfuscationConfig {
        &self.config
    }

    /// Record-wrap when enabled, identity otherwise
    pub fn obfuscate(&self, packet: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if self.config.wrap {
            wrap(packet)
        } else {
            Ok(packet.to_vec())
        }
    }

    /// Strip the record wrapper
    pub fn deobfuscate(&self, wrapped: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        unwrap(wrapped).map(|inner| inner.to_vec())
    }

    /// Pad to the configured target when padding is enabled
    pub fn pad(&self, packet: Vec<u8>) -> Vec<u8> {
        if self.config.padding.enabled {
            self.config.padding.pad(packet)
        } else {
            packet
        }
    }

    /// Full outbound transform for an encoded packet
    pub fn outbound(&self, packet: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        Ok(self.pad(self.obfuscate(packet)?))
    }

    /// Escalate obfuscation by threat level, independent of the config
    pub fn morph(&self, packet: &[u8], level: ThreatLevel) -> Result<Vec<u8>, ObfuscationError> {
        let wrapped = wrap(packet)?;
        Ok(match level {
            ThreatLevel::Normal => wrapped,
            ThreatLevel::High | ThreatLevel::Critical => {
                pad(wrapped, self.config.padding.target_size)
            }
        })
    }
}

/// Append random bytes until `target_size`; no-op at or above it
pub fn pad(packet: Vec<u8>, target_size: usize) -> Vec<u8> {
    PaddingConfig::to_target(target_size).pad(packet)
}

/// Reverse the outbound transform on a received datagram.
///
/// Datagrams starting with the record marker are unwrapped; anything else is
/// treated as a raw packet whose header length bounds the payload.
pub fn inbound(datagram: &[u8]) -> Result<&[u8], ObfuscationError> {
    if is_wrapped(datagram) {
        unwrap(datagram)
    } else {
        Ok(datagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_disabled() {
        let obfuscator = Obfuscator::new(ObfuscationConfig::disabled());
        assert_eq!(obfuscator.obfuscate(b"PHAZdata").unwrap(), b"PHAZdata");
        assert_eq!(obfuscator.outbound(b"PHAZdata").unwrap(), b"PHAZdata");
    }

    #[test]
    fn test_outbound_inbound() {
        let obfuscator = Obfuscator::new(ObfuscationConfig::default());
        let sent = obfuscator.outbound(b"PHAZ packet bytes").unwrap();

        assert_eq!(sent.len(), DEFAULT_PADDING_TARGET);
        assert_eq!(&sent[..3], &RECORD_MARKER);
        assert_eq!(inbound(&sent).unwrap(), b"PHAZ packet bytes");
    }

    #[test]
    fn test_inbound_raw_passthrough() {
        assert_eq!(inbound(b"PHAZ raw").unwrap(), b"PHAZ raw");
    }

    #[test]
    fn test_morph_levels() {
        let obfuscator = Obfuscator::new(ObfuscationConfig::disabled());
        let normal = obfuscator.morph(b"abc", ThreatLevel::Normal).unwrap();
        assert_eq!(normal.len(), RECORD_HEADER_LEN + 3);

        let high = obfuscator.morph(b"abc", ThreatLevel::High).unwrap();
        assert_eq!(high.len(), DEFAULT_PADDING_TARGET);

        let critical = obfuscator.morph(b"abc", ThreatLevel::Critical).unwrap();
        assert_eq!(critical.len(), DEFAULT_PADDING_TARGET);
        assert_eq!(unwrap(&critical).unwrap(), b"abc");
    }

    #[test]
    fn test_pad_noop_above_target() {
        let big = vec![1u8; 2000];
        assert_eq!(pad(big.clone(), 1500), big);
        assert_eq!(pad(vec![1u8; 10], 100).len(), 100);
    }
}
