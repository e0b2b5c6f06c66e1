//! Size padding: every obfuscated datagram leaves at a fixed length

use crate::crypto::random_bytes;

/// Default pad target, a typical Ethernet MTU
pub const DEFAULT_PADDING_TARGET: usize = 1500;

/// Pads short datagrams with random bytes up to `target_size`
#[derive(Debug, Clone)]
pub struct PaddingConfig {
    /// Pad outgoing datagrams
    pub enabled: bool,
    /// Size every padded datagram is brought up to
    pub target_size: usize,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_size: DEFAULT_PADDING_TARGET,
        }
    }
}

impl PaddingConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            target_size: DEFAULT_PADDING_TARGET,
        }
    }

    pub fn to_target(target_size: usize) -> Self {
        Self {
            enabled: true,
            target_size,
        }
    }

    /// Bytes to add to a datagram of `data_len`; oversize datagrams get none
    pub fn calculate_padding(&self, data_len: usize) -> usize {
        if !self.enabled {
            return 0;
        }
        self.target_size.saturating_sub(data_len)
    }

    /// Append random filler. The receiver strips it using the lengths
    /// carried inside the record and packet headers.
    pub fn pad(&self, mut data: Vec<u8>) -> Vec<u8> {
        let needed = self.calculate_padding(data.len());
        if needed > 0 {
            let start = data.len();
            data.resize(start + needed, 0);
            random_bytes(&mut data[start..]);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_padding() {
        let config = PaddingConfig::to_target(1500);
        assert_eq!(config.calculate_padding(100), 1400);
        assert_eq!(config.calculate_padding(1500), 0);
        assert_eq!(config.calculate_padding(1600), 0);
        assert_eq!(PaddingConfig::disabled().calculate_padding(10), 0);
    }

    #[test]
    fn test_pad_keeps_prefix() {
        let padded = PaddingConfig::to_target(64).pad(b"prefix".to_vec());
        assert_eq!(padded.len(), 64);
        assert_eq!(&padded[..6], b"prefix");
    }

    #[test]
    fn test_padding_is_random() {
        let config = PaddingConfig::to_target(256);
        assert_ne!(config.pad(Vec::new()), config.pad(Vec::new()));
    }
}
