//! Privacy modes
//!
//! A mode is picked once per handshake and fixed for the life of the
//! session. Changing mode means a new handshake.

use crate::obfuscation::{ObfuscationConfig, PaddingConfig, ThreatLevel, TimingConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

/// Mean gap between dummy packets when dummy traffic is on
pub const DUMMY_INTERVAL: Duration = Duration::from_secs(30);

/// VPN privacy modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpnMode {
    #[default]
    Normal,
    SemiGhost,
    FullGhost,
}

/// Behaviour toggles of a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeConfig {
    pub obfuscation: bool,
    pub padding: bool,
    pub timing_randomization: bool,
    pub dummy_traffic: bool,
    pub compression: bool,
    pub rekey_interval_bytes: u64,
    pub rekey_interval: Duration,
    /// Send jitter bounds in milliseconds
    pub jitter_ms: (u64, u64),
}

const NORMAL: ModeConfig = ModeConfig {
    obfuscation: false,
    padding: false,
    timing_randomization: false,
    dummy_traffic: false,
    compression: true,
    rekey_interval_bytes: 100 * MIB,
    rekey_interval: Duration::from_secs(3600),
    jitter_ms: (0, 0),
};

const SEMI_GHOST: ModeConfig = ModeConfig {
    obfuscation: true,
    padding: true,
    timing_randomization: true,
    dummy_traffic: false,
    compression: true,
    rekey_interval_bytes: 50 * MIB,
    rekey_interval: Duration::from_secs(1800),
    jitter_ms: (1, 20),
};

const FULL_GHOST: ModeConfig = ModeConfig {
    obfuscation: true,
    padding: true,
    timing_randomization: true,
    dummy_traffic: true,
    compression: false,
    rekey_interval_bytes: 25 * MIB,
    rekey_interval: Duration::from_secs(900),
    jitter_ms: (1, 50),
};

impl VpnMode {
    pub const ALL: [VpnMode; 3] = [VpnMode::Normal, VpnMode::SemiGhost, VpnMode::FullGhost];

    /// Canonical wire name
    pub fn name(self) -> &'static str {
        match self {
            VpnMode::Normal => "normal",
            VpnMode::SemiGhost => "semi_ghost",
            VpnMode::FullGhost => "full_ghost",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            VpnMode::Normal => "Normal Mode",
            VpnMode::SemiGhost => "Semi Ghost Mode",
            VpnMode::FullGhost => "Full Ghost Mode",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            VpnMode::Normal => "Standard VPN mode, fast and secure",
            VpnMode::SemiGhost => "Enhanced privacy with good speed",
            VpnMode::FullGhost => "Maximum stealth, slower",
        }
    }

    pub fn config(self) -> &'static ModeConfig {
        match self {
            VpnMode::Normal => &NORMAL,
            VpnMode::SemiGhost => &SEMI_GHOST,
            VpnMode::FullGhost => &FULL_GHOST,
        }
    }

    /// Obfuscation intensity the mode maps to
    pub fn threat_level(self) -> ThreatLevel {
        match self {
            VpnMode::Normal => ThreatLevel::Normal,
            VpnMode::SemiGhost => ThreatLevel::High,
            VpnMode::FullGhost => ThreatLevel::Critical,
        }
    }

    /// Match a mode name or alias. Case-insensitive; `-` and spaces count
    /// as `_`.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "normal" | "standard" => Some(VpnMode::Normal),
            "semi_ghost" | "semi" | "ghost" | "stealth" => Some(VpnMode::SemiGhost),
            "full_ghost" | "full" | "maximum" | "ultra" => Some(VpnMode::FullGhost),
            _ => None,
        }
    }

    /// Unknown names fall back to Normal
    pub fn resolve(name: &str) -> Self {
        Self::from_name(name).unwrap_or_default()
    }
}

impl fmt::Display for VpnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VpnMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown mode: {s}"))
    }
}

/// Server-wide switches that can veto mode features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeaturePolicy {
    pub obfuscation: bool,
    pub padding: bool,
    pub compression: bool,
}

impl Default for FeaturePolicy {
    fn default() -> Self {
        Self {
            obfuscation: true,
            padding: true,
            compression: true,
        }
    }
}

impl ModeConfig {
    /// A feature stays on only if both the mode and the policy enable it
    pub fn restricted_by(mut self, policy: &FeaturePolicy) -> Self {
        self.obfuscation &= policy.obfuscation;
        self.padding &= policy.padding;
        self.compression &= policy.compression;
        self
    }

    pub fn timing(&self) -> TimingConfig {
        let timing = if self.timing_randomization {
            TimingConfig::jitter(self.jitter_ms.0, self.jitter_ms.1)
        } else {
            TimingConfig::disabled()
        };
        if self.dummy_traffic {
            TimingConfig {
                enabled: true,
                ..timing
            }
            .with_dummy_interval(DUMMY_INTERVAL)
        } else {
            timing
        }
    }

    /// Obfuscator settings for this mode
    pub fn obfuscation(&self, padding_target: usize) -> ObfuscationConfig {
        let padding = if self.padding {
            PaddingConfig::to_target(padding_target)
        } else {
            PaddingConfig::disabled()
        };
        ObfuscationConfig::disabled()
            .with_wrap(self.obfuscation)
            .with_padding(padding)
            .with_timing(self.timing())
    }
}

/// Maps requested mode names to modes under the server's fallback policy
#[derive(Debug, Clone, Copy)]
pub struct ModeManager {
    allow_unknown: bool,
}

impl Default for ModeManager {
    fn default() -> Self {
        Self { allow_unknown: true }
    }
}

impl ModeManager {
    pub fn new(allow_unknown: bool) -> Self {
        Self { allow_unknown }
    }

    /// `None` means the handshake should be dropped
    pub fn select(&self, requested: &str) -> Option<VpnMode> {
        match VpnMode::from_name(requested) {
            Some(mode) => Some(mode),
            None if self.allow_unknown => {
                debug!("unrecognised mode requested, falling back to normal");
                Some(VpnMode::Normal)
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_table() {
        let normal = VpnMode::Normal.config();
        assert!(!normal.obfuscation && !normal.padding && normal.compression);
        assert_eq!(normal.rekey_interval_bytes, 100 * MIB);
        assert_eq!(normal.rekey_interval, Duration::from_secs(3600));

        let semi = VpnMode::SemiGhost.config();
        assert!(semi.obfuscation && semi.padding && semi.timing_randomization);
        assert!(!semi.dummy_traffic);
        assert_eq!(semi.rekey_interval_bytes, 50 * MIB);

        let full = VpnMode::FullGhost.config();
        assert!(full.dummy_traffic && !full.compression);
        assert_eq!(full.rekey_interval_bytes, 25 * MIB);
        assert_eq!(full.rekey_interval, Duration::from_secs(900));
    }

    #[test]
    fn test_aliases() {
        assert_eq!(VpnMode::from_name("Standard"), Some(VpnMode::Normal));
        assert_eq!(VpnMode::from_name("semi-ghost"), Some(VpnMode::SemiGhost));
        assert_eq!(VpnMode::from_name("Semi Ghost"), Some(VpnMode::SemiGhost));
        assert_eq!(VpnMode::from_name("stealth"), Some(VpnMode::SemiGhost));
        assert_eq!(VpnMode::from_name("ULTRA"), Some(VpnMode::FullGhost));
        assert_eq!(VpnMode::from_name("tor_ghost"), None);
        assert_eq!("full".parse::<VpnMode>().unwrap(), VpnMode::FullGhost);
    }

    #[test]
    fn test_unknown_falls_back() {
        assert_eq!(VpnMode::resolve("quantum"), VpnMode::Normal);
        assert_eq!(ModeManager::default().select("quantum"), Some(VpnMode::Normal));
        assert_eq!(ModeManager::new(false).select("quantum"), None);
        assert_eq!(ModeManager::new(false).select("full_ghost"), Some(VpnMode::FullGhost));
    }

    #[test]
    fn test_policy_veto() {
        let policy = FeaturePolicy {
            obfuscation: false,
            padding: true,
            compression: true,
        };
        let effective = VpnMode::SemiGhost.config().restricted_by(&policy);
        assert!(!effective.obfuscation);
        assert!(effective.padding);

        // A policy can only switch features off
        let normal = VpnMode::Normal.config().restricted_by(&FeaturePolicy::default());
        assert!(!normal.padding);
    }

    #[test]
    fn test_obfuscation_settings() {
        let semi = VpnMode::SemiGhost.config().obfuscation(1500);
        assert!(semi.wrap);
        assert_eq!(semi.padding.target_size, 1500);
        assert_eq!(semi.timing.max_jitter_ms, 20);
        assert_eq!(semi.timing.dummy_interval_ms, 0);

        let full = VpnMode::FullGhost.config().obfuscation(1500);
        assert_eq!(full.timing.max_jitter_ms, 50);
        assert_eq!(full.timing.dummy_interval_ms, 30_000);

        let normal = VpnMode::Normal.config().obfuscation(1500);
        assert!(!normal.wrap && !normal.padding.enabled && !normal.timing.enabled);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&VpnMode::SemiGhost).unwrap();
        assert_eq!(json, "\"semi_ghost\"");
        assert_eq!(VpnMode::SemiGhost.threat_level(), ThreatLevel::High);
        assert_eq!(VpnMode::FullGhost.threat_level(), ThreatLevel::Critical);
    }
}
