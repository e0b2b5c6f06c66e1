//! Session management
//!
//! Session lifecycle:
//! ```text
//! AwaitingHandshake -> KeyDerived -> Active <-> Rekeying
//!                                      |
//!                                    Closed
//! ```
//! Sessions live in a concurrent table keyed by session id. Each session has
//! its own lock; the token bucket and key epoch are only touched under it.

mod channel;
mod pipeline;
mod pool;
mod state;
mod stats;
mod table;

pub use channel::SecureChannel;
pub use pipeline::{parse_datagram, Pipeline};
pub use pool::{AddressPool, Ipv4Net};
pub use state::{CloseReason, PendingRekey, Session, SessionState};
pub use stats::{format_uptime, ConnectionStats, HealthMonitor, HealthReport, HealthStatus, StatsSnapshot};
pub use table::{SessionHandle, SessionTable};

use crate::compression::CompressionError;
use crate::crypto::CryptoError;
use crate::obfuscation::ObfuscationError;
use crate::protocol::{ProtocolError, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use thiserror::Error;

/// Largest tunnel payload that still fits one packet after the compression
/// marker, nonce and tag
pub const MAX_PLAINTEXT: usize = MAX_PAYLOAD_SIZE - 1 - crate::crypto::MIN_CIPHERTEXT_LEN;

/// Smallest datagram worth looking at
pub const MIN_DATAGRAM: usize = HEADER_SIZE;

/// Session errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] ObfuscationError),

    #[error("Unknown session: {0}")]
    UnknownSession(u32),

    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("Session has no key")]
    NoKey,

    #[error("Replayed sequence number: {0}")]
    Replay(u32),

    #[error("Sequence space exhausted")]
    SequenceExhausted,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Connection limit reached")]
    ConnectionLimit,

    #[error("Session table full")]
    TableFull,

    #[error("Address pool exhausted")]
    PoolExhausted,

    #[error("Invalid VPN network: {0}")]
    InvalidNetwork(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Unacceptable mode requested")]
    ModeRejected,

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}
