//! # PhazeVPN
//!
//! Core of the PhazeVPN tunneling protocol: a UDP datagram protocol that
//! carries raw IP packets between clients and a server.
//!
//! ## Features
//!
//! - **X25519 key exchange** with HKDF-SHA256 session keys
//! - **AEAD packet protection** (ChaCha20-Poly1305 or AES-256-GCM)
//! - **Replay protection** with a sliding window per session
//! - **Periodic rekeying** by time and by traffic volume
//! - **Three privacy modes** controlling padding, TLS-like wrapping,
//!   timing jitter and cover traffic
//! - **Per-session rate limiting** and per-user connection limits
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Server / Client                      │
//! │       (handshake, rekey, routing, accounting)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Session Layer                       │
//! │     (state machine, AEAD channel, replay window)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Pipeline Layer                      │
//! │   (compression, padding, record wrapping, jitter)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Packet Codec                        │
//! │             (16-byte header, payload)                │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport                           │
//! │          (UDP socket, tunnel device)                 │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod limiter;
pub mod mode;
pub mod nat;
pub mod obfuscation;
pub mod protocol;
pub mod replay;
pub mod server;
pub mod session;
pub mod transport;
pub mod users;

pub use config::Config;
pub use mode::VpnMode;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("User database error: {0}")]
    Users(#[from] users::UserError),

    #[error("NAT traversal error: {0}")]
    Nat(#[from] nat::NatError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout")]
    Timeout,
}
