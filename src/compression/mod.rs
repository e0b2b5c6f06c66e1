//! Payload compression
//!
//! Every compressed-path payload carries a one-byte marker: `0x01` for zlib
//! data, `0x00` for raw bytes. Payloads at or below the threshold, and those
//! that would not shrink, are sent raw.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Marker for a raw payload
pub const MARKER_RAW: u8 = 0x00;

/// Marker for a zlib payload
pub const MARKER_COMPRESSED: u8 = 0x01;

/// Payloads larger than this are considered for compression
pub const DEFAULT_THRESHOLD: usize = 100;

/// zlib level
pub const DEFAULT_LEVEL: u32 = 6;

/// Upper bound on inflated output (largest IP datagram)
pub const MAX_DECOMPRESSED_LEN: usize = 65535;

/// Compression errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Compression failed: {0}")]
    CompressionFailed(String),
}

/// Snapshot of compression counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub packets_compressed: u64,
    pub packets_raw: u64,
    pub bytes_in: u64,
    pub bytes_saved: u64,
}

impl CompressionStats {
    /// Fraction of input bytes saved
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            0.0
        } else {
            self.bytes_saved as f64 / self.bytes_in as f64
        }
    }
}

/// Threshold-gated zlib compressor with shared counters
#[derive(Debug)]
pub struct Compressor {
    level: u32,
    threshold: usize,
    packets_compressed: AtomicU64,
    packets_raw: AtomicU64,
    bytes_in: AtomicU64,
    bytes_saved: AtomicU64,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL, DEFAULT_THRESHOLD)
    }
}

impl Compressor {
    pub fn new(level: u32, threshold: usize) -> Self {
        Self {
            level: level.min(9),
            threshold,
            packets_compressed: AtomicU64::new(0),
            packets_raw: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
        }
    }

    /// Compress `payload`, always prefixing the marker byte
    pub fn compress(&self, payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
        self.bytes_in.fetch_add(payload.len() as u64, Ordering::Relaxed);

        if payload.len() > self.threshold {
            let mut enc = ZlibEncoder::new(vec![MARKER_COMPRESSED], Compression::new(self.level));
            enc.write_all(payload)
                .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
            let out = enc
                .finish()
                .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;

            if out.len() <= payload.len() {
                self.packets_compressed.fetch_add(1, Ordering::Relaxed);
                self.bytes_saved
                    .fetch_add((payload.len() + 1 - out.len()) as u64, Ordering::Relaxed);
                return Ok(out);
            }
        }

        self.packets_raw.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(MARKER_RAW);
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Reverse `compress`
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        decompress(data)
    }

    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            packets_compressed: self.packets_compressed.load(Ordering::Relaxed),
            packets_raw: self.packets_raw.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
        }
    }
}

/// Stateless inverse of `Compressor::compress`
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (&marker, body) = data
        .split_first()
        .ok_or_else(|| CompressionError::DecompressionFailed("empty payload".into()))?;

    match marker {
        MARKER_RAW => Ok(body.to_vec()),
        MARKER_COMPRESSED => {
            let mut out = Vec::new();
            ZlibDecoder::new(body)
                .take(MAX_DECOMPRESSED_LEN as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
            if out.len() > MAX_DECOMPRESSED_LEN {
                return Err(CompressionError::DecompressionFailed("output too large".into()));
            }
            Ok(out)
        }
        other => Err(CompressionError::DecompressionFailed(format!(
            "unknown marker {other:#04x}"
        ))),
    }
}
