//! Typed keys for the peer model
//!
//! Two fixed-width values identify a remote device: the 16-byte identity
//! owned by the upper stack (stable across MAC rotation) and the 48-bit
//! BLE device address. Maps are keyed by the typed values; hex rendering
//! happens only at logging and host boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors for identity and address parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Identity must be exactly 16 bytes, got {0}")]
    InvalidLength(usize),
    #[error("Invalid identity hex: {0}")]
    InvalidHex(String),
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),
}

/// Stable 16-byte peer identity provided by the upper stack.
///
/// The engine treats it as an opaque comparable key. The canonical textual
/// form is 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity([u8; 16]);

impl Identity {
    /// Number of raw bytes in an identity
    pub const LEN: usize = 16;

    /// Wrap a raw 16-byte identity
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Construct from a byte slice; fails unless exactly 16 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self(raw))
    }

    /// Parse the 32-character lowercase hex form
    pub fn from_hex(hex: &str) -> Result<Self, IdentityError> {
        if hex.len() != 32 {
            return Err(IdentityError::InvalidHex(hex.to_string()));
        }
        let mut raw = [0u8; 16];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| IdentityError::InvalidHex(hex.to_string()))?;
        }
        Ok(Self(raw))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Canonical 32-character lowercase hex rendering
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// Short prefix for log lines (first 4 bytes as hex)
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// 48-bit BLE device address.
///
/// Ordered as an unsigned integer; the direction arbiter compares two
/// addresses to decide which side dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Wrap raw address bytes (most significant octet first)
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// The address as a 48-bit unsigned integer
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
    }
}

impl fmt::Display for MacAddress {
    /// Colon-separated uppercase hex, the conventional BLE rendering
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(IdentityError::InvalidMac(s.to_string()));
            }
            raw[count] = u8::from_str_radix(part, 16)
                .map_err(|_| IdentityError::InvalidMac(s.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(IdentityError::InvalidMac(s.to_string()));
        }
        Ok(Self(raw))
    }
}
