use crate::error::{Error, Result};

/// Bytes between the start of the network payload and the signature.
/// For generated UDP traffic this is the UDP header.
pub const HEADER_SKIP: usize = 8;

/// Default marker embedded in every generated attack datagram
pub const DEFAULT_SIGNATURE: [u8; 16] = [
    0xA7, 0x7A, 0xC4, 0x3C, 0x5E, 0x55, 0x10, 0x4E, 0x41, 0x54, 0x54, 0x41, 0x43, 0x4B, 0xFE, 0xED,
];

/// Fixed byte sequence that marks a packet as attack traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    bytes: Vec<u8>,
}

impl Signature {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::config("signature", "must not be empty"));
        }
        Ok(Self { bytes })
    }

    /// Parse a signature from a hex string such as `a77ac43c`
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| Error::config("signature", format!("invalid hex: {}", e)))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Minimum payload length that can carry the signature
    pub fn min_payload_len(&self) -> usize {
        HEADER_SKIP + self.bytes.len()
    }

    /// Fixed-offset check: the signature must sit exactly at `HEADER_SKIP`.
    pub fn is_attack(&self, payload: &[u8]) -> bool {
        if payload.len() < self.min_payload_len() {
            return false;
        }
        payload[HEADER_SKIP..self.min_payload_len()] == self.bytes[..]
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self {
            bytes: DEFAULT_SIGNATURE.to_vec(),
        }
    }
}
